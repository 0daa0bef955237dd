//! Per-field resolution.
//!
//! [`RequestScope`] picks the strategy of every field from the frozen
//! [`FieldDispatchRegistry`](crate::registry::FieldDispatchRegistry) and
//! returns a future for its value. Nothing is sent while the futures are
//! created: fetches are queued on the request's [`BatchDispatcher`] and go
//! out when [`RequestScope::drive`] finds the level blocked on them.

use crate::dataloader::{walk, BatchDispatcher, BatchKey, FetchDescriptor};
use crate::document::{DownstreamRewriter, FieldSelection};
use crate::entity::{EntityResolver, EntityTarget};
use crate::error::{Error, GraphQLError, Result};
use crate::executor::QueryExecutorPool;
use crate::graph::{FieldCoordinate, ServiceId};
use crate::merge::UnifiedGraph;
use crate::middleware::RequestContext;
use crate::registry::{ResolutionContext, ResolverArgumentSpec};
use crate::types::{OperationKind, PathSegment};
use async_graphql::{indexmap::IndexMap, Value as GqlValue};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// Value of one field plus the downstream errors found under it. Error
/// paths are relative to the field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolved {
    pub value: GqlValue,
    pub errors: Vec<GraphQLError>,
}

impl Resolved {
    pub fn value(value: GqlValue) -> Self {
        Self {
            value,
            errors: Vec::new(),
        }
    }
}

/// What the resolver knows about the field being resolved.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub operation: OperationKind,
    /// The client's selection, variables substituted and fragments inlined.
    pub field: FieldSelection,
    /// Static namespace fields between the operation root and this field.
    pub static_prefix: Vec<String>,
    /// Service the parent object was fetched from; `None` at the root and
    /// under static namespaces.
    pub parent_service: Option<ServiceId>,
}

impl FieldInfo {
    fn parent_from(&self, service: &ServiceId) -> bool {
        self.parent_service.as_ref() == Some(service)
    }
}

/// Resolution state of one request.
#[derive(Clone, Debug)]
pub struct RequestScope {
    graph: Arc<UnifiedGraph>,
    dispatcher: Arc<BatchDispatcher>,
    entities: EntityResolver,
}

impl RequestScope {
    pub fn new(
        graph: Arc<UnifiedGraph>,
        executors: Arc<QueryExecutorPool>,
        context: Arc<RequestContext>,
        timeout: Option<Duration>,
    ) -> Self {
        let dispatcher = Arc::new(BatchDispatcher::new(executors, context, timeout));
        Self {
            graph,
            entities: EntityResolver::new(dispatcher.clone()),
            dispatcher,
        }
    }

    pub fn graph(&self) -> &UnifiedGraph {
        &self.graph
    }

    /// Future of the value of `coordinate` on `source`.
    pub fn resolve(
        &self,
        coordinate: &FieldCoordinate,
        source: &GqlValue,
        arguments: Vec<(String, GqlValue)>,
        info: &FieldInfo,
    ) -> BoxFuture<'static, Result<Resolved>> {
        let Some(context) = self.graph.resolution(coordinate) else {
            let err = Error::InvalidRequest(format!("`{coordinate}` is not part of the schema"));
            return future::ready(Err(err)).boxed();
        };

        match context {
            ResolutionContext::Static => {
                future::ready(Ok(Resolved::value(GqlValue::Object(IndexMap::new())))).boxed()
            }
            ResolutionContext::Owned(service) => {
                if self.fetches_directly(&coordinate.type_name, info) {
                    self.fetch_field(service, coordinate, arguments, info)
                } else {
                    self.from_parent(service, coordinate, source, arguments, info)
                }
            }
            ResolutionContext::EntityExtension(spec) => {
                if info.parent_from(&spec.service) {
                    if let Some(value) = read_parent(source, info) {
                        return future::ready(Ok(Resolved::value(value))).boxed();
                    }
                }
                let field = self.downstream_field(&spec.service, coordinate, arguments, info);
                self.entities
                    .resolve(EntityTarget::extension(spec, &coordinate.field_name), source, field)
            }
            ResolutionContext::ResolverArgument(spec) => {
                self.fetch_with_arguments(spec.clone(), coordinate, arguments, info)
            }
        }
    }

    /// Send every queued fetch. Returns the number of downstream calls.
    pub async fn dispatch(&self) -> usize {
        self.dispatcher.dispatch().await
    }

    /// Run the futures of one level to completion, dispatching queued
    /// fetches whenever the level is blocked on them.
    pub async fn drive<T: Send + 'static>(&self, futures: Vec<BoxFuture<'static, T>>) -> Vec<T> {
        let mut level = std::pin::pin!(join_all(futures));
        loop {
            if let Poll::Ready(values) = futures::poll!(level.as_mut()) {
                return values;
            }
            if !self.dispatcher.has_pending() {
                return level.await;
            }
            let calls = self.dispatcher.dispatch().await;
            tracing::trace!(calls, "dispatched level");
        }
    }

    fn fetches_directly(&self, type_name: &str, info: &FieldInfo) -> bool {
        self.graph.is_operation_root(type_name) || !info.static_prefix.is_empty()
    }

    fn downstream_field(
        &self,
        service: &ServiceId,
        coordinate: &FieldCoordinate,
        arguments: Vec<(String, GqlValue)>,
        info: &FieldInfo,
    ) -> FieldSelection {
        let selections = match self.graph.field(coordinate) {
            Some(def) => DownstreamRewriter::new(&self.graph, service)
                .rewrite(&info.field.selections, def.ty.named_type()),
            None => Vec::new(),
        };
        FieldSelection {
            alias: None,
            name: coordinate.field_name.clone(),
            arguments,
            selections,
        }
    }

    fn fetch_field(
        &self,
        service: &ServiceId,
        coordinate: &FieldCoordinate,
        arguments: Vec<(String, GqlValue)>,
        info: &FieldInfo,
    ) -> BoxFuture<'static, Result<Resolved>> {
        let field = self.downstream_field(service, coordinate, arguments, info);
        let pending = self.dispatcher.register(
            BatchKey::Field {
                service: service.clone(),
                operation: info.operation,
            },
            FetchDescriptor::Field {
                prefix: info.static_prefix.clone(),
                field,
            },
        );
        async move {
            let outcome = pending.await?;
            Ok(Resolved {
                value: outcome.data.unwrap_or(GqlValue::Null),
                errors: outcome.errors,
            })
        }
        .boxed()
    }

    /// Field of an object returned by an earlier fetch. When the parent came
    /// from a service extending the entity, only its key is there and the
    /// field is fetched from the base service.
    fn from_parent(
        &self,
        service: &ServiceId,
        coordinate: &FieldCoordinate,
        source: &GqlValue,
        arguments: Vec<(String, GqlValue)>,
        info: &FieldInfo,
    ) -> BoxFuture<'static, Result<Resolved>> {
        let from_owner = info.parent_service.is_none() || info.parent_from(service);
        if from_owner {
            if let Some(value) = read_parent(source, info) {
                return future::ready(Ok(Resolved::value(value))).boxed();
            }
        }

        let base = self
            .graph
            .federation()
            .entity(&coordinate.type_name)
            .filter(|entity| &entity.service == service);
        match base {
            Some(entity) => {
                let target = EntityTarget::base(entity);
                let field = self.downstream_field(service, coordinate, arguments, info);
                self.entities.resolve(target, source, field)
            }
            None => {
                tracing::debug!(field = %coordinate, "parent object carries no value for field");
                future::ready(Ok(Resolved::value(GqlValue::Null))).boxed()
            }
        }
    }

    fn fetch_with_arguments(
        &self,
        spec: Arc<ResolverArgumentSpec>,
        coordinate: &FieldCoordinate,
        arguments: Vec<(String, GqlValue)>,
        info: &FieldInfo,
    ) -> BoxFuture<'static, Result<Resolved>> {
        let sources: Vec<_> = spec
            .sources
            .iter()
            .map(|source| {
                let pending = self.dispatcher.register(
                    BatchKey::Field {
                        service: source.service.clone(),
                        operation: OperationKind::Query,
                    },
                    FetchDescriptor::Field {
                        prefix: Vec::new(),
                        field: source.selection.clone(),
                    },
                );
                let path: Vec<PathSegment> = source.path.iter().map(|p| PathSegment::from(p.as_str())).collect();
                (source.argument.clone(), path, pending)
            })
            .collect();

        let scope = self.clone();
        let coordinate = coordinate.clone();
        let info = info.clone();
        async move {
            let mut arguments = arguments;
            let mut errors = Vec::new();
            for (argument, path, pending) in sources {
                let outcome = pending.await?;
                errors.extend(outcome.errors.into_iter().map(|e| e.with_path(Vec::new())));
                let value = outcome
                    .data
                    .as_ref()
                    .and_then(|data| walk(data, &path))
                    .cloned()
                    .unwrap_or(GqlValue::Null);
                tracing::debug!(field = %coordinate, argument = %argument, "resolved argument");
                arguments.retain(|(name, _)| name != &argument);
                arguments.push((argument, value));
            }

            let mut resolved = scope.fetch_field(&spec.owner, &coordinate, arguments, &info).await?;
            errors.append(&mut resolved.errors);
            resolved.errors = errors;
            Ok(resolved)
        }
        .boxed()
    }
}

fn read_parent(source: &GqlValue, info: &FieldInfo) -> Option<GqlValue> {
    match source {
        GqlValue::Object(map) => map.get(info.field.response_key()).cloned(),
        _ => None,
    }
}
