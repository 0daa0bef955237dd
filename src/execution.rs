//! Operation execution.
//!
//! Operations are executed level by level. All fields of one depth are
//! turned into resolver futures first, then driven together so that every
//! fetch of the level lands in the same batch. Completed composite values
//! become the objects of the next level.
//!
//! Null propagation follows GraphQL: a null in a non-null position nulls the
//! closest nullable ancestor.

use crate::document::{from_ast, inline_fragments, FieldSelection, Fragments, Selection, Variables, TYPENAME};
use crate::error::{Error, GraphQLError, Result};
use crate::executor::QueryExecutorPool;
use crate::graph::{FieldCoordinate, ServiceId, TypeKind, TypeRef};
use crate::merge::UnifiedGraph;
use crate::middleware::RequestContext;
use crate::registry::ResolutionContext;
use crate::resolve::{FieldInfo, RequestScope, Resolved};
use crate::types::{GraphQLRequest, GraphQLResponse, OperationKind, PathSegment};
use async_graphql::parser::parse_query;
use async_graphql::parser::types::{DocumentOperations, OperationDefinition, OperationType};
use async_graphql::{indexmap::IndexMap, Name, Positioned, Value as GqlValue};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Shared, read-only state every request is executed with.
#[derive(Clone, Debug)]
pub struct ExecutionEnvironment {
    pub graph: Arc<UnifiedGraph>,
    pub executors: Arc<QueryExecutorPool>,
    pub batch_timeout: Option<Duration>,
}

/// Execute one client request.
#[tracing::instrument(skip_all, fields(operation = request.operation_name.as_deref().unwrap_or("")))]
pub async fn execute(env: &ExecutionEnvironment, request: &GraphQLRequest, context: RequestContext) -> GraphQLResponse {
    let prepared = match prepare(env, request) {
        Ok(prepared) => prepared,
        Err(err) => {
            tracing::debug!(error = %err, "rejected request");
            return GraphQLResponse::error(err.to_graphql_error());
        }
    };

    let scope = RequestScope::new(
        env.graph.clone(),
        env.executors.clone(),
        Arc::new(context),
        env.batch_timeout,
    );
    let execution = Execution {
        scope,
        operation: prepared.kind,
        data: GqlValue::Object(IndexMap::new()),
        errors: Vec::new(),
        non_null: HashSet::new(),
    };
    execution.run(prepared.root_type, prepared.selections).await
}

struct PreparedOperation {
    kind: OperationKind,
    root_type: String,
    selections: Vec<Selection>,
}

fn prepare(env: &ExecutionEnvironment, request: &GraphQLRequest) -> Result<PreparedOperation> {
    let document =
        parse_query(&request.query).map_err(|e| Error::InvalidRequest(format!("failed to parse query: {e}")))?;

    let operation = select_operation(&document.operations, request.operation_name.as_deref())?;
    let kind = match operation.ty {
        OperationType::Query => OperationKind::Query,
        OperationType::Mutation => OperationKind::Mutation,
        OperationType::Subscription => {
            return Err(Error::InvalidRequest("subscriptions are not supported".to_string()))
        }
    };
    let root_type = env
        .graph
        .root_type(kind)
        .ok_or_else(|| Error::InvalidRequest(format!("the schema has no {} type", kind.keyword())))?
        .to_string();

    let variables = variables(operation, request)?;
    let fragments = Fragments::from_ast(&document.fragments, &variables)?;
    let selections = from_ast(&operation.selection_set.node, &variables)?;

    Ok(PreparedOperation {
        kind,
        root_type,
        selections: inline_fragments(&selections, &fragments),
    })
}

fn select_operation<'a>(
    operations: &'a DocumentOperations,
    name: Option<&str>,
) -> Result<&'a OperationDefinition> {
    match (operations, name) {
        (DocumentOperations::Single(operation), _) => Ok(&operation.node),
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .get(name)
            .map(|operation| &operation.node)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown operation `{name}`"))),
        (DocumentOperations::Multiple(operations), None) if operations.len() == 1 => operations
            .values()
            .next()
            .map(|operation: &Positioned<OperationDefinition>| &operation.node)
            .ok_or_else(|| Error::InvalidRequest("the document has no operation".to_string())),
        (DocumentOperations::Multiple(_), None) => Err(Error::InvalidRequest(
            "an operation name is required when the document has several operations".to_string(),
        )),
    }
}

/// Coerce the request variables against the operation's definitions.
fn variables(operation: &OperationDefinition, request: &GraphQLRequest) -> Result<Variables> {
    let mut out = Variables::new();
    for definition in &operation.variable_definitions {
        let definition = &definition.node;
        let name = definition.name.node.clone();
        let value = match request.variables.get(name.as_str()) {
            Some(json) => GqlValue::from_json(json.clone())?,
            None => match &definition.default_value {
                Some(default) => default.node.clone(),
                None if !definition.var_type.node.nullable => {
                    return Err(Error::InvalidRequest(format!(
                        "variable `${name}` of type `{}` was not provided",
                        definition.var_type.node
                    )))
                }
                None => GqlValue::Null,
            },
        };
        out.insert(name, value);
    }
    Ok(out)
}

/// An object whose selection set is resolved on the next level.
struct ObjectSlot {
    path: Vec<PathSegment>,
    type_name: String,
    selections: Vec<Selection>,
    source: GqlValue,
    static_prefix: Vec<String>,
    /// Service that produced `source`.
    origin: Option<ServiceId>,
}

struct FieldCall {
    coordinate: FieldCoordinate,
    source: Arc<GqlValue>,
    info: FieldInfo,
}

struct PendingField {
    path: Vec<PathSegment>,
    field: FieldSelection,
    ty: TypeRef,
    /// Static prefix handed to the children of this field.
    child_prefix: Vec<String>,
    service: Option<ServiceId>,
}

struct Execution {
    scope: RequestScope,
    operation: OperationKind,
    data: GqlValue,
    errors: Vec<GraphQLError>,
    non_null: HashSet<Vec<PathSegment>>,
}

impl Execution {
    async fn run(mut self, root_type: String, selections: Vec<Selection>) -> GraphQLResponse {
        let mut level = vec![ObjectSlot {
            path: Vec::new(),
            type_name: root_type,
            selections,
            source: GqlValue::Object(IndexMap::new()),
            static_prefix: Vec::new(),
            origin: None,
        }];

        let mut depth = 0usize;
        while !level.is_empty() {
            let mut pending = Vec::new();
            let mut calls = Vec::new();
            for slot in level {
                self.start_slot(slot, &mut pending, &mut calls);
            }

            tracing::trace!(depth, fields = pending.len(), "executing level");
            // Root mutation fields run one after the other.
            let results = if self.operation == OperationKind::Mutation && depth == 0 {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    let future = self.call(call);
                    results.extend(self.scope.drive(vec![future]).await);
                }
                results
            } else {
                let futures = calls.into_iter().map(|call| self.call(call)).collect();
                self.scope.drive(futures).await
            };

            let mut next = Vec::new();
            for (field, result) in pending.into_iter().zip(results) {
                self.finish_field(field, result, &mut next);
            }
            level = next;
            depth += 1;
        }

        let data = match self.data.into_json() {
            Ok(data) => data,
            Err(err) => return GraphQLResponse::error(Error::from(err).to_graphql_error()),
        };
        GraphQLResponse {
            data: Some(data),
            errors: self.errors,
        }
    }

    fn call(&self, call: FieldCall) -> BoxFuture<'static, Result<Resolved>> {
        let arguments = call.info.field.arguments.clone();
        self.scope.resolve(&call.coordinate, &call.source, arguments, &call.info)
    }

    /// Lay out the slot's response object and list the resolver calls of
    /// its fields.
    fn start_slot(&mut self, slot: ObjectSlot, pending: &mut Vec<PendingField>, calls: &mut Vec<FieldCall>) {
        if !matches!(self.value_at(&slot.path), Some(GqlValue::Object(_))) {
            // An ancestor was nulled.
            return;
        }

        let collected = collect_fields(self.scope.graph(), &slot.type_name, &slot.selections);
        let placeholder = collected
            .keys()
            .map(|key| (Name::new(key), GqlValue::Null))
            .collect::<IndexMap<_, _>>();
        self.set(&slot.path, GqlValue::Object(placeholder));
        let source = Arc::new(slot.source);

        for (key, field) in collected {
            let mut path = slot.path.clone();
            path.push(PathSegment::Field(key));

            if field.name == TYPENAME {
                self.set(&path, GqlValue::from(slot.type_name.as_str()));
                continue;
            }

            let coordinate = FieldCoordinate::new(slot.type_name.as_str(), field.name.as_str());
            let graph = self.scope.graph();
            let Some(def) = graph.field(&coordinate) else {
                self.errors.push(
                    GraphQLError::from(Error::InvalidRequest(format!(
                        "cannot query field `{}` on type `{}`",
                        field.name, slot.type_name
                    )))
                    .with_path(path),
                );
                continue;
            };
            let ty = def.ty.clone();
            let resolution = graph.resolution(&coordinate);
            let service = resolution.and_then(ResolutionContext::service).cloned();
            let child_prefix = match resolution {
                Some(ResolutionContext::Static) => {
                    let mut prefix = slot.static_prefix.clone();
                    prefix.push(field.name.clone());
                    prefix
                }
                _ => Vec::new(),
            };

            let info = FieldInfo {
                operation: self.operation,
                field: field.clone(),
                static_prefix: slot.static_prefix.clone(),
                parent_service: slot.origin.clone(),
            };
            calls.push(FieldCall {
                coordinate,
                source: source.clone(),
                info,
            });
            pending.push(PendingField {
                path,
                field,
                ty,
                child_prefix,
                service,
            });
        }
    }

    fn finish_field(&mut self, field: PendingField, result: Result<Resolved>, next: &mut Vec<ObjectSlot>) {
        let mut nulls = Vec::new();
        let value = match result {
            Ok(Resolved { value, errors }) => {
                for error in errors {
                    let mut path = field.path.clone();
                    path.extend(error.path.iter().cloned());
                    self.errors.push(error.with_path(path));
                }
                self.complete(&field.ty, value, &field.path, &field, next, &mut nulls)
            }
            Err(err) => {
                self.errors.push(err.to_graphql_error().with_path(field.path.clone()));
                if field.ty.is_non_null() {
                    self.non_null.insert(field.path.clone());
                    nulls.push(field.path.clone());
                }
                GqlValue::Null
            }
        };

        self.set(&field.path, value);
        for path in nulls {
            self.null_out(path);
        }
    }

    /// Shape a resolved value after the field's type. Composite values are
    /// replaced by empty objects and queued on `next`.
    fn complete(
        &mut self,
        ty: &TypeRef,
        value: GqlValue,
        path: &[PathSegment],
        field: &PendingField,
        next: &mut Vec<ObjectSlot>,
        nulls: &mut Vec<Vec<PathSegment>>,
    ) -> GqlValue {
        match ty {
            TypeRef::NonNull(inner) => {
                self.non_null.insert(path.to_vec());
                let value = self.complete(inner, value, path, field, next, nulls);
                if value == GqlValue::Null {
                    if !self.errors.iter().any(|error| error.path == path) {
                        self.field_error(path, format!("non-null field `{}` resolved to null", field.field.name));
                    }
                    nulls.push(path.to_vec());
                }
                value
            }
            _ if value == GqlValue::Null => GqlValue::Null,
            TypeRef::List(inner) => {
                let GqlValue::List(items) = value else {
                    self.field_error(path, format!("expected a list for `{}`", field.field.name));
                    return GqlValue::Null;
                };
                let mut completed = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut item_path = path.to_vec();
                    item_path.push(PathSegment::Index(index));
                    completed.push(self.complete(inner, item, &item_path, field, next, nulls));
                }
                GqlValue::List(completed)
            }
            TypeRef::Named(name) => {
                let kind = self.scope.graph().get_type(name).map(|ty| ty.kind);
                match kind {
                    Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union) => {
                        let GqlValue::Object(map) = value else {
                            self.field_error(path, format!("expected an object of type `{name}`"));
                            return GqlValue::Null;
                        };
                        let runtime_type = if kind == Some(TypeKind::Object) {
                            name.clone()
                        } else {
                            match map.get(TYPENAME) {
                                Some(GqlValue::String(runtime)) if self.scope.graph().is_possible_type(name, runtime) => {
                                    runtime.clone()
                                }
                                _ => {
                                    self.field_error(path, format!("cannot determine the runtime type of `{name}`"));
                                    return GqlValue::Null;
                                }
                            }
                        };
                        next.push(ObjectSlot {
                            path: path.to_vec(),
                            type_name: runtime_type,
                            selections: field.field.selections.clone(),
                            source: GqlValue::Object(map),
                            static_prefix: field.child_prefix.clone(),
                            origin: field.service.clone(),
                        });
                        GqlValue::Object(IndexMap::new())
                    }
                    _ => value,
                }
            }
        }
    }

    fn field_error(&mut self, path: &[PathSegment], message: String) {
        self.errors
            .push(GraphQLError::from(Error::Internal(message)).with_path(path.to_vec()));
    }

    /// Null the closest nullable ancestor of a null in a non-null position.
    fn null_out(&mut self, mut path: Vec<PathSegment>) {
        while self.non_null.contains(&path) {
            path.pop();
            if path.is_empty() {
                self.data = GqlValue::Null;
                return;
            }
            self.set(&path, GqlValue::Null);
        }
    }

    fn value_at(&self, path: &[PathSegment]) -> Option<&GqlValue> {
        path.iter().try_fold(&self.data, |value, segment| match (value, segment) {
            (GqlValue::Object(map), PathSegment::Field(name)) => map.get(name.as_str()),
            (GqlValue::List(items), PathSegment::Index(index)) => items.get(*index),
            _ => None,
        })
    }

    /// Write `value` at `path`; silently ignored under a nulled ancestor.
    fn set(&mut self, path: &[PathSegment], value: GqlValue) {
        let Some((last, parents)) = path.split_last() else {
            self.data = value;
            return;
        };
        let mut current = &mut self.data;
        for segment in parents {
            current = match (current, segment) {
                (GqlValue::Object(map), PathSegment::Field(name)) => match map.get_mut(name.as_str()) {
                    Some(next) => next,
                    None => return,
                },
                (GqlValue::List(items), PathSegment::Index(index)) => match items.get_mut(*index) {
                    Some(next) => next,
                    None => return,
                },
                _ => return,
            };
        }
        match (current, last) {
            (GqlValue::Object(map), PathSegment::Field(name)) => {
                map.insert(Name::new(name), value);
            }
            (GqlValue::List(items), PathSegment::Index(index)) => {
                if let Some(slot) = items.get_mut(*index) {
                    *slot = value;
                }
            }
            _ => {}
        }
    }
}

/// Group the selections that apply to an object of `type_name` by response
/// key, in order of first appearance.
fn collect_fields(graph: &UnifiedGraph, type_name: &str, selections: &[Selection]) -> IndexMap<String, FieldSelection> {
    fn collect(
        graph: &UnifiedGraph,
        type_name: &str,
        selections: &[Selection],
        out: &mut IndexMap<String, FieldSelection>,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => match out.get_mut(field.response_key()) {
                    Some(existing) => existing.selections.extend(field.selections.iter().cloned()),
                    None => {
                        out.insert(field.response_key().to_string(), field.clone());
                    }
                },
                Selection::InlineFragment(fragment) => {
                    let applies = fragment
                        .type_condition
                        .as_deref()
                        .map_or(true, |condition| graph.is_possible_type(condition, type_name));
                    if applies {
                        collect(graph, type_name, &fragment.selections, out);
                    }
                }
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    let mut out = IndexMap::new();
    collect(graph, type_name, selections, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryExecutorPool;
    use crate::graph::SchemaGraph;
    use crate::merge::GraphMerger;

    fn env() -> ExecutionEnvironment {
        let graph = SchemaGraph::from_sdl(
            "a",
            "type Query { node: Node item(id: ID!): Item } interface Node { id: ID! } type Item implements Node { id: ID! name: String }",
        )
        .unwrap();
        ExecutionEnvironment {
            graph: Arc::new(GraphMerger::new().merge(&[graph]).unwrap()),
            executors: Arc::new(QueryExecutorPool::new()),
            batch_timeout: None,
        }
    }

    #[test]
    fn several_operations_need_a_name() {
        let request = GraphQLRequest::new("query A { node { id } } query B { item(id: 1) { id } }");
        assert!(matches!(prepare(&env(), &request), Err(Error::InvalidRequest(_))));

        let prepared = prepare(&env(), &request.operation_name("B")).unwrap();
        assert_eq!(prepared.root_type, "Query");
        assert!(matches!(&prepared.selections[0], Selection::Field(field) if field.name == "item"));
    }

    #[test]
    fn subscriptions_are_rejected() {
        let request = GraphQLRequest::new("subscription { node { id } }");
        assert!(matches!(prepare(&env(), &request), Err(Error::InvalidRequest(m)) if m.contains("subscriptions")));
    }

    #[test]
    fn missing_required_variable_is_rejected() {
        let request = GraphQLRequest::new("query($id: ID!) { item(id: $id) { id } }");
        assert!(matches!(prepare(&env(), &request), Err(Error::InvalidRequest(m)) if m.contains("$id")));

        let prepared = prepare(&env(), &request.variable("id", serde_json::json!("i1"))).unwrap();
        let Selection::Field(field) = &prepared.selections[0] else {
            panic!("expected a field");
        };
        assert_eq!(field.arguments, vec![("id".to_string(), GqlValue::from("i1"))]);
    }

    #[test]
    fn fields_merge_by_response_key_and_type_condition() {
        let request = GraphQLRequest::new(
            "{ node { id ... on Item { name } ... on Other { nope } } node { ...F } } fragment F on Node { id }",
        );
        let prepared = prepare(&env(), &request).unwrap();
        let env = env();
        let root = collect_fields(&env.graph, "Query", &prepared.selections);
        assert_eq!(root.len(), 1);

        let node = &root["node"];
        let fields = collect_fields(&env.graph, "Item", &node.selections);
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["id", "name"]);
    }
}
