//! Entity resolution through the `_entities` protocol.
//!
//! A field owned by another service than the one that produced its parent
//! object is fetched by sending the parent's representation (`__typename`,
//! the fields of its first satisfiable key and any `@requires` fields) to
//! the owning service. Fetches are queued on the request's
//! [`BatchDispatcher`] so every entity of one type and service resolved on
//! the same level travels in a single call.

use crate::dataloader::{BatchDispatcher, BatchKey, FetchDescriptor, FetchOutcome};
use crate::document::{FieldSelection, TYPENAME};
use crate::error::{EntityFetchError, Error, GraphQLError, Result};
use crate::federation::{EntityExtensionSpec, EntitySpec, KeyDirectiveSpec};
use crate::field_set::{read_field, FieldSet};
use crate::graph::ServiceId;
use crate::resolve::Resolved;
use async_graphql::{indexmap::IndexMap, Name, Value as GqlValue};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;

/// The service and keys an entity field is fetched with.
#[derive(Clone, Debug)]
pub struct EntityTarget {
    pub type_name: String,
    pub service: ServiceId,
    pub keys: Vec<KeyDirectiveSpec>,
    pub requires: Option<FieldSet>,
}

impl EntityTarget {
    /// Target for a field contributed by an extension.
    pub fn extension(spec: &EntityExtensionSpec, field: &str) -> Self {
        Self {
            type_name: spec.type_name.clone(),
            service: spec.service.clone(),
            keys: spec.keys.clone(),
            requires: spec.requires(field).cloned(),
        }
    }

    /// Target for a field of the base service, used when a parent object
    /// returned by an extending service carries only its key.
    pub fn base(entity: &EntitySpec) -> Self {
        Self {
            type_name: entity.type_name.clone(),
            service: entity.service.clone(),
            keys: entity.keys.clone(),
            requires: None,
        }
    }
}

/// Build the representation of `source` for `target`.
///
/// Returns `None` when no key of the target is fully present. `@requires`
/// fields missing from the source are left out.
pub fn build_representation(
    target: &EntityTarget,
    source: &IndexMap<Name, GqlValue>,
) -> Option<IndexMap<Name, GqlValue>> {
    let key = target.keys.iter().find(|key| key.is_satisfied_by(source))?;

    let mut representation = IndexMap::new();
    representation.insert(Name::new(TYPENAME), GqlValue::from(target.type_name.as_str()));
    key.fields().project_into(source, &mut representation);

    if let Some(requires) = &target.requires {
        for name in requires.field_names() {
            if read_field(source, name).is_none() {
                tracing::debug!(
                    type_name = %target.type_name,
                    field = name,
                    "required field missing from parent, omitted from representation"
                );
            }
        }
        requires.project_into(source, &mut representation);
    }
    Some(representation)
}

/// Lifecycle of one entity fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    RepresentationBuilt,
    Dispatched,
    Succeeded,
    Failed,
}

impl FetchState {
    pub fn can_advance_to(self, next: FetchState) -> bool {
        use FetchState::*;
        matches!(
            (self, next),
            (Pending, RepresentationBuilt)
                | (RepresentationBuilt, Dispatched)
                | (Dispatched, Succeeded)
                | (Pending | RepresentationBuilt | Dispatched, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Succeeded | FetchState::Failed)
    }
}

/// One fetch walking through [`FetchState`]; the transitions only feed tracing.
struct EntityFetch {
    type_name: String,
    field: String,
    state: FetchState,
}

impl EntityFetch {
    fn new(type_name: &str, field: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            field: field.to_string(),
            state: FetchState::Pending,
        }
    }

    fn advance(&mut self, next: FetchState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {next:?}", self.state);
        tracing::trace!(
            type_name = %self.type_name,
            field = %self.field,
            from = ?self.state,
            to = ?next,
            "entity fetch"
        );
        self.state = next;
    }
}

/// Resolves entity fields through the request's batch dispatcher.
#[derive(Clone, Debug)]
pub struct EntityResolver {
    dispatcher: Arc<BatchDispatcher>,
}

impl EntityResolver {
    pub fn new(dispatcher: Arc<BatchDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Queue the fetch of `field` for the entity `source` and return the
    /// future of its value. `field` must already be rewritten for the
    /// target service.
    pub fn resolve(
        &self,
        target: EntityTarget,
        source: &GqlValue,
        field: FieldSelection,
    ) -> BoxFuture<'static, Result<Resolved>> {
        let mut fetch = EntityFetch::new(&target.type_name, &field.name);

        let representation = match source {
            GqlValue::Object(map) => build_representation(&target, map),
            _ => None,
        };
        let Some(representation) = representation else {
            fetch.advance(FetchState::Failed);
            let err = EntityFetchError::MissingKeyData {
                service: target.service,
                type_name: target.type_name,
                field: field.name,
            };
            return future::ready(Err(err.into())).boxed();
        };
        fetch.advance(FetchState::RepresentationBuilt);

        let pending = self.dispatcher.register(
            BatchKey::Entity {
                service: target.service.clone(),
                type_name: target.type_name.clone(),
            },
            FetchDescriptor::Entity {
                representation,
                field,
            },
        );
        fetch.advance(FetchState::Dispatched);

        async move {
            let result = pending.await.and_then(|outcome| complete(&target, &fetch.field, outcome));
            fetch.advance(if result.is_ok() {
                FetchState::Succeeded
            } else {
                FetchState::Failed
            });
            result
        }
        .boxed()
    }
}

fn complete(target: &EntityTarget, field: &str, outcome: FetchOutcome) -> Result<Resolved> {
    let Some(value) = outcome.data else {
        return Err(EntityFetchError::NoEntitiesInResponse {
            service: target.service.clone(),
            type_name: target.type_name.clone(),
            field: field.to_string(),
        }
        .into());
    };

    let errors = outcome
        .errors
        .into_iter()
        .map(|error| {
            let path = error.path;
            GraphQLError::from(Error::from(EntityFetchError::DownstreamFieldError {
                service: target.service.clone(),
                type_name: target.type_name.clone(),
                field: field.to_string(),
                message: error.message,
            }))
            .with_path(path)
        })
        .collect();

    Ok(Resolved { value, errors })
}
