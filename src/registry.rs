//! Field dispatch registry.
//!
//! Every field of every object and interface type in the unified graph maps
//! to exactly one [`ResolutionContext`]. The registry is filled by the merge
//! engine and frozen before the first request; lookups never fail for a
//! field that exists in the unified graph.

use crate::document::FieldSelection;
use crate::error::{SchemaMergeError, StitchErrors};
use crate::federation::EntityExtensionSpec;
use crate::graph::{FieldCoordinate, ServiceId, TypeDefinition, TypeKind};
use async_graphql::indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How a field of the unified graph gets its value.
#[derive(Clone, Debug)]
pub enum ResolutionContext {
    /// Fetched from (or read off a parent returned by) this service.
    Owned(ServiceId),
    /// A namespace node shared by several services. Resolves to an empty
    /// object; its children do the fetching.
    Static,
    /// Contributed to an entity by a non-base service.
    EntityExtension(Arc<EntityExtensionSpec>),
    /// Owned field whose arguments are first fetched from other services.
    ResolverArgument(Arc<ResolverArgumentSpec>),
}

impl ResolutionContext {
    /// The service answering for the field, if a single one does.
    pub fn service(&self) -> Option<&ServiceId> {
        match self {
            ResolutionContext::Owned(service) => Some(service),
            ResolutionContext::EntityExtension(spec) => Some(&spec.service),
            ResolutionContext::ResolverArgument(spec) => Some(&spec.owner),
            ResolutionContext::Static => None,
        }
    }
}

/// Where one argument of a field comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSource {
    /// Argument of the configured field that receives the value.
    pub argument: String,
    /// Service queried for the value.
    pub service: ServiceId,
    /// Root field selection sent to `service`, e.g. `currentUser { id }`.
    pub query: String,
    /// Path of the value inside the selected root field's result.
    #[serde(default)]
    pub path: Vec<String>,
}

impl ArgumentSource {
    pub fn new(
        argument: impl Into<String>,
        service: impl Into<ServiceId>,
        query: impl Into<String>,
        path: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            argument: argument.into(),
            service: service.into(),
            query: query.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

/// Resolved configuration of a [`ResolutionContext::ResolverArgument`] field.
#[derive(Clone, Debug)]
pub struct ResolverArgumentSpec {
    /// Service that owns the field itself.
    pub owner: ServiceId,
    pub sources: Vec<ResolvedArgumentSource>,
}

#[derive(Clone, Debug)]
pub struct ResolvedArgumentSource {
    pub argument: String,
    pub service: ServiceId,
    pub selection: FieldSelection,
    pub path: Vec<String>,
}

/// Frozen field to resolution-context map.
#[derive(Clone, Debug, Default)]
pub struct FieldDispatchRegistry {
    contexts: HashMap<FieldCoordinate, ResolutionContext>,
}

impl FieldDispatchRegistry {
    pub fn get(&self, coordinate: &FieldCoordinate) -> Option<&ResolutionContext> {
        self.contexts.get(coordinate)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldCoordinate, &ResolutionContext)> {
        self.contexts.iter()
    }
}

/// Mutable registry used while merging.
#[derive(Debug, Default)]
pub(crate) struct RegistryBuilder {
    contexts: IndexMap<FieldCoordinate, ResolutionContext>,
}

impl RegistryBuilder {
    pub(crate) fn set(&mut self, coordinate: FieldCoordinate, context: ResolutionContext) {
        self.contexts.insert(coordinate, context);
    }

    pub(crate) fn get(&self, coordinate: &FieldCoordinate) -> Option<&ResolutionContext> {
        self.contexts.get(coordinate)
    }

    /// Apply the configured resolver arguments, check that every field of
    /// `types` has a context and freeze the registry.
    ///
    /// `entry_types` are the types whose fields are fetched directly from a
    /// service; only their fields may take resolver arguments.
    pub(crate) fn build(
        mut self,
        types: &IndexMap<String, TypeDefinition>,
        entry_types: &HashSet<String>,
        resolver_arguments: &[(FieldCoordinate, Vec<ArgumentSource>)],
        errors: &mut StitchErrors,
    ) -> FieldDispatchRegistry {
        for (coordinate, sources) in resolver_arguments {
            match self.resolver_argument(types, entry_types, coordinate, sources) {
                Ok(spec) => {
                    tracing::debug!(field = %coordinate, sources = sources.len(), "registered resolver argument");
                    self.set(coordinate.clone(), ResolutionContext::ResolverArgument(Arc::new(spec)));
                }
                Err(reason) => errors.push(SchemaMergeError::InvalidResolverArgument {
                    type_name: coordinate.type_name.clone(),
                    field: coordinate.field_name.clone(),
                    reason,
                }),
            }
        }

        for ty in types.values() {
            if !matches!(ty.kind, TypeKind::Object | TypeKind::Interface) {
                continue;
            }
            for field in &ty.fields {
                let coordinate = FieldCoordinate::new(ty.name.as_str(), field.name.as_str());
                if !self.contexts.contains_key(&coordinate) {
                    errors.push(SchemaMergeError::UnregisteredField {
                        type_name: coordinate.type_name,
                        field: coordinate.field_name,
                    });
                }
            }
        }

        FieldDispatchRegistry {
            contexts: self.contexts.into_iter().collect(),
        }
    }

    fn resolver_argument(
        &self,
        types: &IndexMap<String, TypeDefinition>,
        entry_types: &HashSet<String>,
        coordinate: &FieldCoordinate,
        sources: &[ArgumentSource],
    ) -> Result<ResolverArgumentSpec, String> {
        let field = types
            .get(&coordinate.type_name)
            .and_then(|ty| ty.get_field(&coordinate.field_name))
            .ok_or_else(|| "no such field in the stitched schema".to_string())?;

        if !entry_types.contains(&coordinate.type_name) {
            return Err("only fields fetched directly from a service can take resolver arguments".to_string());
        }
        let owner = match self.contexts.get(coordinate) {
            Some(ResolutionContext::Owned(owner)) => owner.clone(),
            _ => return Err("the field is not owned by a single service".to_string()),
        };

        let mut resolved = Vec::with_capacity(sources.len());
        for source in sources {
            if !field.arguments.iter().any(|arg| arg.name == source.argument) {
                return Err(format!("the field has no argument `{}`", source.argument));
            }
            let selection = FieldSelection::parse(&source.query)
                .map_err(|e| format!("invalid query for argument `{}`: {e}", source.argument))?;
            resolved.push(ResolvedArgumentSource {
                argument: source.argument.clone(),
                service: source.service.clone(),
                selection,
                path: source.path.clone(),
            });
        }

        Ok(ResolverArgumentSpec { owner, sources: resolved })
    }
}
