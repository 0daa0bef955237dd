//! Apollo Federation metadata
//!
//! This module holds the entity model extracted from each subgraph's `@key`,
//! `@extends`, `@external` and `@requires` directives (see
//! [`directives`](crate::directives) for the extraction) and the stitched index
//! built from it.

use crate::field_set::FieldSet;
use crate::graph::ServiceId;
use async_graphql::indexmap::IndexMap;
use async_graphql::{Name, Value as GqlValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One `@key` alternative. Each key of an entity is independently sufficient
/// to identify it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyDirectiveSpec {
    fields: FieldSet,
}

impl KeyDirectiveSpec {
    pub fn new(fields: FieldSet) -> Self {
        Self { fields }
    }

    /// Parse a `fields:` string, e.g. `"id"` or `"orgId userId"`.
    pub fn parse(fields: &str) -> Result<Self, String> {
        FieldSet::parse(fields).map(Self::new)
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.field_names()
    }

    pub fn is_satisfied_by(&self, source: &IndexMap<Name, GqlValue>) -> bool {
        self.fields.is_satisfied_by(source)
    }
}

/// An entity as declared by its base (owning) service.
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySpec {
    pub type_name: String,
    pub keys: Vec<KeyDirectiveSpec>,
    pub service: ServiceId,
}

/// Fields a non-base service contributes to an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityExtensionSpec {
    pub type_name: String,
    pub keys: Vec<KeyDirectiveSpec>,
    /// Fields marked `@external`: owned by the base, only referenced here.
    pub external_fields: HashSet<String>,
    /// Field name to the `@requires` selection it needs in its representation.
    pub required_fields_by_field_name: HashMap<String, FieldSet>,
    /// Service providing the extension fields.
    pub service: ServiceId,
    /// Base service of the entity; known once the graphs are stitched.
    pub base_service: Option<ServiceId>,
}

impl EntityExtensionSpec {
    pub fn new(type_name: impl Into<String>, service: ServiceId) -> Self {
        Self {
            type_name: type_name.into(),
            keys: Vec::new(),
            external_fields: HashSet::new(),
            required_fields_by_field_name: HashMap::new(),
            service,
            base_service: None,
        }
    }

    pub fn requires(&self, field: &str) -> Option<&FieldSet> {
        self.required_fields_by_field_name.get(field)
    }
}

/// Federation data extracted from one subgraph.
#[derive(Clone, Debug)]
pub struct FederationMetadata {
    pub service: ServiceId,
    pub entities_by_type_name: IndexMap<String, EntitySpec>,
    pub extensions_by_type_name: IndexMap<String, EntityExtensionSpec>,
}

impl FederationMetadata {
    /// Create empty metadata for a service
    pub fn new(service: ServiceId) -> Self {
        Self {
            service,
            entities_by_type_name: IndexMap::new(),
            extensions_by_type_name: IndexMap::new(),
        }
    }

    /// Check if the service takes part in federation at all
    pub fn is_enabled(&self) -> bool {
        !self.entities_by_type_name.is_empty() || !self.extensions_by_type_name.is_empty()
    }

    pub fn is_extension(&self, type_name: &str) -> bool {
        self.extensions_by_type_name.contains_key(type_name)
    }
}

/// Stitched federation index shared by every request.
#[derive(Clone, Debug, Default)]
pub struct FederationIndex {
    entities: HashMap<String, EntitySpec>,
    extensions: HashMap<String, Vec<Arc<EntityExtensionSpec>>>,
}

impl FederationIndex {
    pub(crate) fn insert_entity(&mut self, entity: EntitySpec) {
        self.entities.insert(entity.type_name.clone(), entity);
    }

    pub(crate) fn insert_extension(&mut self, extension: Arc<EntityExtensionSpec>) {
        self.extensions
            .entry(extension.type_name.clone())
            .or_default()
            .push(extension);
    }

    pub fn entity(&self, type_name: &str) -> Option<&EntitySpec> {
        self.entities.get(type_name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySpec> {
        self.entities.values()
    }

    pub fn extensions(&self, type_name: &str) -> &[Arc<EntityExtensionSpec>] {
        self.extensions
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_keep_declaration_order() {
        let key = KeyDirectiveSpec::parse("orgId userId").unwrap();
        assert_eq!(key.field_names().collect::<Vec<_>>(), vec!["orgId", "userId"]);
    }

    #[test]
    fn metadata_without_entities_is_disabled() {
        let metadata = FederationMetadata::new(ServiceId::new("accounts"));
        assert!(!metadata.is_enabled());
        assert!(!metadata.is_extension("User"));
    }

    #[test]
    fn index_groups_extensions_by_type() {
        let mut index = FederationIndex::default();
        index.insert_extension(Arc::new(EntityExtensionSpec::new("Product", ServiceId::new("inventory"))));
        index.insert_extension(Arc::new(EntityExtensionSpec::new("Product", ServiceId::new("reviews"))));

        assert_eq!(index.extensions("Product").len(), 2);
        assert!(index.extensions("User").is_empty());
    }
}
