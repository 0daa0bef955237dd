//! Schema merge engine.
//!
//! [`GraphMerger`] folds the subgraphs, in registration order, into one
//! [`UnifiedGraph`]:
//!
//! 1. every non-extension type is merged. A type seen for the first time is
//!    taken as is. Two object types with the same name union their fields;
//!    a field declared by both must return the same object type and carry no
//!    arguments or directives, and becomes a [`ResolutionContext::Static`]
//!    namespace node whose return type is folded recursively. Other kinds
//!    are replaced by the last definition.
//! 2. entity extensions are applied on top of their base entity.
//!
//! Merging is not commutative: conflicts are attributed to the later service.

use crate::directives::{self, check_references, invalid_reference, type_location};
use crate::error::{DirectiveValidationError, Result, SchemaMergeError, StitchErrors};
use crate::federation::{EntityExtensionSpec, FederationIndex, FederationMetadata};
use crate::graph::{FieldCoordinate, FieldDefinition, SchemaGraph, ServiceId, TypeDefinition, TypeKind};
use crate::registry::{ArgumentSource, FieldDispatchRegistry, RegistryBuilder, ResolutionContext};
use crate::types::OperationKind;
use async_graphql::indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

const QUERY: &str = "Query";
const MUTATION: &str = "Mutation";

/// The stitched graph every request is executed against.
#[derive(Debug)]
pub struct UnifiedGraph {
    types: IndexMap<String, TypeDefinition>,
    registry: FieldDispatchRegistry,
    federation: FederationIndex,
    folded_types: HashSet<String>,
    services: Vec<ServiceId>,
}

impl UnifiedGraph {
    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    pub fn field(&self, coordinate: &FieldCoordinate) -> Option<&FieldDefinition> {
        self.get_type(&coordinate.type_name)?
            .get_field(&coordinate.field_name)
    }

    pub fn resolution(&self, coordinate: &FieldCoordinate) -> Option<&ResolutionContext> {
        self.registry.get(coordinate)
    }

    pub fn registry(&self) -> &FieldDispatchRegistry {
        &self.registry
    }

    pub fn federation(&self) -> &FederationIndex {
        &self.federation
    }

    pub fn query_type(&self) -> &str {
        QUERY
    }

    pub fn mutation_type(&self) -> Option<&str> {
        self.types.contains_key(MUTATION).then_some(MUTATION)
    }

    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.types.contains_key(QUERY).then_some(QUERY),
            OperationKind::Mutation => self.mutation_type(),
        }
    }

    pub fn is_operation_root(&self, type_name: &str) -> bool {
        type_name == QUERY || type_name == MUTATION
    }

    /// Whether the type is the return type of a shared namespace field.
    pub fn is_folded(&self, type_name: &str) -> bool {
        self.folded_types.contains(type_name)
    }

    /// Services in registration order.
    pub fn services(&self) -> &[ServiceId] {
        &self.services
    }

    /// Whether an object of type `runtime_type` matches the type condition.
    pub fn is_possible_type(&self, condition: &str, runtime_type: &str) -> bool {
        if condition == runtime_type {
            return true;
        }
        match self.get_type(condition).map(|ty| ty.kind) {
            Some(TypeKind::Union) => self
                .get_type(condition)
                .is_some_and(|ty| ty.members.iter().any(|m| m == runtime_type)),
            Some(TypeKind::Interface) => self
                .get_type(runtime_type)
                .is_some_and(|ty| ty.implements.iter().any(|i| i == condition)),
            _ => false,
        }
    }
}

/// Builds a [`UnifiedGraph`] from subgraphs.
#[derive(Debug, Default, Clone)]
pub struct GraphMerger {
    resolver_arguments: Vec<(FieldCoordinate, Vec<ArgumentSource>)>,
}

impl GraphMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch arguments of `coordinate` from other services before the field
    /// itself is fetched.
    pub fn with_resolver_argument(mut self, coordinate: FieldCoordinate, sources: Vec<ArgumentSource>) -> Self {
        self.resolver_arguments.push((coordinate, sources));
        self
    }

    /// Merge `graphs` in order. Every violation found is reported together in
    /// [`Error::Stitch`](crate::Error::Stitch).
    pub fn merge(&self, graphs: &[SchemaGraph]) -> Result<UnifiedGraph> {
        let mut state = MergeState::default();

        let metadata: Vec<FederationMetadata> = graphs
            .iter()
            .map(|graph| {
                let (metadata, errors) = directives::process(graph);
                state.errors.extend(errors);
                metadata
            })
            .collect();

        for (graph, metadata) in graphs.iter().zip(&metadata) {
            let mut merged = HashSet::new();
            for ty in graph.types() {
                if !metadata.is_extension(&ty.name) {
                    state.merge_type(graph, &ty.name, &mut merged);
                }
            }
        }

        for metadata in &metadata {
            for entity in metadata.entities_by_type_name.values() {
                if state.federation.entity(&entity.type_name).is_none() {
                    state.federation.insert_entity(entity.clone());
                }
            }
        }

        for (graph, metadata) in graphs.iter().zip(&metadata) {
            for spec in metadata.extensions_by_type_name.values() {
                state.apply_extension(graph, spec.clone());
            }
        }

        let mut entry_types: HashSet<String> = [QUERY, MUTATION].into_iter().map(String::from).collect();
        entry_types.extend(state.folded.iter().cloned());

        let MergeState {
            types,
            registry,
            folded,
            federation,
            mut errors,
        } = state;
        let registry = registry.build(&types, &entry_types, &self.resolver_arguments, &mut errors);

        if errors.is_empty() {
            tracing::info!(
                services = graphs.len(),
                types = types.len(),
                fields = registry.len(),
                "stitched unified graph"
            );
        } else {
            tracing::warn!(violations = errors.len(), "schema stitching failed");
        }

        errors.into_result(UnifiedGraph {
            types,
            registry,
            federation,
            folded_types: folded,
            services: graphs.iter().map(|g| g.service().clone()).collect(),
        })
    }
}

#[derive(Default)]
struct MergeState {
    types: IndexMap<String, TypeDefinition>,
    registry: RegistryBuilder,
    folded: HashSet<String>,
    federation: FederationIndex,
    errors: StitchErrors,
}

/// Root types are merged under their conventional names.
fn canonical_name(graph: &SchemaGraph, name: &str) -> String {
    if name == graph.query_type() {
        QUERY.to_string()
    } else if graph.mutation_type() == Some(name) {
        MUTATION.to_string()
    } else {
        name.to_string()
    }
}

impl MergeState {
    fn merge_type(&mut self, graph: &SchemaGraph, name: &str, merged: &mut HashSet<String>) {
        let canonical = canonical_name(graph, name);
        if !merged.insert(canonical.clone()) {
            return;
        }
        let Some(incoming) = graph.get_type(name) else {
            return;
        };

        match self.types.get(&canonical).map(|ty| ty.kind) {
            None => self.add_type(graph.service(), &canonical, incoming),
            Some(TypeKind::Object) if incoming.kind == TypeKind::Object => {
                self.merge_object(graph, &canonical, incoming, merged)
            }
            Some(existing) if existing == TypeKind::Object || incoming.kind == TypeKind::Object => {
                self.errors.push(SchemaMergeError::TypeMismatch {
                    service: graph.service().clone(),
                    type_name: canonical,
                    field: "__typename".to_string(),
                    existing: existing.to_string(),
                    incoming: incoming.kind.to_string(),
                });
            }
            Some(_) => {
                tracing::debug!(
                    service = %graph.service(),
                    type_name = %canonical,
                    "replacing earlier definition"
                );
                self.add_type(graph.service(), &canonical, incoming);
            }
        }
    }

    fn add_type(&mut self, service: &ServiceId, name: &str, incoming: &TypeDefinition) {
        let mut ty = incoming.clone();
        ty.name = name.to_string();
        ty.extension = false;
        if matches!(ty.kind, TypeKind::Object | TypeKind::Interface) {
            for field in &ty.fields {
                self.registry.set(
                    FieldCoordinate::new(name, field.name.as_str()),
                    ResolutionContext::Owned(service.clone()),
                );
            }
        }
        self.types.insert(name.to_string(), ty);
    }

    fn merge_object(
        &mut self,
        graph: &SchemaGraph,
        name: &str,
        incoming: &TypeDefinition,
        merged: &mut HashSet<String>,
    ) {
        let service = graph.service();
        for field in &incoming.fields {
            let coordinate = FieldCoordinate::new(name, field.name.as_str());
            let existing = self
                .types
                .get(name)
                .and_then(|ty| ty.get_field(&field.name))
                .cloned();

            let Some(existing) = existing else {
                if let Some(ty) = self.types.get_mut(name) {
                    ty.fields.push(field.clone());
                }
                self.registry.set(coordinate, ResolutionContext::Owned(service.clone()));
                continue;
            };

            if let Err(err) = self.check_shared_field(graph, name, &existing, field) {
                self.errors.push(err);
                continue;
            }

            tracing::debug!(field = %coordinate, "folding shared namespace field");
            self.registry.set(coordinate, ResolutionContext::Static);
            let nested = field.ty.named_type();
            self.folded.insert(nested.to_string());
            self.merge_type(graph, nested, merged);
        }

        if let Some(ty) = self.types.get_mut(name) {
            for interface in &incoming.implements {
                if !ty.implements.contains(interface) {
                    ty.implements.push(interface.clone());
                }
            }
            for directive in &incoming.directives {
                if !ty.directives.contains(directive) {
                    ty.directives.push(directive.clone());
                }
            }
        }
    }

    /// Rules for a field declared by more than one service, checked in
    /// order; only the first violation is reported.
    fn check_shared_field(
        &self,
        graph: &SchemaGraph,
        type_name: &str,
        existing: &FieldDefinition,
        incoming: &FieldDefinition,
    ) -> std::result::Result<(), SchemaMergeError> {
        let service = graph.service().clone();
        let type_name = type_name.to_string();
        let field = incoming.name.clone();

        if !existing.arguments.is_empty() || !incoming.arguments.is_empty() {
            return Err(SchemaMergeError::ArgumentsNotAllowed { service, type_name, field });
        }
        if !existing.directives.is_empty() || !incoming.directives.is_empty() {
            return Err(SchemaMergeError::DirectivesNotAllowed { service, type_name, field });
        }

        let existing_kind = self.types.get(existing.ty.named_type()).map(|ty| ty.kind);
        let incoming_kind = graph.get_type(incoming.ty.named_type()).map(|ty| ty.kind);
        if existing_kind != Some(TypeKind::Object) || incoming_kind != Some(TypeKind::Object) {
            return Err(SchemaMergeError::NotAnObjectType { service, type_name, field });
        }
        if existing.ty != incoming.ty {
            return Err(SchemaMergeError::TypeMismatch {
                service,
                type_name,
                field,
                existing: existing.ty.to_string(),
                incoming: incoming.ty.to_string(),
            });
        }
        Ok(())
    }

    fn apply_extension(&mut self, graph: &SchemaGraph, mut spec: EntityExtensionSpec) {
        let service = graph.service().clone();
        let type_name = spec.type_name.clone();

        let Some(base) = self.federation.entity(&type_name).cloned() else {
            self.errors.push(SchemaMergeError::MissingBaseEntity { service, type_name });
            return;
        };
        let Some(extension) = graph.get_type(&type_name) else {
            return;
        };
        let location = type_location(extension);

        for key in &spec.keys {
            if !base.keys.iter().any(|b| key.fields().is_subset_of(b.fields())) {
                self.errors.push(SchemaMergeError::KeyNotSubset {
                    service: service.clone(),
                    type_name: type_name.clone(),
                    key: key.fields().to_string(),
                });
            }
        }

        for field in &extension.fields {
            if !spec.external_fields.contains(&field.name) {
                continue;
            }
            let in_base = self
                .types
                .get(&type_name)
                .is_some_and(|ty| ty.get_field(&field.name).is_some());
            if !in_base {
                self.errors.push(DirectiveValidationError::ExternalFieldNotFoundInBase {
                    service: service.clone(),
                    type_name: type_name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        spec.base_service = Some(base.service.clone());
        let spec = Arc::new(spec);

        for field in &extension.fields {
            if spec.external_fields.contains(&field.name) {
                continue;
            }
            let coordinate = FieldCoordinate::new(type_name.as_str(), field.name.as_str());
            if let Some(context) = self.registry.get(&coordinate) {
                self.errors.push(SchemaMergeError::SharedOwnershipViolation {
                    service: service.clone(),
                    type_name: type_name.clone(),
                    field: field.name.clone(),
                    owner: context.service().cloned().unwrap_or_else(|| base.service.clone()),
                });
                continue;
            }
            if let Some(ty) = self.types.get_mut(&type_name) {
                ty.fields.push(field.clone());
            }
            self.registry
                .set(coordinate, ResolutionContext::EntityExtension(spec.clone()));
        }

        let types = &self.types;
        let lookup = |name: &str| types.get(name);
        for key in &spec.keys {
            if let Err((reference, reason)) = check_references(key.fields().items(), &type_name, lookup) {
                self.errors
                    .push(invalid_reference(&service, directives::KEY, &location, reference, reason));
            }
        }
        for field in &extension.fields {
            let Some(requires) = spec.requires(&field.name) else {
                continue;
            };
            if let Err((reference, reason)) = check_references(requires.items(), &type_name, lookup) {
                let location = format!("field `{type_name}.{}`", field.name);
                self.errors
                    .push(invalid_reference(&service, directives::REQUIRES, &location, reference, reason));
            }
        }

        tracing::debug!(
            service = %service,
            type_name = %type_name,
            base = %base.service,
            "applied entity extension"
        );
        self.federation.insert_extension(spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StitchViolation};

    fn sdl(service: &str, sdl: &str) -> SchemaGraph {
        SchemaGraph::from_sdl(service, sdl).expect("valid sdl")
    }

    fn violations(result: Result<UnifiedGraph>) -> Vec<StitchViolation> {
        match result {
            Err(Error::Stitch(errors)) => errors.into_iter().collect(),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected stitching to fail"),
        }
    }

    fn owner(graph: &UnifiedGraph, type_name: &str, field: &str) -> Option<String> {
        graph
            .resolution(&FieldCoordinate::new(type_name, field))
            .and_then(ResolutionContext::service)
            .map(|s| s.to_string())
    }

    #[test]
    fn disjoint_fields_keep_their_owner() {
        let a = sdl("a", "type Query { a: String }");
        let b = sdl("b", "type Query { b: String }");
        let graph = GraphMerger::new().merge(&[a, b]).unwrap();

        assert_eq!(owner(&graph, "Query", "a").as_deref(), Some("a"));
        assert_eq!(owner(&graph, "Query", "b").as_deref(), Some("b"));
        assert_eq!(graph.services().len(), 2);
    }

    #[test]
    fn shared_object_field_becomes_static_and_folds() {
        let a = sdl("a", "type Query { viewer: Viewer } type Viewer { name: String }");
        let b = sdl("b", "type Query { viewer: Viewer } type Viewer { orders: [String] }");
        let graph = GraphMerger::new().merge(&[a, b]).unwrap();

        assert!(matches!(
            graph.resolution(&FieldCoordinate::new("Query", "viewer")),
            Some(ResolutionContext::Static)
        ));
        assert!(graph.is_folded("Viewer"));
        assert_eq!(owner(&graph, "Viewer", "name").as_deref(), Some("a"));
        assert_eq!(owner(&graph, "Viewer", "orders").as_deref(), Some("b"));
    }

    #[test]
    fn shared_field_violations_are_reported_in_order() {
        let a = sdl(
            "a",
            "type Query { product(id: ID!): Product count: Int node: Product } type Product { id: ID! }",
        );
        let b = sdl(
            "b",
            "type Query { product(id: ID!): Product count: Int node: Product! } type Product { id: ID! }",
        );
        let found = violations(GraphMerger::new().merge(&[a, b]));

        assert!(matches!(
            &found[0],
            StitchViolation::Merge(SchemaMergeError::ArgumentsNotAllowed { service, field, .. })
                if service.as_str() == "b" && field == "product"
        ));
        assert!(matches!(
            &found[1],
            StitchViolation::Merge(SchemaMergeError::NotAnObjectType { field, .. }) if field == "count"
        ));
        assert!(matches!(
            &found[2],
            StitchViolation::Merge(SchemaMergeError::TypeMismatch { existing, incoming, .. })
                if existing == "Product" && incoming == "Product!"
        ));
    }

    #[test]
    fn scalar_collision_keeps_last_definition() {
        let a = sdl("a", "type Query { a: Color } enum Color { RED }");
        let b = sdl("b", "type Query { b: Color } enum Color { RED GREEN }");
        let graph = GraphMerger::new().merge(&[a, b]).unwrap();

        assert_eq!(graph.get_type("Color").unwrap().values, vec!["RED", "GREEN"]);
    }

    #[test]
    fn object_and_scalar_with_same_name_conflict() {
        let a = sdl("a", "type Query { a: Date } type Date { day: Int }");
        let b = sdl("b", "type Query { b: Date } scalar Date");
        let found = violations(GraphMerger::new().merge(&[a, b]));

        assert!(matches!(
            &found[0],
            StitchViolation::Merge(SchemaMergeError::TypeMismatch { type_name, incoming, .. })
                if type_name == "Date" && incoming == "scalar"
        ));
    }

    #[test]
    fn extension_fields_are_registered_on_the_base_entity() {
        let products = sdl(
            "products",
            r#"type Query { product(id: ID!): Product } type Product @key(fields: "id") { id: ID! name: String weight: Float }"#,
        );
        let shipping = sdl(
            "shipping",
            r#"extend type Product @key(fields: "id") {
                id: ID! @external
                weight: Float @external
                estimate: Float @requires(fields: "weight")
            }"#,
        );
        let graph = GraphMerger::new().merge(&[shipping, products]).unwrap();

        let Some(ResolutionContext::EntityExtension(spec)) =
            graph.resolution(&FieldCoordinate::new("Product", "estimate"))
        else {
            panic!("expected an extension context");
        };
        assert_eq!(spec.base_service.as_ref().map(ServiceId::as_str), Some("products"));
        assert_eq!(owner(&graph, "Product", "name").as_deref(), Some("products"));
        assert_eq!(graph.federation().extensions("Product").len(), 1);
    }

    #[test]
    fn extension_violations() {
        let products = sdl(
            "products",
            r#"type Query { product: Product } type Product @key(fields: "id") { id: ID! name: String }"#,
        );
        let reviews = sdl(
            "reviews",
            r#"
            extend type Product @key(fields: "sku") {
                sku: String @external
                name: String
            }
            extend type User @key(fields: "id") { id: ID! @external }
            "#,
        );
        let found = violations(GraphMerger::new().merge(&[products, reviews]));

        assert!(found.iter().any(|v| matches!(
            v,
            StitchViolation::Merge(SchemaMergeError::KeyNotSubset { key, .. }) if key == "sku"
        )));
        assert!(found.iter().any(|v| matches!(
            v,
            StitchViolation::Directive(DirectiveValidationError::ExternalFieldNotFoundInBase { field, .. })
                if field == "sku"
        )));
        assert!(found.iter().any(|v| matches!(
            v,
            StitchViolation::Merge(SchemaMergeError::SharedOwnershipViolation { field, owner, .. })
                if field == "name" && owner.as_str() == "products"
        )));
        assert!(found.iter().any(|v| matches!(
            v,
            StitchViolation::Merge(SchemaMergeError::MissingBaseEntity { type_name, .. }) if type_name == "User"
        )));
    }

    #[test]
    fn renamed_root_types_merge_into_query() {
        let a = sdl("a", "schema { query: RootQuery } type RootQuery { a: String }");
        let b = sdl("b", "type Query { b: String }");
        let graph = GraphMerger::new().merge(&[a, b]).unwrap();

        let query = graph.get_type(graph.query_type()).unwrap();
        assert_eq!(query.fields.len(), 2);
        assert!(graph.get_type("RootQuery").is_none());
    }
}
