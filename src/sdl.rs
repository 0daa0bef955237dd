//! Ingest adapter turning subgraph SDL into a [`SchemaGraph`].
//!
//! Parsing is delegated to `async-graphql`'s parser; this module only maps the
//! parsed document onto the crate's own schema model and drops the federation
//! plumbing every subgraph exposes (`_service`, `_entities`, `_Any`, ...), which
//! would otherwise collide across services.

use crate::error::{Error, Result};
use crate::graph::{
    ArgumentDefinition, DirectiveUse, FieldDefinition, SchemaGraph, ServiceId, TypeDefinition,
    TypeKind, TypeRef,
};
use async_graphql::parser::parse_schema;
use async_graphql::parser::types::{
    BaseType, ConstDirective, FieldDefinition as AstField, InputValueDefinition, Type,
    TypeDefinition as AstType, TypeKind as AstKind, TypeSystemDefinition,
};
use async_graphql::Positioned;

const FEDERATION_TYPES: &[&str] = &["_Any", "_Entity", "_Service", "_FieldSet", "FieldSet", "link__Import"];
const FEDERATION_ROOT_FIELDS: &[&str] = &["_entities", "_service"];

impl SchemaGraph {
    /// Build a schema graph from SDL text.
    pub fn from_sdl(service: impl Into<ServiceId>, sdl: &str) -> Result<Self> {
        let service = service.into();
        let document = parse_schema(sdl)
            .map_err(|e| Error::Schema(format!("failed to parse schema of `{service}`: {e}")))?;

        let mut graph = SchemaGraph::new(service);
        for definition in document.definitions {
            match definition {
                TypeSystemDefinition::Schema(schema) => {
                    let schema = schema.node;
                    if let Some(query) = schema.query {
                        graph = graph.with_query_type(query.node.to_string());
                    }
                    if let Some(mutation) = schema.mutation {
                        graph = graph.with_mutation_type(mutation.node.to_string());
                    }
                }
                TypeSystemDefinition::Type(ty) => {
                    if FEDERATION_TYPES.contains(&ty.node.name.node.as_str()) {
                        continue;
                    }
                    graph.insert_type(convert_type(ty.node));
                }
                TypeSystemDefinition::Directive(_) => {}
            }
        }

        // Root fields of the subgraph protocol are not part of the merged API.
        if let Some(query) = graph.query_type_mut() {
            query
                .fields
                .retain(|field| !FEDERATION_ROOT_FIELDS.contains(&field.name.as_str()));
        }

        Ok(graph)
    }

    fn query_type_mut(&mut self) -> Option<&mut TypeDefinition> {
        let name = self.query_type().to_string();
        self.types_mut().get_mut(&name)
    }
}

fn convert_type(ty: AstType) -> TypeDefinition {
    let name = ty.name.node.to_string();
    let mut def = match ty.kind {
        AstKind::Scalar => TypeDefinition::new(name, TypeKind::Scalar),
        AstKind::Object(object) => {
            let mut def = TypeDefinition::new(name, TypeKind::Object);
            def.implements = object.implements.iter().map(|i| i.node.to_string()).collect();
            def.fields = object.fields.into_iter().map(convert_field).collect();
            def
        }
        AstKind::Interface(interface) => {
            let mut def = TypeDefinition::new(name, TypeKind::Interface);
            def.implements = interface.implements.iter().map(|i| i.node.to_string()).collect();
            def.fields = interface.fields.into_iter().map(convert_field).collect();
            def
        }
        AstKind::Union(union) => {
            let mut def = TypeDefinition::new(name, TypeKind::Union);
            def.members = union.members.iter().map(|m| m.node.to_string()).collect();
            def
        }
        AstKind::Enum(en) => {
            let mut def = TypeDefinition::new(name, TypeKind::Enum);
            def.values = en.values.iter().map(|v| v.node.value.node.to_string()).collect();
            def
        }
        AstKind::InputObject(input) => {
            let mut def = TypeDefinition::new(name, TypeKind::InputObject);
            def.fields = input
                .fields
                .into_iter()
                .map(|f| {
                    let arg = convert_input_value(f.node);
                    FieldDefinition::new(arg.name, arg.ty)
                })
                .collect();
            def
        }
    };
    def.extension = ty.extend;
    def.directives = ty.directives.into_iter().map(convert_directive).collect();
    def
}

fn convert_field(field: Positioned<AstField>) -> FieldDefinition {
    let field = field.node;
    FieldDefinition {
        name: field.name.node.to_string(),
        ty: convert_type_ref(&field.ty.node),
        arguments: field
            .arguments
            .into_iter()
            .map(|arg| convert_input_value(arg.node))
            .collect(),
        directives: field.directives.into_iter().map(convert_directive).collect(),
    }
}

fn convert_input_value(value: InputValueDefinition) -> ArgumentDefinition {
    ArgumentDefinition {
        name: value.name.node.to_string(),
        ty: convert_type_ref(&value.ty.node),
        default_value: value.default_value.map(|v| v.node),
    }
}

fn convert_directive(directive: Positioned<ConstDirective>) -> DirectiveUse {
    let directive = directive.node;
    DirectiveUse {
        name: directive.name.node.to_string(),
        arguments: directive
            .arguments
            .into_iter()
            .map(|(name, value)| (name.node.to_string(), value.node))
            .collect(),
    }
}

fn convert_type_ref(ty: &Type) -> TypeRef {
    let base = match &ty.base {
        BaseType::Named(name) => TypeRef::named(name.to_string()),
        BaseType::List(inner) => TypeRef::list(convert_type_ref(inner)),
    };
    if ty.nullable {
        base
    } else {
        TypeRef::non_null(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCTS: &str = r#"
        schema { query: Query }

        scalar _Any
        union _Entity = Product
        type _Service { sdl: String }

        type Query {
            product(id: ID!): Product
            _entities(representations: [_Any!]!): [_Entity]!
            _service: _Service!
        }

        type Product @key(fields: "id") @key(fields: "sku") {
            id: ID!
            sku: String
            name: String
            tags: [String!]!
        }
    "#;

    #[test]
    fn ingests_types_fields_and_directives() {
        let graph = SchemaGraph::from_sdl("products", PRODUCTS).expect("parses");

        assert!(graph.get_type("_Any").is_none());
        assert!(graph.get_type("_Service").is_none());

        let query = graph.get_type("Query").unwrap();
        assert_eq!(query.fields.len(), 1);
        let product_field = query.get_field("product").unwrap();
        assert_eq!(product_field.arguments[0].ty.to_string(), "ID!");

        let product = graph.get_type("Product").unwrap();
        assert_eq!(product.directives_named("key").count(), 2);
        assert_eq!(product.get_field("tags").unwrap().ty.to_string(), "[String!]!");
    }

    #[test]
    fn extension_flag_is_kept() {
        let graph = SchemaGraph::from_sdl(
            "inventory",
            r#"extend type Product @key(fields: "id") { id: ID! @external price: Float }"#,
        )
        .unwrap();

        let product = graph.get_type("Product").unwrap();
        assert!(product.extension);
        assert!(product.get_field("id").unwrap().has_directive("external"));
    }

    #[test]
    fn invalid_sdl_is_a_schema_error() {
        let err = SchemaGraph::from_sdl("broken", "type {").unwrap_err();
        assert!(matches!(err, Error::Schema(message) if message.contains("broken")));
    }
}
