//! Federation directive processing.
//!
//! Each subgraph is scanned once. `@key` alternatives become
//! [`KeyDirectiveSpec`]s, `extend type`/`@extends` types with keys become
//! [`EntityExtensionSpec`]s, and every misuse is recorded instead of aborting, so
//! the caller can report all violations together.
//!
//! References inside an extension's field sets usually point at fields only the
//! base service declares, so those are checked later against the merged type
//! (see [`check_references`]).

use crate::error::{DirectiveValidationError, StitchErrors};
use crate::federation::{EntityExtensionSpec, EntitySpec, FederationMetadata, KeyDirectiveSpec};
use crate::field_set::{FieldSet, FieldSetItem};
use crate::graph::{DirectiveUse, SchemaGraph, ServiceId, TypeDefinition, TypeKind};
use async_graphql::Value as GqlValue;

pub const KEY: &str = "key";
pub const EXTERNAL: &str = "external";
pub const REQUIRES: &str = "requires";
pub const PROVIDES: &str = "provides";
pub const EXTENDS: &str = "extends";

const FIELDS_ARGUMENT: &str = "fields";

/// Extract the federation metadata of one subgraph.
pub fn process(graph: &SchemaGraph) -> (FederationMetadata, StitchErrors) {
    let service = graph.service().clone();
    let mut metadata = FederationMetadata::new(service.clone());
    let mut errors = StitchErrors::default();

    for ty in graph.types() {
        check_type_level_locations(&service, ty, &mut errors);

        let keys = process_keys(&service, ty, &mut errors);
        let is_extension = (ty.extension || ty.has_directive(EXTENDS)) && !keys.is_empty();

        let mut extension = is_extension.then(|| {
            let mut spec = EntityExtensionSpec::new(ty.name.clone(), service.clone());
            spec.keys = keys.clone();
            spec
        });

        for field in &ty.fields {
            let location = format!("field `{}.{}`", ty.name, field.name);
            for directive in &field.directives {
                match directive.name.as_str() {
                    KEY | EXTENDS => errors.push(DirectiveValidationError::InvalidDirectiveLocation {
                        service: service.clone(),
                        directive: directive.name.clone(),
                        location: location.clone(),
                    }),
                    EXTERNAL => {
                        if let Some(spec) = extension.as_mut() {
                            spec.external_fields.insert(field.name.clone());
                        }
                    }
                    REQUIRES => {
                        let Ok(set) = fields_argument(&service, directive, &location, &mut errors) else {
                            continue;
                        };
                        match extension.as_mut() {
                            Some(spec) => {
                                spec.required_fields_by_field_name.insert(field.name.clone(), set);
                            }
                            None => {
                                if let Err((reference, reason)) =
                                    check_references(set.items(), &ty.name, |name| graph.get_type(name))
                                {
                                    errors.push(invalid_reference(&service, REQUIRES, &location, reference, reason));
                                }
                            }
                        }
                    }
                    PROVIDES => {
                        // Passthrough: only the argument shape is checked.
                        let _ = fields_argument(&service, directive, &location, &mut errors);
                    }
                    _ => {}
                }
            }
        }

        if let Some(spec) = extension {
            tracing::debug!(service = %service, type_name = %ty.name, "registered entity extension");
            metadata.extensions_by_type_name.insert(ty.name.clone(), spec);
        } else if !keys.is_empty() {
            let location = type_location(ty);
            let mut valid = true;
            for key in &keys {
                if let Err((reference, reason)) =
                    check_references(key.fields().items(), &ty.name, |name| graph.get_type(name))
                {
                    errors.push(invalid_reference(&service, KEY, &location, reference, reason));
                    valid = false;
                }
            }
            if valid {
                tracing::debug!(service = %service, type_name = %ty.name, keys = keys.len(), "registered entity");
                metadata.entities_by_type_name.insert(
                    ty.name.clone(),
                    EntitySpec {
                        type_name: ty.name.clone(),
                        keys,
                        service: service.clone(),
                    },
                );
            }
        }
    }

    (metadata, errors)
}

fn check_type_level_locations(service: &ServiceId, ty: &TypeDefinition, errors: &mut StitchErrors) {
    for directive in &ty.directives {
        let misplaced = match directive.name.as_str() {
            EXTERNAL | REQUIRES | PROVIDES => true,
            KEY => !matches!(ty.kind, TypeKind::Object | TypeKind::Interface),
            _ => false,
        };
        if misplaced {
            errors.push(DirectiveValidationError::InvalidDirectiveLocation {
                service: service.clone(),
                directive: directive.name.clone(),
                location: type_location(ty),
            });
        }
    }
}

fn process_keys(service: &ServiceId, ty: &TypeDefinition, errors: &mut StitchErrors) -> Vec<KeyDirectiveSpec> {
    if !matches!(ty.kind, TypeKind::Object | TypeKind::Interface) {
        return Vec::new();
    }
    let location = type_location(ty);
    ty.directives_named(KEY)
        .filter_map(|directive| fields_argument(service, directive, &location, errors).ok())
        .map(KeyDirectiveSpec::new)
        .collect()
}

/// Validate the single `fields: String!` argument shared by `@key`,
/// `@requires` and `@provides`, and parse it.
pub(crate) fn fields_argument(
    service: &ServiceId,
    directive: &DirectiveUse,
    location: &str,
    errors: &mut StitchErrors,
) -> Result<FieldSet, ()> {
    let fail = |errors: &mut StitchErrors, err: DirectiveValidationError| {
        errors.push(err);
        Err(())
    };

    let (name, value) = match directive.arguments.as_slice() {
        [] => {
            return fail(
                errors,
                DirectiveValidationError::EmptyFieldsArgument {
                    service: service.clone(),
                    directive: directive.name.clone(),
                    location: location.to_string(),
                },
            )
        }
        [(name, value)] => (name, value),
        arguments => {
            return fail(
                errors,
                DirectiveValidationError::TooManyArguments {
                    service: service.clone(),
                    directive: directive.name.clone(),
                    location: location.to_string(),
                    count: arguments.len(),
                },
            )
        }
    };

    if name != FIELDS_ARGUMENT {
        return fail(
            errors,
            DirectiveValidationError::WrongArgumentName {
                service: service.clone(),
                directive: directive.name.clone(),
                location: location.to_string(),
                argument: name.clone(),
            },
        );
    }

    let fields = match value {
        GqlValue::String(fields) if !fields.trim().is_empty() => fields,
        _ => {
            return fail(
                errors,
                DirectiveValidationError::EmptyFieldsArgument {
                    service: service.clone(),
                    directive: directive.name.clone(),
                    location: location.to_string(),
                },
            )
        }
    };

    FieldSet::parse(fields).or_else(|reason| {
        fail(
            errors,
            invalid_reference(service, &directive.name, location, fields.clone(), reason),
        )
    })
}

/// Check that every name of a field set exists on `type_name`, descending
/// into the return type of fields with nested selections.
///
/// Returns the offending reference and the reason on failure.
pub(crate) fn check_references<'a, F>(
    items: &[FieldSetItem],
    type_name: &str,
    lookup: F,
) -> Result<(), (String, String)>
where
    F: Fn(&str) -> Option<&'a TypeDefinition> + Copy,
{
    let ty = lookup(type_name).ok_or_else(|| (type_name.to_string(), format!("unknown type `{type_name}`")))?;

    for item in items {
        let field = ty
            .get_field(&item.name)
            .ok_or_else(|| (item.name.clone(), format!("`{type_name}` has no field `{}`", item.name)))?;

        if item.selections.is_empty() {
            continue;
        }

        let nested = field.ty.named_type();
        match lookup(nested) {
            Some(nested_ty) if nested_ty.kind.is_composite() => {
                check_references(&item.selections, nested, lookup)?;
            }
            _ => {
                return Err((
                    item.name.clone(),
                    format!("`{type_name}.{}` returns `{nested}`, which has no fields to select", item.name),
                ))
            }
        }
    }
    Ok(())
}

pub(crate) fn invalid_reference(
    service: &ServiceId,
    directive: &str,
    location: &str,
    reference: String,
    reason: String,
) -> DirectiveValidationError {
    DirectiveValidationError::InvalidFieldReference {
        service: service.clone(),
        directive: directive.to_string(),
        location: location.to_string(),
        reference,
        reason,
    }
}

pub(crate) fn type_location(ty: &TypeDefinition) -> String {
    format!("{} `{}`", ty.kind, ty.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StitchViolation;
    use crate::graph::{FieldDefinition, TypeRef};

    fn process_sdl(sdl: &str) -> (FederationMetadata, Vec<DirectiveValidationError>) {
        let graph = SchemaGraph::from_sdl("svc", sdl).expect("valid sdl");
        let (metadata, errors) = process(&graph);
        let errors = errors
            .into_iter()
            .map(|violation| match violation {
                StitchViolation::Directive(err) => err,
                other => panic!("unexpected violation {other:?}"),
            })
            .collect();
        (metadata, errors)
    }

    #[test]
    fn key_on_existing_field_registers_entity() {
        let (metadata, errors) = process_sdl(r#"type Product @key(fields: "id") { id: ID! name: String }"#);
        assert!(errors.is_empty(), "{errors:?}");
        let entity = &metadata.entities_by_type_name["Product"];
        assert_eq!(entity.keys.len(), 1);
        assert_eq!(entity.service, ServiceId::new("svc"));
    }

    #[test]
    fn key_on_missing_field_is_invalid_reference() {
        let (metadata, errors) = process_sdl(r#"type Product @key(fields: "id") { name: String }"#);
        assert!(metadata.entities_by_type_name.is_empty());
        assert!(matches!(
            &errors[..],
            [DirectiveValidationError::InvalidFieldReference { reference, .. }] if reference == "id"
        ));
    }

    #[test]
    fn nested_key_selections_resolve_recursively() {
        let (_, errors) = process_sdl(
            r#"
            type User @key(fields: "id org { id }") { id: ID! org: Org }
            type Org { id: ID! }
            type Team @key(fields: "org { slug }") { org: Org }
            "#,
        );
        assert!(matches!(
            &errors[..],
            [DirectiveValidationError::InvalidFieldReference { reference, .. }] if reference == "slug"
        ));
    }

    #[test]
    fn argument_shape_violations() {
        let (_, errors) = process_sdl(
            r#"
            type A @key(fields: "") { id: ID }
            type B @key(field: "id") { id: ID }
            type C @key(fields: "id", resolvable: false) { id: ID }
            type D @key { id: ID }
            "#,
        );
        assert!(matches!(errors[0], DirectiveValidationError::EmptyFieldsArgument { .. }));
        assert!(matches!(&errors[1], DirectiveValidationError::WrongArgumentName { argument, .. } if argument == "field"));
        assert!(matches!(errors[2], DirectiveValidationError::TooManyArguments { count: 2, .. }));
        assert!(matches!(errors[3], DirectiveValidationError::EmptyFieldsArgument { .. }));
    }

    #[test]
    fn key_on_scalar_is_invalid_location() {
        let graph = SchemaGraph::new("svc").with_type(
            TypeDefinition::new("Date", TypeKind::Scalar)
                .directive(DirectiveUse::new(KEY).argument(FIELDS_ARGUMENT, "id")),
        );
        let (_, errors) = process(&graph);
        assert!(matches!(
            errors.iter().next(),
            Some(StitchViolation::Directive(DirectiveValidationError::InvalidDirectiveLocation { .. }))
        ));
    }

    #[test]
    fn extension_collects_external_and_requires() {
        let (metadata, errors) = process_sdl(
            r#"
            extend type Product @key(fields: "id") {
                id: ID! @external
                weight: Float @external
                shippingEstimate: Int @requires(fields: "weight")
                price: Float
            }
            "#,
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert!(metadata.entities_by_type_name.is_empty());
        let spec = &metadata.extensions_by_type_name["Product"];
        assert!(spec.external_fields.contains("id"));
        assert!(spec.external_fields.contains("weight"));
        assert_eq!(spec.requires("shippingEstimate").unwrap().to_string(), "weight");
        assert_eq!(spec.base_service, None);
    }

    #[test]
    fn extend_without_key_is_a_plain_type() {
        let graph = SchemaGraph::new("svc").with_type(
            TypeDefinition::object("Query")
                .extend()
                .field(FieldDefinition::new("me", TypeRef::named("String"))),
        );
        let (metadata, errors) = process(&graph);
        assert!(errors.is_empty());
        assert!(!metadata.is_enabled());
    }
}
