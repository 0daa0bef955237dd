//! Per-service schema model.
//!
//! A [`SchemaGraph`] is the typed form of one subgraph's schema. It is built once
//! when the service is registered (see [`SchemaGraph::from_sdl`] for the SDL
//! ingest adapter) and never mutated afterwards; the merge engine only reads it.

use async_graphql::Value as GqlValue;
use async_graphql::indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a subgraph service. Doubles as the batching namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServiceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of a named type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Scalar,
    Enum,
    InputObject,
}

impl TypeKind {
    /// Object, interface and union types carry selection sets.
    pub fn is_composite(self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Scalar => "scalar",
            TypeKind::Enum => "enum",
            TypeKind::InputObject => "input object",
        };
        f.write_str(name)
    }
}

/// Reference to a type, with list and non-null wrapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn named_nn(name: impl Into<String>) -> Self {
        TypeRef::NonNull(Box::new(TypeRef::named(name)))
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    /// The innermost named type.
    pub fn named_type(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

/// A directive applied to a type or a field, with constant arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectiveUse {
    pub name: String,
    pub arguments: Vec<(String, GqlValue)>,
}

impl DirectiveUse {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<GqlValue>) -> Self {
        self.arguments.push((name.into(), value.into()));
        self
    }

    pub fn get_argument(&self, name: &str) -> Option<&GqlValue> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<GqlValue>,
}

impl ArgumentDefinition {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            default_value: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub arguments: Vec<ArgumentDefinition>,
    pub directives: Vec<DirectiveUse>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            arguments: Vec::new(),
            directives: Vec::new(),
        }
    }

    pub fn argument(mut self, argument: ArgumentDefinition) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn directive(mut self, directive: DirectiveUse) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.iter().any(|d| d.name == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub fields: Vec<FieldDefinition>,
    pub directives: Vec<DirectiveUse>,
    /// Declared with `extend type`.
    pub extension: bool,
    /// Interfaces implemented by an object or interface type.
    pub implements: Vec<String>,
    /// Members of a union type.
    pub members: Vec<String>,
    /// Values of an enum type.
    pub values: Vec<String>,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            directives: Vec::new(),
            extension: false,
            implements: Vec::new(),
            members: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Object)
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn directive(mut self, directive: DirectiveUse) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn extend(mut self) -> Self {
        self.extension = true;
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.iter().any(|d| d.name == name)
    }

    pub fn directives_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DirectiveUse> {
        self.directives.iter().filter(move |d| d.name == name)
    }
}

/// One subgraph's schema.
#[derive(Clone, Debug)]
pub struct SchemaGraph {
    service: ServiceId,
    types: IndexMap<String, TypeDefinition>,
    query_type: String,
    mutation_type: Option<String>,
}

impl SchemaGraph {
    pub fn new(service: impl Into<ServiceId>) -> Self {
        Self {
            service: service.into(),
            types: IndexMap::new(),
            query_type: "Query".to_string(),
            mutation_type: None,
        }
    }

    /// Add a type. A second definition with the same name is folded into the
    /// first one, which is how `extend type` behaves inside one document.
    pub fn with_type(mut self, ty: TypeDefinition) -> Self {
        self.insert_type(ty);
        self
    }

    pub(crate) fn insert_type(&mut self, ty: TypeDefinition) {
        match self.types.get_mut(&ty.name) {
            Some(existing) => {
                existing.extension &= ty.extension;
                existing.fields.extend(ty.fields);
                existing.directives.extend(ty.directives);
                existing.implements.extend(ty.implements);
                existing.members.extend(ty.members);
                existing.values.extend(ty.values);
            }
            None => {
                self.types.insert(ty.name.clone(), ty);
            }
        }
    }

    pub fn with_query_type(mut self, name: impl Into<String>) -> Self {
        self.query_type = name.into();
        self
    }

    pub fn with_mutation_type(mut self, name: impl Into<String>) -> Self {
        self.mutation_type = Some(name.into());
        self
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub(crate) fn types_mut(&mut self) -> &mut IndexMap<String, TypeDefinition> {
        &mut self.types
    }

    pub fn query_type(&self) -> &str {
        &self.query_type
    }

    /// The mutation root, either declared in a `schema` block or a type named `Mutation`.
    pub fn mutation_type(&self) -> Option<&str> {
        match &self.mutation_type {
            Some(name) => Some(name),
            None => self.types.contains_key("Mutation").then_some("Mutation"),
        }
    }
}

/// A (type, field) pair. Equality is by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldCoordinate {
    pub type_name: String,
    pub field_name: String,
}

impl FieldCoordinate {
    pub fn new(type_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            field_name: field_name.into(),
        }
    }
}

impl fmt::Display for FieldCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.field_name)
    }
}
