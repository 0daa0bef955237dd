//! Error types for the federation gateway

use crate::graph::ServiceId;
use crate::types::PathSegment;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// Stitch-time failures arrive aggregated in [`Error::Stitch`]; everything else
/// is a request-time failure scoped to a single field or a single downstream call.
#[derive(Error, Debug)]
pub enum Error {
    /// Every violation found while stitching the subgraphs
    #[error("schema stitching failed: {0}")]
    Stitch(StitchErrors),

    /// Entity resolution failure for one field
    #[error(transparent)]
    EntityFetch(#[from] EntityFetchError),

    /// A downstream call failed as a whole
    #[error("service `{service}` failed: {message}")]
    Downstream { service: ServiceId, message: String },

    /// A batch group did not complete in time
    #[error("service `{service}` timed out")]
    Timeout { service: ServiceId },

    /// No executor registered for a service
    #[error("no query executor registered for service `{0}`")]
    MissingExecutor(ServiceId),

    /// Schema text could not be ingested
    #[error("GraphQL schema error: {0}")]
    Schema(String),

    /// Invalid request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication/authorization errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Middleware errors
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Convert error to GraphQL error format
    pub fn to_graphql_error(&self) -> GraphQLError {
        GraphQLError {
            message: self.to_string(),
            path: Vec::new(),
            extensions: self.extensions(),
        }
    }

    /// Copy of this error that can be handed to every member of a failed batch.
    pub(crate) fn fan_out(&self, service: &ServiceId) -> Error {
        match self {
            Error::Timeout { service } => Error::Timeout {
                service: service.clone(),
            },
            Error::EntityFetch(err) => Error::EntityFetch(err.clone()),
            other => Error::Downstream {
                service: service.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Get error code for extensions
    fn extensions(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let code = match self {
            Error::Stitch(_) => "STITCH_ERROR",
            Error::EntityFetch(err) => err.code(),
            Error::Downstream { .. } => "DOWNSTREAM_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::MissingExecutor(_) => "MISSING_EXECUTOR",
            Error::Schema(_) => "SCHEMA_ERROR",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Middleware(_) => "MIDDLEWARE_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        };
        map.insert("code".to_string(), serde_json::json!(code));
        match self {
            Error::Downstream { service, .. } | Error::Timeout { service } => {
                map.insert("service".to_string(), serde_json::json!(service.as_str()));
            }
            Error::EntityFetch(err) => {
                map.insert("service".to_string(), serde_json::json!(err.service().as_str()));
            }
            _ => {}
        }
        map
    }
}

/// Conflicts found while folding subgraphs into one graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaMergeError {
    #[error("`{type_name}.{field}` is `{existing}` in an earlier service but `{incoming}` in `{service}`")]
    TypeMismatch {
        service: ServiceId,
        type_name: String,
        field: String,
        existing: String,
        incoming: String,
    },

    #[error("`{type_name}.{field}` is declared by several services and has arguments (`{service}`)")]
    ArgumentsNotAllowed {
        service: ServiceId,
        type_name: String,
        field: String,
    },

    #[error("`{type_name}.{field}` is declared by several services and has directives (`{service}`)")]
    DirectivesNotAllowed {
        service: ServiceId,
        type_name: String,
        field: String,
    },

    #[error("`{type_name}.{field}` is declared by several services but does not return an object type (`{service}`)")]
    NotAnObjectType {
        service: ServiceId,
        type_name: String,
        field: String,
    },

    #[error("`{type_name}.{field}` is owned by `{owner}` and cannot also be provided by `{service}`")]
    SharedOwnershipViolation {
        service: ServiceId,
        type_name: String,
        field: String,
        owner: ServiceId,
    },

    #[error("key `{key}` of extension `{type_name}` in `{service}` is not a subset of any base key")]
    KeyNotSubset {
        service: ServiceId,
        type_name: String,
        key: String,
    },

    #[error("`{service}` extends `{type_name}`, but no service declares it as an entity")]
    MissingBaseEntity { service: ServiceId, type_name: String },

    #[error("no resolution strategy registered for `{type_name}.{field}`")]
    UnregisteredField { type_name: String, field: String },

    #[error("resolver argument on `{type_name}.{field}` is invalid: {reason}")]
    InvalidResolverArgument {
        type_name: String,
        field: String,
        reason: String,
    },
}

/// Misuse of a federation directive inside one subgraph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveValidationError {
    #[error("@{directive} on {location} in `{service}` needs a non-empty `fields` string")]
    EmptyFieldsArgument {
        service: ServiceId,
        directive: String,
        location: String,
    },

    #[error("@{directive} on {location} in `{service}` takes `fields`, not `{argument}`")]
    WrongArgumentName {
        service: ServiceId,
        directive: String,
        location: String,
        argument: String,
    },

    #[error("@{directive} on {location} in `{service}` takes exactly one argument, got {count}")]
    TooManyArguments {
        service: ServiceId,
        directive: String,
        location: String,
        count: usize,
    },

    #[error("@{directive} on {location} in `{service}` references `{reference}`: {reason}")]
    InvalidFieldReference {
        service: ServiceId,
        directive: String,
        location: String,
        reference: String,
        reason: String,
    },

    #[error("@{directive} is not allowed on {location} in `{service}`")]
    InvalidDirectiveLocation {
        service: ServiceId,
        directive: String,
        location: String,
    },

    #[error("`{type_name}.{field}` is marked @external in `{service}` but the base type has no such field")]
    ExternalFieldNotFoundInBase {
        service: ServiceId,
        type_name: String,
        field: String,
    },
}

/// One stitch-time violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StitchViolation {
    #[error(transparent)]
    Merge(#[from] SchemaMergeError),
    #[error(transparent)]
    Directive(#[from] DirectiveValidationError),
}

/// Every violation found in one stitch attempt, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StitchErrors(Vec<StitchViolation>);

impl StitchErrors {
    pub fn push(&mut self, violation: impl Into<StitchViolation>) {
        self.0.push(violation.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StitchViolation> {
        self.0.iter()
    }

    pub(crate) fn extend(&mut self, other: StitchErrors) {
        self.0.extend(other.0);
    }

    /// `Ok(value)` when nothing was recorded.
    pub(crate) fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(Error::Stitch(self))
        }
    }
}

impl fmt::Display for StitchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl IntoIterator for StitchErrors {
    type Item = StitchViolation;
    type IntoIter = std::vec::IntoIter<StitchViolation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Per-field failures of the `_entities` protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityFetchError {
    #[error("cannot resolve `{type_name}.{field}` from `{service}`: the parent object has no complete key")]
    MissingKeyData {
        service: ServiceId,
        type_name: String,
        field: String,
    },

    #[error("`{service}` returned no `_entities` while resolving `{type_name}.{field}`")]
    NoEntitiesInResponse {
        service: ServiceId,
        type_name: String,
        field: String,
    },

    #[error("`{service}` failed to resolve `{type_name}.{field}`: {message}")]
    DownstreamFieldError {
        service: ServiceId,
        type_name: String,
        field: String,
        message: String,
    },
}

impl EntityFetchError {
    pub fn service(&self) -> &ServiceId {
        match self {
            EntityFetchError::MissingKeyData { service, .. }
            | EntityFetchError::NoEntitiesInResponse { service, .. }
            | EntityFetchError::DownstreamFieldError { service, .. } => service,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            EntityFetchError::MissingKeyData { .. } => "MISSING_KEY_DATA",
            EntityFetchError::NoEntitiesInResponse { .. } => "NO_ENTITIES_IN_RESPONSE",
            EntityFetchError::DownstreamFieldError { .. } => "DOWNSTREAM_FIELD_ERROR",
        }
    }
}

/// GraphQL error response format
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_errors_carry_code_and_service() {
        let err = Error::from(EntityFetchError::NoEntitiesInResponse {
            service: ServiceId::new("inventory"),
            type_name: "Product".into(),
            field: "price".into(),
        });
        let gql = err.to_graphql_error();
        assert!(gql.message.contains("Product.price"));
        assert_eq!(gql.extensions["code"], serde_json::json!("NO_ENTITIES_IN_RESPONSE"));
        assert_eq!(gql.extensions["service"], serde_json::json!("inventory"));
    }

    #[test]
    fn stitch_errors_display_every_violation() {
        let mut errors = StitchErrors::default();
        errors.push(SchemaMergeError::ArgumentsNotAllowed {
            service: ServiceId::new("b"),
            type_name: "Query".into(),
            field: "product".into(),
        });
        errors.push(DirectiveValidationError::InvalidDirectiveLocation {
            service: ServiceId::new("b"),
            directive: "key".into(),
            location: "scalar `Date`".into(),
        });

        assert_eq!(errors.len(), 2);
        let message = Error::Stitch(errors).to_string();
        assert!(message.contains("Query.product"));
        assert!(message.contains("@key is not allowed on scalar `Date`"));
    }

    #[test]
    fn fan_out_preserves_timeouts() {
        let service = ServiceId::new("reviews");
        let err = Error::Timeout {
            service: service.clone(),
        };
        assert!(matches!(err.fan_out(&service), Error::Timeout { .. }));

        let err = Error::Internal("boom".into()).fan_out(&service);
        assert!(matches!(err, Error::Downstream { message, .. } if message.contains("boom")));
    }
}
