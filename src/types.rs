//! Type definitions for the federation gateway

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// GraphQL request, used both for inbound requests and for subgraph calls
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GraphQLRequest {
    /// GraphQL query string
    #[serde(default)]
    pub query: String,

    /// Operation name (optional)
    #[serde(rename = "operationName", default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// Variables for the query
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, serde_json::Value>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// Request sent to a subgraph's [`QueryExecutor`](crate::executor::QueryExecutor).
pub type SubgraphRequest = GraphQLRequest;

/// GraphQL response to client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Response data
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// Errors if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<crate::error::GraphQLError>,
}

impl GraphQLResponse {
    /// Create a successful response
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Create an error response
    pub fn error(error: crate::error::GraphQLError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    /// Create an error response from multiple errors
    pub fn errors(errors: Vec<crate::error::GraphQLError>) -> Self {
        Self { data: None, errors }
    }
}

/// One step of a response path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Field(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Field(name) => f.write_str(name),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Field(value.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        PathSegment::Index(value)
    }
}

/// Root operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

/// Downstream service configuration
///
/// Describes a subgraph reachable over HTTP; see
/// [`GatewayBuilder::add_service`](crate::gateway::GatewayBuilder::add_service).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service name, also the batching namespace
    pub name: String,

    /// GraphQL endpoint URL
    pub endpoint: String,

    /// Per-call timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Inbound headers copied onto every downstream call
    #[serde(default)]
    pub forward_headers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_wire_names() {
        let request: GraphQLRequest = serde_json::from_value(serde_json::json!({
            "query": "{ a }",
            "operationName": "A",
            "variables": { "id": "p1" }
        }))
        .unwrap();

        assert_eq!(request.operation_name.as_deref(), Some("A"));
        assert_eq!(request.variables["id"], serde_json::json!("p1"));
    }

    #[test]
    fn path_segments_serialize_untagged() {
        let path = vec![PathSegment::from("products"), PathSegment::from(1), "price".into()];
        assert_eq!(
            serde_json::to_value(&path).unwrap(),
            serde_json::json!(["products", 1, "price"])
        );
    }

    #[test]
    fn service_config_defaults() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "name": "products",
            "endpoint": "http://localhost:4001/graphql"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, None);
        assert!(config.forward_headers.is_empty());
    }
}
