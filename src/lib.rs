//! # graphql-federation-gateway
//!
//! A Rust gateway that stitches independently authored GraphQL subgraph schemas
//! into one client-facing schema and resolves federated entities across them.
//!
//! ## Features
//!
//! - **Schema stitching**: subgraph SDL is merged into a [`UnifiedGraph`] with
//!   union ownership of root fields and validated shared (namespace) types
//! - **Federation directives**: `@key`, `@external`, `@requires`, `@provides`
//!   and `@extends` are validated and turned into entity metadata
//! - **Batching**: fetches issued on the same execution level are coalesced
//!   into one downstream call per service
//! - **Entity resolution**: fields contributed by extensions are fetched
//!   through `_entities` with the parent's representation
//! - **Middleware**: extensible middleware system for auth and logging
//!
//! ## Main Components
//!
//! - [`Gateway`]: The main entry point for creating and running the gateway.
//! - [`GatewayBuilder`]: Configuration builder for the gateway.
//! - [`SchemaBuilder`] and [`GraphMerger`]: stitch subgraphs without a gateway.
//! - [`QueryExecutor`]: transport to one subgraph; [`HttpQueryExecutor`] speaks
//!   GraphQL over HTTP.
//! - [`RequestScope`]: per-request field resolution and batch dispatch.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_federation_gateway::{Gateway, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let products = ServiceConfig {
//!         name: "products".into(),
//!         endpoint: "http://localhost:4001/graphql".into(),
//!         timeout_ms: Some(2_000),
//!         forward_headers: vec!["authorization".into()],
//!     };
//!
//!     Gateway::builder()
//!         .add_service(&products, "type Query { product(id: ID!): Product } type Product @key(fields: \"id\") { id: ID! name: String }")?
//!         .serve("0.0.0.0:8888")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dataloader;
pub mod directives;
pub mod document;
pub mod entity;
pub mod error;
pub mod execution;
pub mod executor;
pub mod federation;
pub mod field_set;
pub mod gateway;
pub mod graph;
pub mod merge;
pub mod middleware;
pub mod registry;
pub mod resolve;
pub mod runtime;
pub mod schema;
pub mod sdl;
pub mod types;

pub use dataloader::BatchDispatcher;
pub use entity::EntityResolver;
pub use error::{
    DirectiveValidationError, EntityFetchError, Error, GraphQLError, Result, SchemaMergeError,
    StitchErrors, StitchViolation,
};
pub use executor::{HttpQueryExecutor, QueryExecutor, QueryExecutorPool};
pub use federation::{EntityExtensionSpec, EntitySpec, FederationMetadata, KeyDirectiveSpec};
pub use field_set::FieldSet;
pub use gateway::{Gateway, GatewayBuilder};
pub use graph::{FieldCoordinate, SchemaGraph, ServiceId, TypeDefinition, TypeKind, TypeRef};
pub use merge::{GraphMerger, UnifiedGraph};
pub use middleware::{AuthMiddleware, LoggingMiddleware, Middleware, RequestContext};
pub use registry::{ArgumentSource, FieldDispatchRegistry, ResolutionContext};
pub use resolve::{FieldInfo, RequestScope, Resolved};
pub use runtime::ServeMux;
pub use schema::{FederatedSchema, SchemaBuilder};
pub use types::{GraphQLRequest, GraphQLResponse, OperationKind, PathSegment, ServiceConfig};
