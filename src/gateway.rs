//! Gateway builder and main orchestration

use crate::error::{Error, GraphQLError, Result};
use crate::execution::ExecutionEnvironment;
use crate::executor::{HttpQueryExecutor, QueryExecutor, QueryExecutorPool};
use crate::graph::{FieldCoordinate, ServiceId};
use crate::middleware::{Middleware, RequestContext};
use crate::registry::ArgumentSource;
use crate::runtime::ServeMux;
use crate::schema::{FederatedSchema, SchemaBuilder};
use crate::types::{GraphQLRequest, GraphQLResponse, ServiceConfig};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

/// Main Gateway struct - entry point for the library
pub struct Gateway {
    mux: ServeMux,
    executors: Arc<QueryExecutorPool>,
    schema: FederatedSchema,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Get the ServeMux
    pub fn mux(&self) -> &ServeMux {
        &self.mux
    }

    /// Access the stitched schema
    pub fn schema(&self) -> &FederatedSchema {
        &self.schema
    }

    pub fn executors(&self) -> &QueryExecutorPool {
        &self.executors
    }

    /// Execute one operation in-process, running the middlewares first.
    pub async fn execute(&self, request: GraphQLRequest, context: RequestContext) -> GraphQLResponse {
        self.mux.execute(request, context).await
    }

    /// Convert gateway into Axum router
    pub fn into_router(self) -> Router {
        self.mux.into_router()
    }
}

/// Builder for creating a Gateway
pub struct GatewayBuilder {
    executors: QueryExecutorPool,
    schema_builder: SchemaBuilder,
    middlewares: Vec<Arc<dyn Middleware>>,
    error_handler: Option<Arc<dyn Fn(Vec<GraphQLError>) + Send + Sync>>,
    batch_timeout: Option<Duration>,
    cors: Option<CorsLayer>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self {
            executors: QueryExecutorPool::new(),
            schema_builder: SchemaBuilder::new(),
            middlewares: Vec::new(),
            error_handler: None,
            batch_timeout: None,
            cors: None,
        }
    }

    /// Register a subgraph: its SDL and the executor its fetches go to.
    ///
    /// Subgraphs are merged in registration order.
    pub fn add_subgraph(
        mut self,
        name: impl Into<ServiceId>,
        sdl: impl Into<String>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        let name = name.into();
        self.executors.add(name.clone(), executor);
        self.schema_builder = self.schema_builder.with_subgraph_sdl(name, sdl);
        self
    }

    /// Register a subgraph served over HTTP.
    pub fn add_service(self, config: &ServiceConfig, sdl: impl Into<String>) -> Result<Self> {
        let executor = HttpQueryExecutor::from_config(config)?;
        Ok(self.add_subgraph(config.name.as_str(), sdl, Arc::new(executor)))
    }

    /// Register an HTTP subgraph whose SDL lives in a file.
    pub fn add_service_file(self, config: &ServiceConfig, path: impl AsRef<Path>) -> Result<Self> {
        let sdl = std::fs::read_to_string(path)?;
        self.add_service(config, sdl)
    }

    /// Add middleware
    pub fn add_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Bound every batched downstream call of a request.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Resolve arguments of `coordinate` through other services before the
    /// field is fetched.
    pub fn with_resolver_argument(mut self, coordinate: FieldCoordinate, sources: Vec<ArgumentSource>) -> Self {
        self.schema_builder = self.schema_builder.with_resolver_argument(coordinate, sources);
        self
    }

    /// Provide a handler to inspect GraphQL errors before they are returned.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<GraphQLError>) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_cors(mut self, cors: CorsLayer) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        let schema = self.schema_builder.build()?;
        if let Some(missing) = schema
            .services()
            .iter()
            .find(|service| !self.executors.contains(service))
        {
            return Err(Error::MissingExecutor(missing.clone()));
        }

        let executors = Arc::new(self.executors);
        let mut mux = ServeMux::new(ExecutionEnvironment {
            graph: schema.shared(),
            executors: executors.clone(),
            batch_timeout: self.batch_timeout,
        });

        for middleware in self.middlewares {
            mux.add_middleware(middleware);
        }
        if let Some(handler) = self.error_handler {
            mux.set_error_handler_arc(handler);
        }
        if let Some(cors) = self.cors {
            mux.set_cors(cors);
        }

        tracing::info!(
            services = schema.services().len(),
            types = schema.graph().types().count(),
            "gateway built"
        );

        Ok(Gateway {
            mux,
            executors,
            schema,
        })
    }

    /// Build and start the gateway server
    pub async fn serve(self, addr: impl Into<String>) -> Result<()> {
        let gateway = self.build()?;
        let addr = addr.into();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Gateway server listening on {}", addr);

        let app = gateway.into_router();
        axum::serve(listener, app).await?;

        Ok(())
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubgraphRequest;

    struct Static(serde_json::Value);

    #[async_trait::async_trait]
    impl QueryExecutor for Static {
        async fn execute(&self, _request: SubgraphRequest, _ctx: &RequestContext) -> Result<GraphQLResponse> {
            Ok(GraphQLResponse::success(self.0.clone()))
        }
    }

    #[test]
    fn test_builder_creation() {
        let builder = GatewayBuilder::new();
        let result = builder.build();
        assert!(result.is_err());
    }

    #[test]
    fn build_registers_every_executor() {
        let gateway = Gateway::builder()
            .add_subgraph("a", "type Query { a: String }", Arc::new(Static(serde_json::json!({}))))
            .add_subgraph("b", "type Query { b: String }", Arc::new(Static(serde_json::json!({}))))
            .build()
            .unwrap();

        assert_eq!(gateway.executors().names().len(), 2);
        assert_eq!(gateway.schema().services().len(), 2);
    }

    #[test]
    fn http_services_come_from_config() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "name": "products",
            "endpoint": "http://localhost:4001/graphql",
            "timeout_ms": 500
        }))
        .unwrap();

        let gateway = Gateway::builder()
            .add_service(&config, "type Query { product: String }")
            .unwrap()
            .build()
            .unwrap();
        assert!(gateway.executors().contains(&ServiceId::new("products")));
    }

    #[test]
    fn http_service_sdl_from_file() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "name": "inventory",
            "endpoint": "http://localhost:4002/graphql"
        }))
        .unwrap();
        let path = std::env::temp_dir().join(format!("gateway-inventory-{}.graphql", std::process::id()));
        std::fs::write(&path, "type Query { warehouses: [String!]! }").unwrap();

        let builder = Gateway::builder().add_service_file(&config, &path);
        std::fs::remove_file(&path).unwrap();

        let gateway = builder.unwrap().build().unwrap();
        assert!(gateway.executors().contains(&ServiceId::new("inventory")));
        assert!(Gateway::builder().add_service_file(&config, &path).is_err());
    }

    #[tokio::test]
    async fn execute_runs_in_process() {
        let gateway = Gateway::builder()
            .add_subgraph(
                "a",
                "type Query { a: String }",
                Arc::new(Static(serde_json::json!({ "a": "hi" }))),
            )
            .build()
            .unwrap();

        let response = gateway
            .execute(GraphQLRequest::new("{ a }"), RequestContext::default())
            .await;
        assert_eq!(response.data, Some(serde_json::json!({ "a": "hi" })));
        assert!(response.errors.is_empty());
    }
}
