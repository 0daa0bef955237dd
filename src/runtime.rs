//! Runtime support for the gateway - HTTP integration.

use crate::error::{Error, GraphQLError, Result};
use crate::execution::{self, ExecutionEnvironment};
use crate::middleware::{Middleware, RequestContext};
use crate::types::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    http::HeaderMap,
    response::{Html, IntoResponse},
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// ServeMux - main gateway handler
///
/// The `ServeMux` runs middlewares and executes operations against the
/// federated schema. It can be converted into an Axum router.
#[derive(Clone)]
pub struct ServeMux {
    env: ExecutionEnvironment,
    middlewares: Vec<Arc<dyn Middleware>>,
    error_handler: Option<Arc<dyn Fn(Vec<GraphQLError>) + Send + Sync>>,
    cors: Option<CorsLayer>,
}

impl ServeMux {
    pub fn new(env: ExecutionEnvironment) -> Self {
        Self {
            env,
            middlewares: Vec::new(),
            error_handler: None,
            cors: None,
        }
    }

    /// Add middleware to the execution pipeline
    ///
    /// Middlewares are executed in the order they are added.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Use middleware (builder pattern)
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add_middleware(middleware);
        self
    }

    /// Set error handler from an `Arc` for cases where the caller already shares ownership.
    pub fn set_error_handler_arc(&mut self, handler: Arc<dyn Fn(Vec<GraphQLError>) + Send + Sync>) {
        self.error_handler = Some(handler);
    }

    /// Set error handler
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(Vec<GraphQLError>) + Send + Sync + 'static,
    {
        self.set_error_handler_arc(Arc::new(handler));
    }

    /// Answer cross-origin requests with the given policy.
    pub fn set_cors(&mut self, cors: CorsLayer) {
        self.cors = Some(cors);
    }

    async fn run_middlewares(&self, ctx: &mut RequestContext) -> Result<()> {
        for middleware in &self.middlewares {
            middleware.call(ctx).await?;
        }
        Ok(())
    }

    /// Execute one request with an existing context
    ///
    /// 1. Runs all middlewares
    /// 2. Executes the operation against the federated schema
    /// 3. Hands any errors to the error handler
    pub async fn execute(&self, request: GraphQLRequest, mut ctx: RequestContext) -> GraphQLResponse {
        let response = match self.run_middlewares(&mut ctx).await {
            Ok(()) => execution::execute(&self.env, &request, ctx).await,
            Err(err) => {
                tracing::debug!(error = %err, "request rejected by middleware");
                GraphQLResponse::from(err)
            }
        };

        if !response.errors.is_empty() {
            if let Some(handler) = &self.error_handler {
                handler(response.errors.clone());
            }
        }
        response
    }

    /// Handle an HTTP request, building the context from its headers.
    pub async fn handle_http(&self, headers: HeaderMap, request: GraphQLRequest) -> GraphQLResponse {
        self.execute(request, RequestContext::from_headers(headers)).await
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.env
    }

    /// Convert to Axum router
    pub fn into_router(self) -> Router {
        let cors = self.cors.clone();
        let state = Arc::new(self);

        let router = Router::new()
            .route("/graphql", post(handle_graphql_post).get(graphql_playground))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        match cors {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }
}

/// Handler for POST requests to /graphql
async fn handle_graphql_post(
    State(mux): State<Arc<ServeMux>>,
    headers: HeaderMap,
    Json(request): Json<GraphQLRequest>,
) -> impl IntoResponse {
    Json(mux.handle_http(headers, request).await)
}

/// Serve the GraphQL Playground UI for ad-hoc exploration.
async fn graphql_playground() -> impl IntoResponse {
    Html(async_graphql::http::playground_source(
        async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
    ))
}

impl From<Error> for GraphQLResponse {
    fn from(err: Error) -> Self {
        GraphQLResponse::error(err.to_graphql_error())
    }
}
