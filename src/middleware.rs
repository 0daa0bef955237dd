//! Middleware support for the gateway

use crate::error::{Error, Result};
use axum::http::{HeaderMap, Request};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-request data handed to middleware and to every downstream executor
/// called while the request runs.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Headers of the incoming HTTP request
    pub headers: HeaderMap,

    /// Additional context data
    pub extensions: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Create a new context from request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::from_headers(req.headers().clone())
    }

    pub fn from_headers(headers: HeaderMap) -> Self {
        Self {
            headers,
            extensions: HashMap::new(),
        }
    }

    /// Insert extension data
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extensions.insert(key.into(), value);
    }

    /// Get extension data
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }
}

/// Middleware trait for processing requests
///
/// Middleware runs before the operation is executed and may reject it or
/// enrich the [`RequestContext`] forwarded to the services.
///
/// # Example
///
/// ```rust
/// use graphql_federation_gateway::middleware::{Middleware, RequestContext};
/// use graphql_federation_gateway::Result;
///
/// struct TenantMiddleware;
///
/// #[async_trait::async_trait]
/// impl Middleware for TenantMiddleware {
///     async fn call(&self, ctx: &mut RequestContext) -> Result<()> {
///         ctx.insert("tenant", serde_json::json!("acme"));
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request context
    async fn call(&self, ctx: &mut RequestContext) -> Result<()>;
}

/// Type alias for boxed middleware
pub type BoxMiddleware = Box<dyn Middleware>;

/// Authentication middleware
///
/// Validates the `Authorization` header using a provided validation function.
/// If validation fails, it returns an `Unauthorized` error.
#[derive(Clone)]
pub struct AuthMiddleware {
    pub validate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl AuthMiddleware {
    pub fn new(validate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            validate: Arc::new(validate),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn call(&self, ctx: &mut RequestContext) -> Result<()> {
        let authorized = ctx
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|token| (self.validate)(token));
        if authorized {
            Ok(())
        } else {
            Err(Error::Unauthorized("Invalid or missing authorization".to_string()))
        }
    }
}

/// Logging middleware
///
/// Logs incoming GraphQL requests using the `tracing` crate.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, ctx: &mut RequestContext) -> Result<()> {
        tracing::debug!(headers = ?ctx.headers, "processing GraphQL request");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auth_middleware_checks_the_header() {
        let auth = AuthMiddleware::new(|token| token == "Bearer secret");

        let mut ctx = RequestContext::default();
        assert!(matches!(auth.call(&mut ctx).await, Err(Error::Unauthorized(_))));

        ctx.headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(auth.call(&mut ctx).await.is_ok());
    }

    #[test]
    fn context_extensions() {
        let mut ctx = RequestContext::default();
        ctx.insert("tenant", serde_json::json!("acme"));
        assert_eq!(ctx.get("tenant"), Some(&serde_json::json!("acme")));
        assert!(ctx.get("missing").is_none());
    }
}
