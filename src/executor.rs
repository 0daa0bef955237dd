//! Downstream query executors
//!
//! The gateway never talks to a service directly: every composite document
//! goes through the [`QueryExecutor`] registered for the service. The HTTP
//! implementation is [`HttpQueryExecutor`]; tests and embedded services
//! implement the trait themselves.

use crate::error::{Error, Result};
use crate::graph::ServiceId;
use crate::middleware::RequestContext;
use crate::types::{GraphQLResponse, ServiceConfig, SubgraphRequest};
use http::HeaderName;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sends one GraphQL document to one service.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, request: SubgraphRequest, ctx: &RequestContext) -> Result<GraphQLResponse>;
}

/// Executor posting `application/json` GraphQL requests over HTTP.
///
/// # Example
///
/// ```rust,no_run
/// use graphql_federation_gateway::executor::HttpQueryExecutor;
/// use std::time::Duration;
///
/// # fn example() -> graphql_federation_gateway::Result<()> {
/// let executor = HttpQueryExecutor::builder("http://localhost:4001/graphql")
///     .timeout(Duration::from_secs(5))
///     .forward_header("authorization")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpQueryExecutor {
    endpoint: String,
    client: reqwest::Client,
    forward_headers: Vec<HeaderName>,
}

impl HttpQueryExecutor {
    /// Start building an executor with custom settings.
    pub fn builder(endpoint: impl Into<String>) -> HttpQueryExecutorBuilder {
        HttpQueryExecutorBuilder::new(endpoint)
    }

    /// Create an executor with default settings
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::builder(endpoint).build()
    }

    /// Create an executor from a service configuration entry
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let mut builder = Self::builder(config.endpoint.clone());
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        for header in &config.forward_headers {
            builder = builder.forward_header(header.clone());
        }
        builder.build()
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for HttpQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueryExecutor")
            .field("endpoint", &self.endpoint)
            .field("forward_headers", &self.forward_headers)
            .finish()
    }
}

#[async_trait::async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, request: SubgraphRequest, ctx: &RequestContext) -> Result<GraphQLResponse> {
        let mut call = self.client.post(&self.endpoint).json(&request);
        for name in &self.forward_headers {
            if let Some(value) = ctx.headers.get(name) {
                call = call.header(name.clone(), value.clone());
            }
        }

        let response = call.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Internal(format!(
                "{} answered with HTTP status {status}",
                self.endpoint
            )));
        }
        Ok(response.json::<GraphQLResponse>().await?)
    }
}

/// Builder for configuring [`HttpQueryExecutor`] creation.
pub struct HttpQueryExecutorBuilder {
    endpoint: String,
    timeout: Option<Duration>,
    forward_headers: Vec<String>,
}

impl HttpQueryExecutorBuilder {
    fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: None,
            forward_headers: Vec::new(),
        }
    }

    /// Per-call timeout enforced by the HTTP client.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy this header from the inbound request onto every call.
    pub fn forward_header(mut self, name: impl Into<String>) -> Self {
        self.forward_headers.push(name.into());
        self
    }

    pub fn build(self) -> Result<HttpQueryExecutor> {
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            client = client.timeout(timeout);
        }
        let forward_headers = self
            .forward_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::Internal(format!("invalid header name `{name}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(HttpQueryExecutor {
            endpoint: self.endpoint,
            client: client.build()?,
            forward_headers,
        })
    }
}

/// Executors of every registered service, keyed by service id.
///
/// Built once while the gateway is assembled and read-only afterwards.
#[derive(Clone, Default)]
pub struct QueryExecutorPool {
    executors: HashMap<ServiceId, Arc<dyn QueryExecutor>>,
}

impl QueryExecutorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an executor to the pool
    pub fn add(&mut self, service: impl Into<ServiceId>, executor: Arc<dyn QueryExecutor>) {
        self.executors.insert(service.into(), executor);
    }

    /// Get the executor of a service
    pub fn get(&self, service: &ServiceId) -> Option<Arc<dyn QueryExecutor>> {
        self.executors.get(service).cloned()
    }

    pub fn contains(&self, service: &ServiceId) -> bool {
        self.executors.contains_key(service)
    }

    /// Get all service names
    pub fn names(&self) -> Vec<&ServiceId> {
        self.executors.keys().collect()
    }
}

impl std::fmt::Debug for QueryExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutorPool")
            .field("services", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
