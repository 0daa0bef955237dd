//! Federated schema building from subgraph SDL.
//!
//! [`SchemaBuilder`] collects the subgraphs in registration order, ingests
//! their SDL, runs the federation directive processors and the merge engine,
//! and freezes the result into a [`FederatedSchema`]. Every stitch-time
//! violation across all subgraphs is reported in one
//! [`Error::Stitch`](crate::Error::Stitch).

use crate::error::{Error, Result};
use crate::graph::{FieldCoordinate, SchemaGraph, ServiceId};
use crate::merge::{GraphMerger, UnifiedGraph};
use crate::registry::ArgumentSource;
use std::path::Path;
use std::sync::Arc;

/// Stitched schema shared by every request.
#[derive(Clone, Debug)]
pub struct FederatedSchema {
    inner: Arc<UnifiedGraph>,
}

impl FederatedSchema {
    /// Access the unified graph
    pub fn graph(&self) -> &UnifiedGraph {
        &self.inner
    }

    /// Shared handle to the unified graph, used by the request executor.
    pub fn shared(&self) -> Arc<UnifiedGraph> {
        self.inner.clone()
    }

    pub fn services(&self) -> &[ServiceId] {
        self.inner.services()
    }
}

enum Subgraph {
    Sdl { service: ServiceId, sdl: String },
    Graph(SchemaGraph),
}

/// Schema builder for the federation gateway
#[derive(Default)]
pub struct SchemaBuilder {
    subgraphs: Vec<Subgraph>,
    merger: GraphMerger,
}

impl SchemaBuilder {
    /// Create a new schema builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subgraph by its SDL. Registration order is merge order.
    pub fn with_subgraph_sdl(mut self, service: impl Into<ServiceId>, sdl: impl Into<String>) -> Self {
        self.subgraphs.push(Subgraph::Sdl {
            service: service.into(),
            sdl: sdl.into(),
        });
        self
    }

    /// Register a subgraph from an SDL file
    pub fn with_subgraph_file(self, service: impl Into<ServiceId>, path: impl AsRef<Path>) -> Result<Self> {
        let sdl = std::fs::read_to_string(path).map_err(Error::Io)?;
        Ok(self.with_subgraph_sdl(service, sdl))
    }

    /// Register an already built schema graph.
    pub fn with_subgraph(mut self, graph: SchemaGraph) -> Self {
        self.subgraphs.push(Subgraph::Graph(graph));
        self
    }

    /// Resolve arguments of `coordinate` through other services before the
    /// field is fetched.
    pub fn with_resolver_argument(mut self, coordinate: FieldCoordinate, sources: Vec<ArgumentSource>) -> Self {
        self.merger = self.merger.with_resolver_argument(coordinate, sources);
        self
    }

    /// Services registered so far, in order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceId> {
        self.subgraphs.iter().map(|subgraph| match subgraph {
            Subgraph::Sdl { service, .. } => service,
            Subgraph::Graph(graph) => graph.service(),
        })
    }

    /// Build the federated schema.
    pub fn build(self) -> Result<FederatedSchema> {
        if self.subgraphs.is_empty() {
            return Err(Error::Schema("at least one subgraph is required".into()));
        }

        let graphs = self
            .subgraphs
            .into_iter()
            .map(|subgraph| match subgraph {
                Subgraph::Sdl { service, sdl } => SchemaGraph::from_sdl(service, &sdl),
                Subgraph::Graph(graph) => Ok(graph),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut seen = std::collections::HashSet::new();
        for graph in &graphs {
            if !seen.insert(graph.service()) {
                return Err(Error::Schema(format!(
                    "service `{}` is registered more than once",
                    graph.service()
                )));
            }
        }

        let unified = self.merger.merge(&graphs)?;
        Ok(FederatedSchema {
            inner: Arc::new(unified),
        })
    }
}
