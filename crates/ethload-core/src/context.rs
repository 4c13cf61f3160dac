use std::sync::Arc;

use crate::metrics::{tags, MetricsAggregator, TagSet};

/// Resolved endpoints for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub http: Vec<String>,
    pub ws: Vec<String>,
}

impl Endpoints {
    /// Endpoint assigned to a worker. Assignment is a pure function of the
    /// worker index so a worker keeps its endpoint for the whole run.
    pub fn http_for(&self, worker: usize) -> Option<&str> {
        round_robin(&self.http, worker).map(String::as_str)
    }

    pub fn ws_for(&self, worker: usize) -> Option<&str> {
        round_robin(&self.ws, worker).map(String::as_str)
    }
}

pub(crate) fn round_robin<T>(items: &[T], index: usize) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    items.get(index % items.len())
}

/// Run-scoped state shared by every component: run identity, endpoints and
/// the metrics sink. Built once at setup and read-only afterwards; cloning
/// only bumps reference counts.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Arc<str>,
    scenario: Arc<str>,
    endpoints: Arc<Endpoints>,
    metrics: Arc<MetricsAggregator>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        scenario: impl Into<String>,
        endpoints: Endpoints,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            run_id: Arc::from(run_id.into()),
            scenario: Arc::from(scenario.into()),
            endpoints: Arc::new(endpoints),
            metrics,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Base tags carried by every sample of this run.
    pub fn base_tags(&self) -> TagSet {
        TagSet::new().with(tags::RUN_ID, self.run_id.as_ref())
    }
}
