use std::time::Duration;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::CallError;
use crate::metrics::{names, tags, TagSet};

/// Maximum length of the reason text carried by a failure log record.
pub const MAX_REASON_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    WebSocket,
    Local,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::WebSocket => "websocket",
            Transport::Local => "local",
        }
    }
}

/// Identity of one logical call for metrics and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLabels {
    pub scenario: String,
    pub method: String,
    pub endpoint: String,
    pub transport: Transport,
}

impl CallLabels {
    pub fn new(
        scenario: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            method: method.into(),
            endpoint: endpoint.into(),
            transport,
        }
    }
}

/// Turns call outcomes into metric record sets and structured log records.
///
/// A logical call produces exactly one record set when it finishes, however
/// many attempts it took; retries are counted separately.
#[derive(Debug, Clone)]
pub struct CallRecorder {
    ctx: RunContext,
}

impl CallRecorder {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn tags(&self, labels: &CallLabels) -> TagSet {
        self.ctx
            .base_tags()
            .with(tags::SCENARIO, labels.scenario.as_str())
            .with(tags::METHOD, labels.method.as_str())
            .with(tags::ENDPOINT, labels.endpoint.as_str())
            .with(tags::TRANSPORT, labels.transport.as_str())
    }

    pub fn success(&self, labels: &CallLabels, latency: Duration) {
        let metrics = self.ctx.metrics();
        let tags = self.tags(labels);
        metrics.add(&names::RPC_REQUESTS, 1.0, &tags);
        metrics.add(&names::RPC_LATENCY_MS, millis(latency), &tags);
        metrics.add(&names::RPC_SUCCESS, 1.0, &tags);
    }

    pub fn failure(&self, labels: &CallLabels, err: &CallError, latency: Duration) {
        let metrics = self.ctx.metrics();
        let tags = self.tags(labels);
        metrics.add(&names::RPC_REQUESTS, 1.0, &tags);
        metrics.add(&names::RPC_LATENCY_MS, millis(latency), &tags);

        let error_tags = tags
            .clone()
            .with(tags::STAGE, err.stage())
            .with(tags::REASON, err.kind().as_str());
        metrics.add(&names::RPC_ERRORS, 1.0, &error_tags);
        if err.is_timeout() {
            metrics.add(&names::RPC_TIMEOUTS, 1.0, &tags);
        }

        warn!(
            run_id = self.ctx.run_id(),
            scenario = labels.scenario.as_str(),
            method = labels.method.as_str(),
            endpoint = labels.endpoint.as_str(),
            transport = labels.transport.as_str(),
            stage = err.stage(),
            reason = truncate(&err.to_string(), MAX_REASON_LEN).as_str(),
            "call failed"
        );
    }

    /// Records that attempt number `attempt` (1-based) is about to be retried.
    pub fn retry(&self, labels: &CallLabels, attempt: u32, err: &CallError) {
        let tags = self
            .tags(labels)
            .with(tags::RETRY_ATTEMPT, attempt.to_string());
        self.ctx.metrics().add(&names::RPC_RETRIES, 1.0, &tags);

        debug!(
            scenario = labels.scenario.as_str(),
            method = labels.method.as_str(),
            endpoint = labels.endpoint.as_str(),
            attempt,
            reason = truncate(&err.to_string(), MAX_REASON_LEN).as_str(),
            "retrying call"
        );
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Truncates to at most `max` bytes on a char boundary.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
