use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use ethload_core::{Endpoints, MetricsAggregator, RunContext};

pub const TX_HASH: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";
pub const FUNDER_KEY: &str = "0x0202020202020202020202020202020202020202020202020202020202020202";

/// A JSON-RPC node answering from a fixed method table. Unknown methods get
/// a -32601 error. Batches are answered element by element.
#[derive(Clone, Default)]
pub struct FakeNode {
    results: HashMap<String, Value>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, method: &str, result: Value) -> Self {
        self.results.insert(method.to_string(), result);
        self
    }

    /// Answers everything a transaction-sending run needs.
    pub fn dev_chain() -> Self {
        Self::new()
            .with("eth_chainId", json!("0x7a69"))
            .with("eth_gasPrice", json!("0x3b9aca00"))
            .with("eth_blockNumber", json!("0x10"))
            .with("eth_getTransactionCount", json!("0x0"))
            .with("eth_getBalance", json!("0xde0b6b3a7640000"))
            .with("eth_sendRawTransaction", json!(TX_HASH))
    }

    fn reply(&self, request: &Value) -> Value {
        let method = request["method"].as_str().unwrap_or_default();
        match self.results.get(method) {
            Some(result) => json!({"jsonrpc": "2.0", "id": request["id"], "result": result}),
            None => json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32601, "message": format!("method {method} not found")}
            }),
        }
    }

    pub async fn mount(self, server: &MockServer) {
        Mock::given(method("POST"))
            .respond_with(self)
            .mount(server)
            .await;
    }
}

impl Respond for FakeNode {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let reply = match &body {
            Value::Array(items) => Value::Array(items.iter().map(|i| self.reply(i)).collect()),
            single => self.reply(single),
        };
        ResponseTemplate::new(200).set_body_json(reply)
    }
}

pub fn context(url: &str) -> RunContext {
    RunContext::new(
        "it-run",
        "it",
        Endpoints {
            http: vec![url.to_string()],
            ws: vec![],
        },
        Arc::new(MetricsAggregator::new()),
    )
}

/// Every JSON-RPC request the server saw, batches flattened.
pub async fn received_calls(server: &MockServer) -> Vec<Value> {
    let requests = server.received_requests().await.unwrap_or_default();
    let mut calls = Vec::new();
    for request in requests {
        match serde_json::from_slice::<Value>(&request.body) {
            Ok(Value::Array(items)) => calls.extend(items),
            Ok(single) => calls.push(single),
            Err(_) => continue,
        }
    }
    calls
}

/// Methods of every JSON-RPC request the server saw, batches flattened.
pub async fn received_methods(server: &MockServer) -> Vec<String> {
    received_calls(server)
        .await
        .iter()
        .filter_map(|c| c["method"].as_str().map(str::to_string))
        .collect()
}
