//! JSON-RPC client with bounded retry and timeout classification.
//!
//! One logical call runs as a loop of attempts. Each attempt builds a fresh
//! envelope, sends it, classifies transport failures and timeouts, checks the
//! HTTP layer, validates the envelope and finally the result shape. Network
//! failures and timeouts are retried after a fixed delay; everything else is
//! terminal. The call records one metric set when the loop ends.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::classify::{detect_timeout, TimeoutEvidence, TimeoutSignal};
use crate::context::RunContext;
use crate::error::CallError;
use crate::metrics::names;
use crate::recorder::{truncate, CallLabels, CallRecorder, Transport};
use crate::transport::{HttpResponse, HttpTransport, TransportFailure};

pub const JSONRPC_VERSION: &str = "2.0";

const HTTP_DETAIL_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSettings {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempts after the first one for retryable failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of a structurally valid response.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Result(Value),
    Error(RpcErrorObject),
}

/// Result-shape check applied after the envelope is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    Any,
    NonNull,
    /// `0x`-prefixed hex, any length.
    HexString,
    /// `0x`-prefixed hex quantity that fits in a u128.
    HexQuantity,
    /// 32-byte hash.
    TxHash,
    /// 20-byte address.
    Address,
    Array { min_len: usize },
    Object { fields: &'static [&'static str] },
    /// An object with the given fields, or null (pending receipts).
    OptionalObject { fields: &'static [&'static str] },
}

impl Expect {
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Expect::Any => Ok(()),
            Expect::NonNull => {
                if value.is_null() {
                    Err("result is null".into())
                } else {
                    Ok(())
                }
            }
            Expect::HexString => hex_str(value).map(|_| ()),
            Expect::HexQuantity => parse_quantity(value).map(|_| ()),
            Expect::TxHash => hex_of_len(value, 32),
            Expect::Address => hex_of_len(value, 20),
            Expect::Array { min_len } => match value.as_array() {
                Some(items) if items.len() >= *min_len => Ok(()),
                Some(items) => Err(format!(
                    "array has {} items, expected at least {min_len}",
                    items.len()
                )),
                None => Err("result is not an array".into()),
            },
            Expect::Object { fields } => has_fields(value, fields),
            Expect::OptionalObject { fields } => {
                if value.is_null() {
                    Ok(())
                } else {
                    has_fields(value, fields)
                }
            }
        }
    }
}

fn hex_str(value: &Value) -> Result<&str, String> {
    let s = value.as_str().ok_or("result is not a string")?;
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("{s:?} is not 0x-prefixed"))?;
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("{s:?} is not hex"));
    }
    Ok(digits)
}

fn hex_of_len(value: &Value, bytes: usize) -> Result<(), String> {
    let digits = hex_str(value)?;
    if digits.len() != bytes * 2 {
        return Err(format!(
            "expected {bytes} bytes of hex, got {} digits",
            digits.len()
        ));
    }
    Ok(())
}

fn has_fields(value: &Value, fields: &[&str]) -> Result<(), String> {
    let obj = value.as_object().ok_or("result is not an object")?;
    match fields.iter().find(|f| !obj.contains_key(**f)) {
        Some(missing) => Err(format!("result is missing field {missing:?}")),
        None => Ok(()),
    }
}

/// Decodes a hex quantity such as `"0x10"`.
pub fn parse_quantity(value: &Value) -> Result<u128, String> {
    let digits = hex_str(value)?;
    if digits.is_empty() {
        return Err("empty quantity".into());
    }
    u128::from_str_radix(digits, 16).map_err(|e| format!("bad quantity: {e}"))
}

pub fn to_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    pub scenario: String,
    pub expect: Expect,
    /// Treat a JSON-RPC `error` member as a valid reply instead of a failure.
    pub accept_protocol_errors: bool,
}

impl CallOptions {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            expect: Expect::Any,
            accept_protocol_errors: false,
        }
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    pub fn accept_protocol_errors(mut self) -> Self {
        self.accept_protocol_errors = true;
        self
    }
}

/// One element of a batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    pub method: String,
    pub params: Value,
}

impl BatchCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

fn envelope(id: u64, method: &str, params: &Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params})
}

/// Validates one response envelope and returns its echoed id and payload.
fn check_envelope(value: &Value) -> Result<(u64, RpcReply), CallError> {
    let malformed = |msg: &str| CallError::MalformedResponse(msg.to_string());

    let obj = value
        .as_object()
        .ok_or_else(|| malformed("response is not an object"))?;
    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(malformed("missing or wrong jsonrpc version"));
    }
    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing numeric id"))?;

    let error = obj.get("error").filter(|e| !e.is_null());
    let reply = match (obj.get("result"), error) {
        (Some(result), None) => RpcReply::Result(result.clone()),
        (None, Some(error)) => {
            let error: RpcErrorObject = serde_json::from_value(error.clone())
                .map_err(|e| CallError::MalformedResponse(format!("bad error object: {e}")))?;
            RpcReply::Error(error)
        }
        (Some(_), Some(_)) => return Err(malformed("both result and error present")),
        (None, None) => return Err(malformed("neither result nor error present")),
    };
    Ok((id, reply))
}

fn parse_body(body: &str) -> Result<Value, CallError> {
    serde_json::from_str(body).map_err(|e| CallError::MalformedResponse(format!("invalid json: {e}")))
}

fn classify_failure(failure: TransportFailure, elapsed: Duration, timeout: Duration) -> CallError {
    if failure.timed_out {
        return CallError::Timeout {
            elapsed_ms: elapsed.as_millis() as u64,
            signal: TimeoutSignal::TransportDeadline,
        };
    }
    let evidence = TimeoutEvidence {
        status: 0,
        elapsed,
        timeout,
        body: None,
    };
    match detect_timeout(&evidence) {
        Some(signal) => CallError::Timeout {
            elapsed_ms: elapsed.as_millis() as u64,
            signal,
        },
        None => CallError::Network(failure.message),
    }
}

fn check_http(response: &HttpResponse) -> Result<(), CallError> {
    if response.status != 200 {
        return Err(CallError::Http {
            status: response.status,
            detail: truncate(&response.body, HTTP_DETAIL_LEN),
        });
    }
    if !response.is_json() {
        return Err(CallError::Http {
            status: response.status,
            detail: format!(
                "unexpected content type {}",
                response.content_type.as_deref().unwrap_or("<none>")
            ),
        });
    }
    if response.body.trim().is_empty() {
        return Err(CallError::Http {
            status: response.status,
            detail: "empty body".into(),
        });
    }
    Ok(())
}

/// Result of a raw transaction submission.
#[derive(Debug)]
pub struct Submission {
    pub result: Result<String, CallError>,
    /// Attempts that reached the transport, retries included.
    pub attempts: u32,
}

/// Node messages meaning the nonce is already taken.
const NONCE_TAKEN: &[&str] = &[
    "already known",
    "known transaction",
    "nonce too low",
    "replacement transaction underpriced",
];

impl Submission {
    /// True when the node refused the only attempt for a reason other than
    /// the nonce being taken. The nonce never entered a pool in that case.
    pub fn refused_outright(&self) -> bool {
        match &self.result {
            Err(CallError::Protocol { message, .. }) if self.attempts == 1 => {
                let message = message.to_ascii_lowercase();
                !NONCE_TAKEN.iter().any(|m| message.contains(m))
            }
            _ => false,
        }
    }
}

pub struct RpcClient {
    transport: Arc<dyn HttpTransport>,
    settings: RpcSettings,
    recorder: CallRecorder,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn HttpTransport>, settings: RpcSettings, ctx: RunContext) -> Self {
        Self {
            transport,
            settings,
            recorder: CallRecorder::new(ctx),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }

    pub fn context(&self) -> &RunContext {
        self.recorder.context()
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Performs a call and returns its result. When protocol errors are
    /// accepted, the error payload comes back as `{"error": {...}}`.
    pub async fn call(
        &self,
        url: &str,
        method: &str,
        params: Value,
        opts: &CallOptions,
    ) -> Result<Value, CallError> {
        match self.request(url, method, params, opts).await? {
            RpcReply::Result(value) => Ok(value),
            RpcReply::Error(error) => Ok(json!({ "error": error })),
        }
    }

    pub async fn request(
        &self,
        url: &str,
        method: &str,
        params: Value,
        opts: &CallOptions,
    ) -> Result<RpcReply, CallError> {
        let labels = CallLabels::new(&opts.scenario, method, url, Transport::Http);
        let reply = self
            .with_retry(&labels, || self.attempt(url, method, &params, opts))
            .await?;
        self.track_chain_state(method, &reply);
        Ok(reply)
    }

    /// `eth_estimateGas`, where a revert is an answer rather than a failure.
    pub async fn estimate_gas(
        &self,
        url: &str,
        tx: Value,
        scenario: &str,
    ) -> Result<RpcReply, CallError> {
        let opts = CallOptions::new(scenario)
            .expect(Expect::HexQuantity)
            .accept_protocol_errors();
        self.request(url, "eth_estimateGas", json!([tx]), &opts).await
    }

    /// Sends a JSON-RPC batch. Replies come back in request order; element
    /// errors are returned per element.
    pub async fn call_batch(
        &self,
        url: &str,
        calls: &[BatchCall],
        opts: &CallOptions,
    ) -> Result<Vec<RpcReply>, CallError> {
        let labels = CallLabels::new(&opts.scenario, "batch", url, Transport::Http);
        let replies = self
            .with_retry(&labels, || self.attempt_batch(url, calls, opts))
            .await?;
        for (call, reply) in calls.iter().zip(&replies) {
            self.track_chain_state(&call.method, reply);
        }
        Ok(replies)
    }

    /// Raw connectivity check: any non-5xx answer within the timeout passes.
    pub async fn probe(&self, url: &str, opts: &CallOptions) -> Result<u16, CallError> {
        let labels = CallLabels::new(&opts.scenario, "connect", url, Transport::Http);
        self.with_retry(&labels, || async move {
            let timeout = self.settings.timeout;
            let started = Instant::now();
            let outcome = self.transport.get(url, timeout).await;
            let elapsed = started.elapsed();
            let response = outcome.map_err(|f| classify_failure(f, elapsed, timeout))?;

            let evidence = TimeoutEvidence {
                status: response.status,
                elapsed,
                timeout,
                body: None,
            };
            if let Some(signal) = detect_timeout(&evidence) {
                return Err(CallError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                    signal,
                });
            }
            if response.status >= 500 {
                return Err(CallError::Http {
                    status: response.status,
                    detail: truncate(&response.body, HTTP_DETAIL_LEN),
                });
            }
            Ok(response.status)
        })
        .await
    }

    pub async fn chain_id(&self, url: &str, scenario: &str) -> Result<u64, CallError> {
        let value = self.quantity(url, "eth_chainId", json!([]), scenario).await?;
        u64::try_from(value).map_err(|_| CallError::Validation("chain id overflows u64".into()))
    }

    pub async fn gas_price(&self, url: &str, scenario: &str) -> Result<u128, CallError> {
        self.quantity(url, "eth_gasPrice", json!([]), scenario).await
    }

    pub async fn balance(&self, url: &str, address: &str, scenario: &str) -> Result<u128, CallError> {
        self.quantity(url, "eth_getBalance", json!([address, "latest"]), scenario)
            .await
    }

    pub async fn pending_nonce(
        &self,
        url: &str,
        address: &str,
        scenario: &str,
    ) -> Result<u64, CallError> {
        let value = self
            .quantity(
                url,
                "eth_getTransactionCount",
                json!([address, "pending"]),
                scenario,
            )
            .await?;
        u64::try_from(value).map_err(|_| CallError::Validation("nonce overflows u64".into()))
    }

    pub async fn send_raw_transaction(
        &self,
        url: &str,
        raw_tx: &str,
        scenario: &str,
    ) -> Result<String, CallError> {
        self.submit_raw_transaction(url, raw_tx, scenario).await.result
    }

    /// `eth_sendRawTransaction`, also reporting how many attempts were made.
    /// A retried submission may have reached the node more than once.
    pub async fn submit_raw_transaction(
        &self,
        url: &str,
        raw_tx: &str,
        scenario: &str,
    ) -> Submission {
        let method = "eth_sendRawTransaction";
        let opts = CallOptions::new(scenario).expect(Expect::TxHash);
        let params = json!([raw_tx]);
        let labels = CallLabels::new(scenario, method, url, Transport::Http);
        let (outcome, attempts) = self
            .retry_counted(&labels, || self.attempt(url, method, &params, &opts))
            .await;
        let result = outcome.and_then(|reply| match reply {
            RpcReply::Result(value) => Ok(value.as_str().unwrap_or_default().to_string()),
            RpcReply::Error(error) => Err(CallError::Protocol {
                code: error.code,
                message: error.message,
            }),
        });
        Submission { result, attempts }
    }

    async fn quantity(
        &self,
        url: &str,
        method: &str,
        params: Value,
        scenario: &str,
    ) -> Result<u128, CallError> {
        let opts = CallOptions::new(scenario).expect(Expect::HexQuantity);
        let value = self.call(url, method, params, &opts).await?;
        parse_quantity(&value).map_err(CallError::Validation)
    }

    /// Runs attempts until one succeeds, a terminal error occurs or the retry
    /// budget is spent, then records exactly one outcome.
    async fn with_retry<T, F, Fut>(&self, labels: &CallLabels, attempt: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.retry_counted(labels, attempt).await.0
    }

    async fn retry_counted<T, F, Fut>(
        &self,
        labels: &CallLabels,
        mut attempt: F,
    ) -> (Result<T, CallError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut retries = 0u32;
        loop {
            let started = Instant::now();
            let outcome = attempt().await;
            let latency = started.elapsed();

            match outcome {
                Ok(value) => {
                    self.recorder.success(labels, latency);
                    return (Ok(value), retries + 1);
                }
                Err(err) if err.is_retryable() && retries < self.settings.max_retries => {
                    retries += 1;
                    self.recorder.retry(labels, retries, &err);
                    sleep(self.settings.retry_delay).await;
                }
                Err(err) => {
                    self.recorder.failure(labels, &err, latency);
                    return (Err(err), retries + 1);
                }
            }
        }
    }

    /// Sends one body and applies transport, timeout and HTTP checks.
    async fn send(&self, url: &str, body: String) -> Result<HttpResponse, CallError> {
        let timeout = self.settings.timeout;
        let started = Instant::now();
        let outcome = self.transport.post_json(url, body, timeout).await;
        let elapsed = started.elapsed();

        let response = outcome.map_err(|f| classify_failure(f, elapsed, timeout))?;

        let evidence = TimeoutEvidence {
            status: response.status,
            elapsed,
            timeout,
            body: Some(&response.body),
        };
        if let Some(signal) = detect_timeout(&evidence) {
            return Err(CallError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
                signal,
            });
        }

        check_http(&response)?;
        Ok(response)
    }

    async fn attempt(
        &self,
        url: &str,
        method: &str,
        params: &Value,
        opts: &CallOptions,
    ) -> Result<RpcReply, CallError> {
        let id = self.next_id();
        let response = self.send(url, envelope(id, method, params).to_string()).await?;

        let (echoed, reply) = check_envelope(&parse_body(&response.body)?)?;
        if echoed != id {
            return Err(CallError::MalformedResponse(format!(
                "id mismatch: sent {id}, got {echoed}"
            )));
        }

        match reply {
            RpcReply::Result(value) => {
                opts.expect.check(&value).map_err(CallError::Validation)?;
                Ok(RpcReply::Result(value))
            }
            RpcReply::Error(error) if opts.accept_protocol_errors => Ok(RpcReply::Error(error)),
            RpcReply::Error(error) => Err(CallError::Protocol {
                code: error.code,
                message: error.message,
            }),
        }
    }

    async fn attempt_batch(
        &self,
        url: &str,
        calls: &[BatchCall],
        opts: &CallOptions,
    ) -> Result<Vec<RpcReply>, CallError> {
        let ids: Vec<u64> = calls.iter().map(|_| self.next_id()).collect();
        let body: Vec<Value> = calls
            .iter()
            .zip(&ids)
            .map(|(call, id)| envelope(*id, &call.method, &call.params))
            .collect();
        let response = self.send(url, Value::Array(body).to_string()).await?;

        let parsed = parse_body(&response.body)?;
        let items = parsed
            .as_array()
            .ok_or_else(|| CallError::MalformedResponse("batch response is not an array".into()))?;
        if items.len() != ids.len() {
            return Err(CallError::MalformedResponse(format!(
                "batch of {} got {} replies",
                ids.len(),
                items.len()
            )));
        }

        let mut by_id = HashMap::with_capacity(items.len());
        for item in items {
            let (id, reply) = check_envelope(item)?;
            if !ids.contains(&id) {
                return Err(CallError::MalformedResponse(format!("unexpected id {id}")));
            }
            if by_id.insert(id, reply).is_some() {
                return Err(CallError::MalformedResponse(format!("duplicate id {id}")));
            }
        }

        ids.iter()
            .map(|id| {
                let reply = by_id
                    .remove(id)
                    .ok_or_else(|| CallError::MalformedResponse(format!("missing id {id}")))?;
                if let RpcReply::Result(value) = &reply {
                    opts.expect.check(value).map_err(CallError::Validation)?;
                }
                Ok(reply)
            })
            .collect()
    }

    /// Block height and gas price gauges follow every observed result of
    /// their methods, whichever scenario made the call.
    fn track_chain_state(&self, method: &str, reply: &RpcReply) {
        let RpcReply::Result(value) = reply else {
            return;
        };
        let gauge = match method {
            "eth_blockNumber" => names::BLOCK_HEIGHT,
            "eth_gasPrice" => names::GAS_PRICE_WEI,
            _ => return,
        };
        if let Ok(quantity) = parse_quantity(value) {
            let ctx = self.context();
            ctx.metrics().set(&gauge, quantity as f64, &ctx.base_tags());
        }
    }
}
