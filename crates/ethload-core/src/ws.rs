//! WebSocket subscription manager.
//!
//! A subscription lives on its own socket and walks
//! `Connecting -> Open -> Subscribed -> Closed | Failed`. The first pushed
//! event completes it. A subscription that sees no event before its idle
//! deadline is closed locally and recorded as a timeout; it is not retried.
//! Transport failures reconnect with the same parameters until the retry
//! budget is spent.

use dashmap::DashMap;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::classify::TimeoutSignal;
use crate::context::RunContext;
use crate::error::CallError;
use crate::metrics::{names, tags, MetricsAggregator, TagSet};
use crate::recorder::{CallLabels, CallRecorder, Transport};
use crate::rpc::JSONRPC_VERSION;
use crate::transport::{connect_ws, WsStream};

pub const SUBSCRIBE_METHOD: &str = "eth_subscribe";
pub const NOTIFICATION_METHOD: &str = "eth_subscription";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsSettings {
    /// How long a subscription waits for its first event.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Connecting,
    Open,
    Subscribed,
    Closed,
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Open => "open",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Closed => "closed",
            SubscriptionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A subscription currently held by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    /// Subscription kind, e.g. `newHeads`.
    pub kind: String,
    pub state: SubscriptionState,
}

/// Keeps `ws_active_connections` in step with open sockets. The gauge goes
/// down when the guard drops, whichever path ends the connection.
struct ConnectionGuard {
    metrics: Arc<MetricsAggregator>,
    tags: TagSet,
}

impl ConnectionGuard {
    fn open(metrics: Arc<MetricsAggregator>, tags: TagSet) -> Self {
        metrics.add(&names::WS_ACTIVE_CONNECTIONS, 1.0, &tags);
        Self { metrics, tags }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .add(&names::WS_ACTIVE_CONNECTIONS, -1.0, &self.tags);
    }
}

/// Removes a subscription from the live table when an attempt ends.
struct Tracked<'a> {
    live: &'a DashMap<u64, Subscription>,
    id: u64,
}

impl Tracked<'_> {
    fn set(&self, state: SubscriptionState) {
        if let Some(mut sub) = self.live.get_mut(&self.id) {
            debug!(id = self.id, from = %sub.state, to = %state, "subscription state");
            sub.state = state;
        }
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.live.remove(&self.id);
    }
}

/// How a single attempt ended without an event.
enum Ending {
    /// Transport-level failure; eligible for reconnect.
    Failed(CallError),
    /// Terminal for the whole subscription.
    Terminal(CallError),
}

pub struct SubscriptionManager {
    settings: WsSettings,
    recorder: CallRecorder,
    next_id: AtomicU64,
    live: DashMap<u64, Subscription>,
}

impl SubscriptionManager {
    pub fn new(settings: WsSettings, ctx: RunContext) -> Self {
        Self {
            settings,
            recorder: CallRecorder::new(ctx),
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &WsSettings {
        &self.settings
    }

    /// Subscriptions that currently hold a socket.
    pub fn live(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self.live.iter().map(|e| e.value().clone()).collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    /// Subscribes with `eth_subscribe(params)` and waits for the first
    /// event, returning its `result` payload.
    pub async fn subscribe(
        &self,
        ws_url: &str,
        params: Value,
        scenario: &str,
    ) -> Result<Value, CallError> {
        let labels = CallLabels::new(scenario, SUBSCRIBE_METHOD, ws_url, Transport::WebSocket);
        let mut retries = 0u32;

        loop {
            let started = Instant::now();
            let outcome = self.attempt(ws_url, &params).await;
            let latency = started.elapsed();

            match outcome {
                Ok(event) => {
                    self.recorder.success(&labels, latency);
                    return Ok(event);
                }
                Err(Ending::Failed(err)) if retries < self.settings.max_retries => {
                    retries += 1;
                    self.recorder.retry(&labels, retries, &err);
                    sleep(self.settings.retry_delay).await;
                }
                Err(Ending::Failed(err)) | Err(Ending::Terminal(err)) => {
                    self.recorder.failure(&labels, &err, latency);
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, ws_url: &str, params: &Value) -> Result<Value, Ending> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = params
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.live.insert(
            id,
            Subscription {
                id,
                kind,
                state: SubscriptionState::Connecting,
            },
        );
        let tracked = Tracked {
            live: &self.live,
            id,
        };

        let started = Instant::now();
        let mut stream = match connect_ws(ws_url, self.settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(failure) => {
                tracked.set(SubscriptionState::Failed);
                let err = if failure.timed_out {
                    CallError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        signal: TimeoutSignal::TransportDeadline,
                    }
                } else {
                    CallError::Network(failure.message)
                };
                return Err(Ending::Failed(err));
            }
        };

        let ctx = self.recorder.context();
        let _connection = ConnectionGuard::open(
            ctx.metrics().clone(),
            ctx.base_tags().with(tags::ENDPOINT, ws_url),
        );
        tracked.set(SubscriptionState::Open);

        let outcome = self.exchange(&mut stream, id, params, &tracked).await;
        close_within(&mut stream, self.settings.connect_timeout).await;

        match &outcome {
            Ok(_) | Err(Ending::Terminal(CallError::Timeout { .. })) => {
                tracked.set(SubscriptionState::Closed)
            }
            Err(_) => tracked.set(SubscriptionState::Failed),
        }
        outcome
    }

    async fn exchange(
        &self,
        stream: &mut WsStream,
        request_id: u64,
        params: &Value,
        tracked: &Tracked<'_>,
    ) -> Result<Value, Ending> {
        let started = Instant::now();
        let deadline = started + self.settings.idle_timeout;

        let request = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": request_id,
            "method": SUBSCRIBE_METHOD,
            "params": params,
        });
        stream
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| Ending::Failed(CallError::Network(e.to_string())))?;

        let mut subscription: Option<String> = None;
        loop {
            let message = match timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    return Err(Ending::Terminal(CallError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        signal: TimeoutSignal::IdleDeadline,
                    }))
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    return Err(Ending::Failed(CallError::Network(
                        "connection closed before first event".into(),
                    )))
                }
                Ok(Some(Err(e))) => return Err(Ending::Failed(CallError::Network(e.to_string()))),
                Ok(Some(Ok(Message::Text(text)))) => text,
                Ok(Some(Ok(_))) => continue,
            };

            let Ok(value) = serde_json::from_str::<Value>(&message) else {
                return Err(Ending::Terminal(CallError::MalformedResponse(
                    "subscription frame is not json".into(),
                )));
            };

            match &subscription {
                None => {
                    if value.get("id").and_then(Value::as_u64) != Some(request_id) {
                        continue;
                    }
                    subscription = Some(subscription_id(&value).map_err(Ending::Terminal)?);
                    tracked.set(SubscriptionState::Subscribed);
                }
                Some(sub_id) => {
                    if let Some(event) = notification_for(&value, sub_id) {
                        return Ok(event);
                    }
                }
            }
        }
    }
}

/// Sends a close frame, giving up after `limit` if the peer stalls. The
/// socket is dropped either way.
async fn close_within<S>(sink: &mut S, limit: Duration)
where
    S: Sink<Message> + Unpin,
{
    if timeout(limit, sink.close()).await.is_err() {
        debug!(limit_ms = limit.as_millis() as u64, "websocket close timed out");
    }
}

/// Extracts the subscription id from the subscribe response.
fn subscription_id(response: &Value) -> Result<String, CallError> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(CallError::Subscription(format!("rejected ({code}): {message}")));
    }
    response
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CallError::Subscription("response carries no subscription id".into()))
}

fn notification_for(message: &Value, subscription: &str) -> Option<Value> {
    if message.get("method").and_then(Value::as_str) != Some(NOTIFICATION_METHOD) {
        return None;
    }
    let params = message.get("params")?;
    if params.get("subscription").and_then(Value::as_str) != Some(subscription) {
        return None;
    }
    Some(params.get("result").cloned().unwrap_or(Value::Null))
}
