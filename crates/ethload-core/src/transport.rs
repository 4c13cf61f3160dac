use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw HTTP response as seen by the RPC client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
    }
}

/// The transport gave up before producing a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Set when the HTTP stack hit its own deadline.
    pub timed_out: bool,
    pub message: String,
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<HttpResponse, TransportFailure>> + Send + 'a>>;

/// HTTP primitives the RPC client is built on.
pub trait HttpTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn post_json<'a>(&'a self, url: &'a str, body: String, timeout: Duration)
        -> TransportFuture<'a>;

    fn get<'a>(&'a self, url: &'a str, timeout: Duration) -> TransportFuture<'a>;
}

/// Pooled reqwest client shared by every worker.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    async fn finish(
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<HttpResponse, TransportFailure> {
        let response = request.send().await.map_err(failure)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(failure)?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

fn failure(e: reqwest::Error) -> TransportFailure {
    TransportFailure {
        timed_out: e.is_timeout(),
        message: e.to_string(),
    }
}

impl HttpTransport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "reqwest"
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: String,
        timeout: Duration,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let request = self
                .client
                .post(url)
                .timeout(timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
            Self::finish(request).await
        })
    }

    fn get<'a>(&'a self, url: &'a str, timeout: Duration) -> TransportFuture<'a> {
        Box::pin(async move { Self::finish(self.client.get(url).timeout(timeout)).await })
    }
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens a WebSocket, failing if the handshake does not finish in `timeout`.
pub async fn connect_ws(
    url: &str,
    timeout: Duration,
) -> std::result::Result<WsStream, TransportFailure> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TransportFailure {
            timed_out: false,
            message: e.to_string(),
        }),
        Err(_) => Err(TransportFailure {
            timed_out: true,
            message: format!("websocket handshake exceeded {}ms", timeout.as_millis()),
        }),
    }
}
