use thiserror::Error;

use crate::classify::TimeoutSignal;

/// Failure of a single driver operation (RPC call, subscription, nonce lease,
/// signing). Every variant is recorded in metrics; none of them aborts a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {elapsed_ms}ms ({signal})")]
    Timeout {
        elapsed_ms: u64,
        signal: TimeoutSignal,
    },

    #[error("http error: status {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("rpc error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("result validation failed: {0}")]
    Validation(String),

    #[error("nonce fetch failed for {address}: {reason}")]
    NonceFetch { address: String, reason: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("subscription error: {0}")]
    Subscription(String),
}

/// Coarse error category used as the `reason` metric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Http,
    MalformedResponse,
    Protocol,
    Validation,
    NonceFetch,
    Signing,
    Subscription,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Http => "http",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::NonceFetch => "nonce_fetch",
            ErrorKind::Signing => "signing",
            ErrorKind::Subscription => "subscription",
        }
    }
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Network(_) => ErrorKind::Network,
            CallError::Timeout { .. } => ErrorKind::Timeout,
            CallError::Http { .. } => ErrorKind::Http,
            CallError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            CallError::Protocol { .. } => ErrorKind::Protocol,
            CallError::Validation(_) => ErrorKind::Validation,
            CallError::NonceFetch { .. } => ErrorKind::NonceFetch,
            CallError::Signing(_) => ErrorKind::Signing,
            CallError::Subscription(_) => ErrorKind::Subscription,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Network(_) | CallError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// Pipeline stage that produced the error, used as the `stage` tag.
    pub fn stage(&self) -> &'static str {
        match self {
            CallError::Network(_) => "transport",
            CallError::Timeout { .. } => "timeout",
            CallError::Http { .. } => "http",
            CallError::MalformedResponse(_) => "envelope",
            CallError::Protocol { .. } => "rpc",
            CallError::Validation(_) => "validation",
            CallError::NonceFetch { .. } => "nonce",
            CallError::Signing(_) => "sign",
            CallError::Subscription(_) => "subscribe",
        }
    }
}

/// Configuration problems detected before any worker starts. These are the
/// only fatal errors of a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid endpoint {url}: {reason}")]
    Endpoint { url: String, reason: String },

    #[error("scenario {scenario} requires {field}")]
    MissingField {
        scenario: &'static str,
        field: &'static str,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_failures_retry() {
        assert!(CallError::Network("reset".into()).is_retryable());
        assert!(CallError::Timeout {
            elapsed_ms: 10,
            signal: TimeoutSignal::ElapsedNearDeadline
        }
        .is_retryable());

        let terminal = [
            CallError::Http {
                status: 500,
                detail: String::new(),
            },
            CallError::MalformedResponse("x".into()),
            CallError::Protocol {
                code: -32000,
                message: "x".into(),
            },
            CallError::Validation("x".into()),
            CallError::Signing("x".into()),
        ];
        for err in terminal {
            assert!(!err.is_retryable(), "{err} must not retry");
        }
    }

    #[test]
    fn test_stage_and_reason_tags() {
        let err = CallError::Protocol {
            code: -32601,
            message: "method not found".into(),
        };
        assert_eq!(err.stage(), "rpc");
        assert_eq!(err.kind().as_str(), "protocol");
    }
}
