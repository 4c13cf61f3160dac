//! Timeout classification.
//!
//! Under load a call can come back with a body and still be a timeout: a
//! gateway answering 504, a proxy dumping a "request timed out" page, or a
//! node replying just as the client deadline expires. Each of these signals
//! is checked independently and any one of them classifies the attempt as a
//! timeout.

use std::fmt;
use std::time::Duration;

/// Percentage of the configured timeout at which an attempt counts as timed
/// out regardless of what came back.
pub const ELAPSED_TIMEOUT_PERCENT: u128 = 95;

/// Percentage of the configured timeout at which an attempt that produced no
/// HTTP status counts as timed out.
pub const NO_STATUS_TIMEOUT_PERCENT: u128 = 80;

/// Only the head of the body is scanned for timeout vocabulary.
pub const BODY_SCAN_LIMIT: usize = 512;

const TIMEOUT_STATUS_CODES: [u16; 2] = [408, 504];

const TIMEOUT_VOCABULARY: [&str; 5] = [
    "timeout",
    "timed out",
    "time out",
    "deadline exceeded",
    "gateway time-out",
];

/// What is known about one attempt when it finished.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutEvidence<'a> {
    /// HTTP status, `0` when the transport produced no response.
    pub status: u16,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub body: Option<&'a str>,
}

/// The signal that classified an attempt as a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutSignal {
    /// The transport itself gave up at its deadline.
    TransportDeadline,
    TimeoutStatus(u16),
    NoStatusNearDeadline,
    ElapsedNearDeadline,
    TimeoutVocabulary,
    /// A subscription saw no event before its idle deadline.
    IdleDeadline,
}

impl fmt::Display for TimeoutSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutSignal::TransportDeadline => write!(f, "transport deadline"),
            TimeoutSignal::TimeoutStatus(code) => write!(f, "status {code}"),
            TimeoutSignal::NoStatusNearDeadline => write!(f, "no status near deadline"),
            TimeoutSignal::ElapsedNearDeadline => write!(f, "elapsed near deadline"),
            TimeoutSignal::TimeoutVocabulary => write!(f, "timeout text in body"),
            TimeoutSignal::IdleDeadline => write!(f, "no event before idle deadline"),
        }
    }
}

/// Returns the first timeout signal present in `evidence`, if any.
pub fn detect_timeout(evidence: &TimeoutEvidence<'_>) -> Option<TimeoutSignal> {
    if TIMEOUT_STATUS_CODES.contains(&evidence.status) {
        return Some(TimeoutSignal::TimeoutStatus(evidence.status));
    }

    if evidence.status == 0
        && reached_percent(evidence.elapsed, evidence.timeout, NO_STATUS_TIMEOUT_PERCENT)
    {
        return Some(TimeoutSignal::NoStatusNearDeadline);
    }

    if reached_percent(evidence.elapsed, evidence.timeout, ELAPSED_TIMEOUT_PERCENT) {
        return Some(TimeoutSignal::ElapsedNearDeadline);
    }

    if evidence.body.is_some_and(mentions_timeout) {
        return Some(TimeoutSignal::TimeoutVocabulary);
    }

    None
}

fn reached_percent(elapsed: Duration, timeout: Duration, percent: u128) -> bool {
    if timeout.is_zero() {
        return false;
    }
    elapsed.as_micros() * 100 >= timeout.as_micros() * percent
}

fn mentions_timeout(body: &str) -> bool {
    let mut end = body.len().min(BODY_SCAN_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_ascii_lowercase();
    TIMEOUT_VOCABULARY.iter().any(|word| head.contains(word))
}
