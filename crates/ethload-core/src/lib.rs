pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod nonce;
pub mod ramp;
pub mod rate_limiter;
pub mod recorder;
pub mod rpc;
pub mod run;
pub mod scenario;
pub mod signer;
pub mod transport;
pub mod wallet;
pub mod ws;

pub use classify::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use executor::*;
pub use metrics::{
    names, tags, Metric, MetricKind, MetricsAggregator, MetricsSnapshot, SeriesSnapshot,
    SeriesValue, TagSet, TrendSummary,
};
pub use nonce::*;
pub use ramp::*;
pub use rate_limiter::*;
pub use recorder::*;
pub use rpc::*;
pub use run::*;
pub use scenario::*;
pub use signer::*;
pub use transport::*;
pub use wallet::*;
pub use ws::*;
