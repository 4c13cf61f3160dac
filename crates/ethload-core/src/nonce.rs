//! Per-address nonce bookkeeping.
//!
//! The pending nonce of an address is fetched from the network at most once;
//! every lease after that is handed out from a local counter. Each address
//! has its own async mutex, so callers allocating for the same address are
//! serialized while different addresses never wait on each other.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::rpc::RpcClient;

pub type NonceFuture<'a> = Pin<Box<dyn Future<Output = Result<u64, CallError>> + Send + 'a>>;

/// Where baseline nonces come from.
pub trait NonceSource: Send + Sync {
    fn pending_nonce<'a>(&'a self, address: &'a str) -> NonceFuture<'a>;
}

/// Baseline from `eth_getTransactionCount(address, "pending")`.
pub struct RpcNonceSource {
    rpc: Arc<RpcClient>,
    url: String,
}

impl RpcNonceSource {
    pub fn new(rpc: Arc<RpcClient>, url: impl Into<String>) -> Self {
        Self {
            rpc,
            url: url.into(),
        }
    }
}

impl NonceSource for RpcNonceSource {
    fn pending_nonce<'a>(&'a self, address: &'a str) -> NonceFuture<'a> {
        Box::pin(async move { self.rpc.pending_nonce(&self.url, address, "nonce").await })
    }
}

/// A single-use nonce. Use it in exactly one transaction or hand it back
/// with [`NonceCoordinator::release_unused`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct NonceLease {
    address: String,
    value: u64,
}

impl NonceLease {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

/// A contiguous block of nonces for one address, used by batch funding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct NonceRange {
    pub address: String,
    pub range: Range<u64>,
}

#[derive(Debug, Default)]
struct NonceSlot {
    /// Next value to hand out; `None` until the baseline is known.
    next: Option<u64>,
    /// Released leases that could not be rolled back.
    abandoned: BTreeSet<u64>,
}

pub struct NonceCoordinator {
    source: Arc<dyn NonceSource>,
    slots: DashMap<String, Arc<Mutex<NonceSlot>>>,
}

impl NonceCoordinator {
    pub fn new(source: Arc<dyn NonceSource>) -> Self {
        Self {
            source,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, address: &str) -> Arc<Mutex<NonceSlot>> {
        let key = address.to_ascii_lowercase();
        self.slots.entry(key).or_default().value().clone()
    }

    /// Registers an address, optionally with a known next nonce (fresh
    /// wallets start at 0 without asking the network).
    pub async fn register(&self, address: &str, next: Option<u64>) {
        let slot = self.slot(address);
        let mut slot = slot.lock().await;
        if slot.next.is_none() {
            slot.next = next;
        }
    }

    pub async fn allocate(&self, address: &str) -> Result<NonceLease, CallError> {
        let range = self.allocate_range(address, 1).await?;
        Ok(NonceLease {
            address: range.address,
            value: range.range.start,
        })
    }

    /// Reserves `count` consecutive nonces.
    pub async fn allocate_range(&self, address: &str, count: u64) -> Result<NonceRange, CallError> {
        let slot = self.slot(address);
        // Held across the baseline fetch so concurrent first allocations
        // wait for one fetch instead of racing their own.
        let mut slot = slot.lock().await;

        let base = match slot.next {
            Some(next) => next,
            None => {
                let fetched = self.source.pending_nonce(address).await.map_err(|e| {
                    CallError::NonceFetch {
                        address: address.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                debug!(address, nonce = fetched, "fetched baseline nonce");
                fetched
            }
        };

        let end = base.checked_add(count).ok_or_else(|| CallError::NonceFetch {
            address: address.to_string(),
            reason: "nonce space exhausted".into(),
        })?;
        slot.next = Some(end);

        Ok(NonceRange {
            address: address.to_string(),
            range: base..end,
        })
    }

    /// Returns a lease that never made it into a transaction. Only the most
    /// recent lease of an address can be rolled back; older ones are kept as
    /// abandoned so no value is ever issued twice.
    pub async fn release_unused(&self, lease: NonceLease) {
        let slot = self.slot(&lease.address);
        let mut slot = slot.lock().await;

        if slot.next == Some(lease.value + 1) {
            slot.next = Some(lease.value);
            debug!(address = lease.address.as_str(), nonce = lease.value, "rolled back nonce");
        } else {
            warn!(
                address = lease.address.as_str(),
                nonce = lease.value,
                "abandoned nonce leaves a gap"
            );
            slot.abandoned.insert(lease.value);
        }
    }

    /// Next value that would be issued, if the baseline is known.
    pub async fn peek(&self, address: &str) -> Option<u64> {
        let slot = self.slot(address);
        let slot = slot.lock().await;
        slot.next
    }

    pub async fn abandoned(&self, address: &str) -> Vec<u64> {
        let slot = self.slot(address);
        let slot = slot.lock().await;
        slot.abandoned.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts fetches and answers with a fixed baseline after a short delay.
    struct FixedSource {
        baseline: u64,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl FixedSource {
        fn new(baseline: u64) -> Arc<Self> {
            Arc::new(Self {
                baseline,
                fetches: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                baseline: 0,
                fetches: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    impl NonceSource for FixedSource {
        fn pending_nonce<'a>(&'a self, _address: &'a str) -> NonceFuture<'a> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                if self.fail {
                    Err(CallError::Network("connection refused".into()))
                } else {
                    Ok(self.baseline)
                }
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_gapless_and_unique() {
        let source = FixedSource::new(42);
        let coordinator = Arc::new(NonceCoordinator::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..500 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.allocate("0xFunder").await.unwrap().value()
            }));
        }

        let mut issued = Vec::new();
        for h in handles {
            issued.push(h.await.unwrap());
        }
        issued.sort_unstable();

        assert_eq!(issued, (42..542).collect::<Vec<_>>());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_leases_strictly_increase() {
        let coordinator = NonceCoordinator::new(FixedSource::new(7));
        let mut last = None;
        for _ in 0..10 {
            let lease = coordinator.allocate("0xabc").await.unwrap();
            if let Some(prev) = last {
                assert_eq!(lease.value(), prev + 1);
            }
            last = Some(lease.value());
        }
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let source = FixedSource::new(0);
        let coordinator = NonceCoordinator::new(source.clone());
        coordinator.register("0xaaa", Some(10)).await;

        assert_eq!(coordinator.allocate("0xaaa").await.unwrap().value(), 10);
        assert_eq!(coordinator.allocate("0xbbb").await.unwrap().value(), 0);
        assert_eq!(coordinator.allocate("0xaaa").await.unwrap().value(), 11);
        assert_eq!(coordinator.allocate("0xbbb").await.unwrap().value(), 1);
        // Only the unregistered address needed a fetch.
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_addresses_are_case_insensitive() {
        let coordinator = NonceCoordinator::new(FixedSource::new(3));
        assert_eq!(coordinator.allocate("0xABC").await.unwrap().value(), 3);
        assert_eq!(coordinator.allocate("0xabc").await.unwrap().value(), 4);
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_fabricate() {
        let source = FixedSource::failing();
        let coordinator = NonceCoordinator::new(source.clone());

        let err = coordinator.allocate("0xabc").await.unwrap_err();
        assert!(matches!(err, CallError::NonceFetch { .. }));
        assert_eq!(coordinator.peek("0xabc").await, None);

        // The next allocation tries the fetch again.
        assert!(coordinator.allocate("0xabc").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_range_allocation_is_contiguous() {
        let coordinator = NonceCoordinator::new(FixedSource::new(100));

        let first = coordinator.allocate_range("0xfunder", 50).await.unwrap();
        let second = coordinator.allocate_range("0xfunder", 50).await.unwrap();
        let single = coordinator.allocate("0xfunder").await.unwrap();

        assert_eq!(first.range, 100..150);
        assert_eq!(second.range, 150..200);
        assert_eq!(single.value(), 200);
    }

    #[tokio::test]
    async fn test_release_rolls_back_latest_lease_only() {
        let coordinator = NonceCoordinator::new(FixedSource::new(0));

        let a = coordinator.allocate("0xabc").await.unwrap();
        let b = coordinator.allocate("0xabc").await.unwrap();
        assert_eq!((a.value(), b.value()), (0, 1));

        coordinator.release_unused(b).await;
        assert_eq!(coordinator.peek("0xabc").await, Some(1));
        assert_eq!(coordinator.allocate("0xabc").await.unwrap().value(), 1);

        let _c = coordinator.allocate("0xabc").await.unwrap();
        coordinator.release_unused(a).await;
        assert_eq!(coordinator.abandoned("0xabc").await, vec![0]);
        assert_eq!(coordinator.allocate("0xabc").await.unwrap().value(), 3);
    }
}
