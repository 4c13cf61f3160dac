//! Load-profile executors.
//!
//! VU executors keep `peak` workers alive and let worker `i` iterate only
//! while `i` is below the current stage target. Arrival-rate executors start
//! iterations at the stage rate and drop an iteration when every VU slot is
//! busy. Either way no iteration starts after the deadline; running ones are
//! left to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info};

use crate::config::LoadProfile;
use crate::metrics::{names, tags, MetricsAggregator, TagSet};
use crate::ramp::RampPlanner;
use crate::rate_limiter::RateLimiter;
use crate::scenario::Dispatcher;

/// How often an idle VU re-checks the stage target.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub iterations: u64,
    pub failed_iterations: u64,
    pub dropped_iterations: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    iterations: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Keeps `vus_active` in step with running VUs.
struct ActiveVu {
    metrics: Arc<MetricsAggregator>,
    tags: TagSet,
}

impl ActiveVu {
    fn enter(metrics: Arc<MetricsAggregator>, tags: TagSet) -> Self {
        metrics.add(&names::VUS_ACTIVE, 1.0, &tags);
        Self { metrics, tags }
    }
}

impl Drop for ActiveVu {
    fn drop(&mut self) {
        self.metrics.add(&names::VUS_ACTIVE, -1.0, &self.tags);
    }
}

pub struct Executor {
    profile: LoadProfile,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<Counters>,
}

impl Executor {
    pub fn new(profile: LoadProfile, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            profile,
            dispatcher,
            counters: Arc::new(Counters::default()),
        }
    }

    fn tags(&self) -> TagSet {
        let ctx = self.dispatcher.context();
        ctx.base_tags().with(tags::SCENARIO, ctx.scenario())
    }

    pub async fn run(&self) -> ExecutionReport {
        let planner = self.profile.planner();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(planner.total_duration_ms());
        info!(
            scenario = self.dispatcher.context().scenario(),
            duration_ms = planner.total_duration_ms(),
            max_vus = self.profile.max_vus(),
            arrival_rate = self.profile.is_arrival_rate(),
            "execution started"
        );

        if self.profile.is_arrival_rate() {
            self.run_arrival_rate(planner, started, deadline).await;
        } else {
            self.run_vus(planner, started, deadline).await;
        }

        let report = ExecutionReport {
            iterations: self.counters.iterations.load(Ordering::Relaxed),
            failed_iterations: self.counters.failed.load(Ordering::Relaxed),
            dropped_iterations: self.counters.dropped.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!(
            iterations = report.iterations,
            failed = report.failed_iterations,
            dropped = report.dropped_iterations,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "execution finished"
        );
        report
    }

    async fn run_vus(&self, planner: RampPlanner, started: Instant, deadline: Instant) {
        let planner = Arc::new(planner);
        let mut vus = JoinSet::new();

        for worker in 0..planner.peak() as usize {
            let planner = planner.clone();
            let dispatcher = self.dispatcher.clone();
            let counters = self.counters.clone();
            let tags = self.tags();

            vus.spawn(async move {
                let metrics = dispatcher.context().metrics().clone();
                let mut active: Option<ActiveVu> = None;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match planner.target_at(started, now) {
                        Some(target) if (worker as u64) < target => {
                            if active.is_none() {
                                active = Some(ActiveVu::enter(metrics.clone(), tags.clone()));
                            }
                            iteration(&dispatcher, &counters, &tags, worker).await;
                        }
                        _ => {
                            active = None;
                            sleep(IDLE_POLL.min(deadline - now)).await;
                        }
                    }
                }
            });
        }

        while vus.join_next().await.is_some() {}
    }

    async fn run_arrival_rate(&self, planner: RampPlanner, started: Instant, deadline: Instant) {
        let max_vus = self.profile.max_vus().max(1) as usize;
        let slots = Arc::new(Semaphore::new(max_vus));
        let mut sequence = 0usize;
        let tags = self.tags();
        let metrics = self.dispatcher.context().metrics().clone();
        let mut limiter = RateLimiter::new(planner.current_target(0).unwrap_or(0));
        let mut in_flight = JoinSet::new();

        loop {
            let now = Instant::now();
            let Some(rate) = planner.target_at(started, now).filter(|_| now < deadline) else {
                break;
            };
            limiter.set_rate(rate);

            match timeout_at(deadline, limiter.acquire()).await {
                Err(_) => break,
                Ok(false) => {
                    sleep(IDLE_POLL.min(deadline.saturating_duration_since(now))).await;
                    continue;
                }
                Ok(true) if Instant::now() >= deadline => break,
                Ok(true) => {}
            }

            let Ok(permit) = slots.clone().try_acquire_owned() else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics.add(&names::DROPPED_ITERATIONS, 1.0, &tags);
                debug!(rate, "all VUs busy, iteration dropped");
                continue;
            };

            let worker = sequence % max_vus;
            sequence += 1;
            let dispatcher = self.dispatcher.clone();
            let counters = self.counters.clone();
            let tags = tags.clone();
            let metrics = metrics.clone();
            in_flight.spawn(async move {
                let _active = ActiveVu::enter(metrics, tags.clone());
                iteration(&dispatcher, &counters, &tags, worker).await;
                drop(permit);
            });

            // Reap finished tasks so the set does not grow for the whole run.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
    }
}

async fn iteration(dispatcher: &Dispatcher, counters: &Counters, tags: &TagSet, worker: usize) {
    let started = Instant::now();
    let outcome = dispatcher.run_once(worker).await;
    let elapsed = started.elapsed();

    let metrics = dispatcher.context().metrics();
    let result = if outcome.is_success() { "success" } else { "failure" };
    let tags = tags.clone().with(tags::OUTCOME, result);
    metrics.add(&names::ITERATIONS, 1.0, &tags);
    metrics.add(
        &names::ITERATION_DURATION_MS,
        elapsed.as_secs_f64() * 1000.0,
        &tags,
    );

    counters.iterations.fetch_add(1, Ordering::Relaxed);
    if !outcome.is_success() {
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}
