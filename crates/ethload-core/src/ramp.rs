use tokio::time::Instant;

use crate::config::Stage;

/// Deterministic stage planner: stages are applied strictly in order, using
/// integer milliseconds only. `target` is a VU count or an iteration rate
/// per second depending on the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlanner {
    stages: Vec<Stage>,
}

impl RampPlanner {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// A single stage holding `target` for `duration_ms`.
    pub fn constant(target: u64, duration_ms: u64) -> Self {
        Self::new(vec![Stage {
            target,
            hold_ms: duration_ms,
        }])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Total duration of all stages in milliseconds; this is the run deadline.
    pub fn total_duration_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.hold_ms).sum()
    }

    /// Highest target of any stage.
    pub fn peak(&self) -> u64 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target at a given elapsed time, `None` once every stage has run.
    pub fn current_target(&self, elapsed_ms: u64) -> Option<u64> {
        let mut cumulative_ms = 0u64;
        for stage in &self.stages {
            if elapsed_ms < cumulative_ms + stage.hold_ms {
                return Some(stage.target);
            }
            cumulative_ms += stage.hold_ms;
        }
        None
    }

    /// Target at `now` for a run that began at `started`.
    pub fn target_at(&self, started: Instant, now: Instant) -> Option<u64> {
        let elapsed = now.saturating_duration_since(started).as_millis() as u64;
        self.current_target(elapsed)
    }
}
