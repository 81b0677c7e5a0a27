//! Background housekeeping for the engine.
//!
//! Two independent loops: one sweeps lapsed blocks and expired counters, the
//! other resets statistics. Neither holds engine locks across an await, so
//! request checks never wait on them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::limiter::RateLimitEngine;

/// Default interval between block sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default interval between statistics resets.
pub const DEFAULT_STATS_RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Intervals for the background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    /// Time between block/counter sweeps
    pub sweep_interval: Duration,
    /// Time between statistics resets
    pub stats_reset_interval: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stats_reset_interval: DEFAULT_STATS_RESET_INTERVAL,
        }
    }
}

/// Handle to the running background loops.
#[derive(Debug)]
pub struct SweepScheduler {
    sweep_task: JoinHandle<()>,
    reset_task: JoinHandle<()>,
}

impl SweepScheduler {
    /// Spawn both loops on the current runtime.
    ///
    /// The first run of each loop happens one full interval after spawning.
    pub fn spawn(engine: Arc<RateLimitEngine>, schedule: SweepSchedule) -> Self {
        info!(
            sweep_interval_secs = schedule.sweep_interval.as_secs(),
            stats_reset_interval_secs = schedule.stats_reset_interval.as_secs(),
            "Starting rate limit sweep scheduler"
        );

        let sweep_engine = engine.clone();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = delayed_interval(schedule.sweep_interval);
            loop {
                ticker.tick().await;
                let report = sweep_engine.sweep().await;
                debug!(
                    blocks_removed = report.blocks_removed,
                    counters_removed = report.counters_removed,
                    "Sweep pass complete"
                );
            }
        });

        let reset_task = tokio::spawn(async move {
            let mut ticker = delayed_interval(schedule.stats_reset_interval);
            loop {
                ticker.tick().await;
                engine.reset_stats();
            }
        });

        Self {
            sweep_task,
            reset_task,
        }
    }

    /// Stop both loops and wait for them to wind down.
    pub async fn shutdown(self) {
        self.sweep_task.abort();
        self.reset_task.abort();
        // Both tasks end cancelled; the join errors carry nothing useful.
        let _ = futures::future::join(self.sweep_task, self.reset_task).await;
        info!("Sweep scheduler stopped");
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCounterStore;

    fn engine_at(start_ms: u64) -> (Arc<ManualClock>, Arc<RateLimitEngine>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        (
            clock.clone(),
            Arc::new(RateLimitEngine::with_clock(store, clock)),
        )
    }

    #[test]
    fn test_default_schedule() {
        let schedule = SweepSchedule::default();
        assert_eq!(schedule.sweep_interval, Duration::from_secs(300));
        assert_eq!(schedule.stats_reset_interval, Duration::from_secs(86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_purges_lapsed_blocks() {
        let (clock, engine) = engine_at(0);
        engine.block_identifier("id", 1_000, "test").unwrap();
        clock.advance(2_000);

        let scheduler = SweepScheduler::spawn(
            engine.clone(),
            SweepSchedule {
                sweep_interval: Duration::from_secs(60),
                stats_reset_interval: Duration::from_secs(3_600),
            },
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Nothing left for a manual pass: the loop already removed it
        assert_eq!(engine.sweep().await.blocks_removed, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_loop_zeroes_stats_and_keeps_blocks() {
        let (_clock, engine) = engine_at(0);
        engine.check_limit("api_general", "a", None).await;
        engine.block_identifier("b", 60 * 60 * 1000, "test").unwrap();

        let scheduler = SweepScheduler::spawn(
            engine.clone(),
            SweepSchedule {
                sweep_interval: Duration::from_secs(3_600),
                stats_reset_interval: Duration::from_secs(10),
            },
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.get_stats().total_requests, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let stats = engine.get_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.active_blocks, 1);

        scheduler.shutdown().await;
    }
}
