//! Idempotent rollup jobs
//!
//! Jobs are keyed by `(kind, window_start)`. Execution is abstracted
//! behind a trait so the driver — the in-process ticker here, cron or a
//! real queue elsewhere — can change without touching aggregation logic.
//! Running a key twice is harmless: the aggregator upserts and the reward
//! pass dedupes per window.

use super::RollupAggregator;
use crate::error::Result;
use crate::storage::models::RollupGranularity;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Kinds of periodic work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    HourlyRollup,
    DailyRollup,
}

impl JobKind {
    pub fn granularity(&self) -> RollupGranularity {
        match self {
            JobKind::HourlyRollup => RollupGranularity::Hour,
            JobKind::DailyRollup => RollupGranularity::Day,
        }
    }
}

/// At-most-once-per-window job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub kind: JobKind,
    pub window_start: i64,
}

/// Outcome of one job run.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub key: JobKey,
    pub accounts_processed: usize,
    pub rewards_credited: usize,
}

/// Something that can execute a rollup job for a window.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, key: JobKey, now: i64) -> Result<JobReport>;
}

#[async_trait]
impl JobHandler for RollupAggregator {
    async fn run(&self, key: JobKey, now: i64) -> Result<JobReport> {
        let report = self
            .run(key.kind.granularity(), key.window_start, now)
            .await?;
        let rewards_credited = match key.kind {
            JobKind::HourlyRollup => self.distribute_rewards(key.window_start).await?,
            JobKind::DailyRollup => 0,
        };
        Ok(JobReport {
            key,
            accounts_processed: report.accounts_processed,
            rewards_credited,
        })
    }
}

/// In-process driver: on each tick, runs any job whose previous window has
/// closed and was not yet run by this process. Missed windows after a
/// restart are healed by manual backfill; completed ones re-run safely.
pub struct TickerScheduler {
    handler: Arc<dyn JobHandler>,
    tick: Duration,
    completed: Arc<Mutex<HashSet<JobKey>>>,
}

impl TickerScheduler {
    pub fn new(handler: Arc<dyn JobHandler>, tick: Duration) -> Self {
        Self {
            handler,
            tick,
            completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Keys due at `now`: the most recently closed window of each kind.
    fn due_keys(now: i64) -> [JobKey; 2] {
        [
            JobKey {
                kind: JobKind::HourlyRollup,
                window_start: RollupGranularity::Hour.window_start(now)
                    - RollupGranularity::Hour.window_secs(),
            },
            JobKey {
                kind: JobKind::DailyRollup,
                window_start: RollupGranularity::Day.window_start(now)
                    - RollupGranularity::Day.window_secs(),
            },
        ]
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = chrono::Utc::now().timestamp();

                for key in Self::due_keys(now) {
                    let already = self.completed.lock().await.contains(&key);
                    if already {
                        continue;
                    }
                    match self.handler.run(key, now).await {
                        Ok(report) => {
                            log::info!(
                                "job {:?} window={} accounts={} rewards={}",
                                key.kind,
                                key.window_start,
                                report.accounts_processed,
                                report.rewards_credited
                            );
                            self.completed.lock().await.insert(key);
                        }
                        Err(e) => {
                            // Leave the key pending so the next tick retries.
                            log::error!("job {:?} window={} failed: {}", key.kind, key.window_start, e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_keys_trail_closed_windows() {
        // 02:30 UTC on day 1: hourly job targets 01:00, daily targets day 0.
        let now = 86_400 + 2 * 3_600 + 1_800;
        let [hourly, daily] = TickerScheduler::due_keys(now);
        assert_eq!(hourly.kind, JobKind::HourlyRollup);
        assert_eq!(hourly.window_start, 86_400 + 3_600);
        assert_eq!(daily.kind, JobKind::DailyRollup);
        assert_eq!(daily.window_start, 0);
    }
}
