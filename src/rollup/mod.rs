//! Rollup aggregation
//!
//! Materializes hourly and daily summaries of raw ledger, heartbeat, and
//! probe data, per account plus a synthetic system-total row. The
//! aggregator is a pure function of the window's raw rows: it carries no
//! clock state, takes the window as an argument, and upserts, so a crashed
//! or repeated run converges on the same output instead of double
//! counting.

pub mod jobs;

use crate::error::{Error, Result};
use crate::ledger::{AwardRequest, EarnType, LedgerWriter};
use crate::rules::{self, RewardRule, ScoreInput};
use crate::storage::models::{
    AccountRef, QualityProbe, RollupGranularity, RollupRow, SYSTEM_ACCOUNT_ID,
};
use crate::storage::DatabasePool;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one aggregation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RollupReport {
    pub granularity: RollupGranularity,
    pub window_start: i64,
    pub accounts_processed: usize,
}

/// Per-account derived values for one window.
#[derive(Debug, Default, Clone)]
struct WindowAggregate {
    points_earned: i64,
    uptime_minutes: i64,
    avg_download_mbps: Option<f64>,
    devices_seen: i64,
}

/// Materializes rollups and drives the hourly reward pass.
#[derive(Clone)]
pub struct RollupAggregator {
    pool: DatabasePool,
    ledger: LedgerWriter,
    rule: RewardRule,
}

impl RollupAggregator {
    pub fn new(pool: DatabasePool, ledger: LedgerWriter, rule: RewardRule) -> Self {
        Self { pool, ledger, rule }
    }

    /// Aggregate one window and upsert its rollup rows. `window_start` is
    /// floored to the granularity boundary first.
    pub async fn run(
        &self,
        granularity: RollupGranularity,
        window_start: i64,
        now: i64,
    ) -> Result<RollupReport> {
        let start = granularity.window_start(window_start);
        let end = start + granularity.window_secs();
        let window_minutes = granularity.window_secs() / 60;

        let per_account = self
            .pool
            .with_connection(move |conn| collect_window(conn, start, end))
            .await?;

        let mut rows: Vec<RollupRow> = per_account
            .iter()
            .map(|(account_id, agg)| RollupRow {
                granularity,
                window_start: start,
                account: AccountRef::Account(account_id.clone()),
                points_earned: agg.points_earned,
                uptime_pct: agg.uptime_minutes as f64 / window_minutes as f64 * 100.0,
                avg_download_mbps: agg.avg_download_mbps.unwrap_or(0.0),
                devices_seen: agg.devices_seen,
                computed_at: now,
            })
            .collect();

        // Stable output ordering keeps re-runs byte-identical.
        rows.sort_by(|a, b| a.account.as_str().cmp(b.account.as_str()));
        rows.push(system_row(granularity, start, now, &rows));

        let accounts_processed = rows.len() - 1;
        self.pool
            .transaction(move |tx| {
                for row in &rows {
                    tx.execute(
                        "INSERT INTO rollups
                         (granularity, window_start, account_id, points_earned,
                          uptime_pct, avg_download_mbps, devices_seen, computed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT(granularity, window_start, account_id) DO UPDATE SET
                             points_earned = excluded.points_earned,
                             uptime_pct = excluded.uptime_pct,
                             avg_download_mbps = excluded.avg_download_mbps,
                             devices_seen = excluded.devices_seen,
                             computed_at = excluded.computed_at",
                        params![
                            row.granularity.as_str(),
                            row.window_start,
                            row.account.as_str(),
                            row.points_earned,
                            row.uptime_pct,
                            row.avg_download_mbps,
                            row.devices_seen,
                            row.computed_at,
                        ],
                    )
                    .map_err(Error::Sqlite)?;
                }
                Ok(())
            })
            .await?;

        log::info!(
            "rollup {} window={} accounts={}",
            granularity.as_str(),
            start,
            accounts_processed
        );

        Ok(RollupReport {
            granularity,
            window_start: start,
            accounts_processed,
        })
    }

    /// Feed each account's hourly rollup row through the rule engine and
    /// credit eligible bonuses. Idempotent per `(account, window)` via the
    /// dedupe key; the credit lands at window close so the scored window's
    /// own rollup stays stable under re-runs.
    pub async fn distribute_rewards(&self, window_start: i64) -> Result<usize> {
        let granularity = RollupGranularity::Hour;
        let start = granularity.window_start(window_start);
        let window_end = start + granularity.window_secs();

        let rows = self.window_rows(granularity, start).await?;
        let mut credited = 0usize;

        for row in rows {
            let account_id = match &row.account {
                AccountRef::Account(id) => id.clone(),
                AccountRef::System => continue,
            };

            let risk_score = self.account_risk(&account_id).await?;
            let score = rules::score(
                &self.rule,
                ScoreInput {
                    uptime_pct: row.uptime_pct,
                    download_mbps: row.avg_download_mbps,
                    risk_score,
                },
            );
            if !score.eligible {
                log::debug!(
                    "reward skipped: account={} window={} reason={}",
                    account_id,
                    start,
                    score.reason.as_str()
                );
                continue;
            }

            let outcome = self
                .ledger
                .award(AwardRequest {
                    account_id: account_id.clone(),
                    device_id: None,
                    earn_type: EarnType::Reward,
                    amount: score.points,
                    source: "reward_engine".to_string(),
                    rule_version: self.rule.rule_version,
                    dedupe_key: format!("{}:HOURLY_REWARD:{}", account_id, start),
                    occurred_at: window_end,
                    meta: Some(serde_json::json!({
                        "window_start": start,
                        "uptime_mult": score.breakdown.uptime_mult,
                        "bandwidth_mult": score.breakdown.bandwidth_mult,
                        "risk_mult": score.breakdown.risk_mult,
                    })),
                })
                .await;
            match outcome {
                Ok(outcome) if !outcome.duplicate => credited += 1,
                Ok(_) => {}
                // Cap exhaustion is a per-account condition, not a job
                // failure; the rest of the batch still settles.
                Err(Error::DailyCapReached { account, .. }) => {
                    log::warn!("reward capped out for account {}", account);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(credited)
    }

    /// Record an independent quality probe.
    pub async fn record_probe(
        &self,
        device_id: &str,
        download_mbps: f64,
        upload_mbps: f64,
        latency_ms: Option<i64>,
        success: bool,
        started_at: i64,
    ) -> Result<QualityProbe> {
        if !download_mbps.is_finite() || download_mbps < 0.0 {
            return Err(Error::Validation("download_mbps must be non-negative".into()));
        }
        let probe = QualityProbe {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            started_at,
            download_mbps,
            upload_mbps,
            latency_ms,
            success,
        };
        let insert = probe.clone();
        self.pool
            .with_connection(move |conn| {
                let known: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM devices WHERE id = ?1",
                        params![insert.device_id],
                        |row| row.get(0),
                    )
                    .map_err(Error::Sqlite)?;
                if known == 0 {
                    return Err(Error::NotFound(format!("device {}", insert.device_id)));
                }
                conn.execute(
                    "INSERT INTO quality_probes
                     (id, device_id, started_at, download_mbps, upload_mbps, latency_ms, success)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        insert.id,
                        insert.device_id,
                        insert.started_at,
                        insert.download_mbps,
                        insert.upload_mbps,
                        insert.latency_ms,
                        insert.success,
                    ],
                )
                .map_err(Error::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(probe)
    }

    /// All rollup rows for one window, system row included.
    pub async fn window_rows(
        &self,
        granularity: RollupGranularity,
        window_start: i64,
    ) -> Result<Vec<RollupRow>> {
        self.pool
            .with_connection(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT account_id, points_earned, uptime_pct, avg_download_mbps,
                                devices_seen, computed_at
                         FROM rollups
                         WHERE granularity = ?1 AND window_start = ?2
                         ORDER BY account_id",
                    )
                    .map_err(Error::Sqlite)?;
                let rows = stmt
                    .query_map(params![granularity.as_str(), window_start], |row| {
                        Ok(RollupRow {
                            granularity,
                            window_start,
                            account: AccountRef::from_column(row.get(0)?),
                            points_earned: row.get(1)?,
                            uptime_pct: row.get(2)?,
                            avg_download_mbps: row.get(3)?,
                            devices_seen: row.get(4)?,
                            computed_at: row.get(5)?,
                        })
                    })
                    .map_err(Error::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(Error::Sqlite)?;
                Ok(rows)
            })
            .await
    }

    /// Max risk score across an account's devices — the conservative
    /// account-level risk input.
    async fn account_risk(&self, account_id: &str) -> Result<u8> {
        let account_id = account_id.to_string();
        self.pool
            .with_connection(move |conn| {
                let risk: Option<i64> = conn
                    .query_row(
                        "SELECT MAX(risk_score) FROM devices WHERE account_id = ?1",
                        params![account_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(Error::Sqlite)?
                    .flatten();
                Ok(risk.unwrap_or(0).clamp(0, u8::MAX as i64) as u8)
            })
            .await
    }
}

/// Gather the three raw aggregates for `[start, end)`, merged per account.
fn collect_window(
    conn: &mut Connection,
    start: i64,
    end: i64,
) -> Result<HashMap<String, WindowAggregate>> {
    let mut accounts: HashMap<String, WindowAggregate> = HashMap::new();

    // Earned points: positive earn-type amounts only; conversion debits
    // are net-balance concerns, not earned activity.
    let mut stmt = conn
        .prepare(
            "SELECT account_id, SUM(amount) FROM ledger_events
             WHERE occurred_at >= ?1 AND occurred_at < ?2
               AND amount > 0
             GROUP BY account_id",
        )
        .map_err(Error::Sqlite)?;
    let earned = stmt
        .query_map(params![start, end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(Error::Sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::Sqlite)?;
    for (account_id, points) in earned {
        accounts.entry(account_id).or_default().points_earned = points;
    }

    // Uptime: distinct verified minute-buckets across the account's
    // devices. Unsigned minutes exist in storage but earn no uptime.
    let mut stmt = conn
        .prepare(
            "SELECT d.account_id,
                    COUNT(DISTINCT h.minute_bucket),
                    COUNT(DISTINCT h.device_id)
             FROM heartbeats h
             JOIN devices d ON d.id = h.device_id
             WHERE h.minute_bucket >= ?1 AND h.minute_bucket < ?2
               AND h.signature_ok = 1
             GROUP BY d.account_id",
        )
        .map_err(Error::Sqlite)?;
    let uptime = stmt
        .query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(Error::Sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::Sqlite)?;
    for (account_id, minutes, devices) in uptime {
        let agg = accounts.entry(account_id).or_default();
        agg.uptime_minutes = minutes;
        agg.devices_seen = devices;
    }

    // Bandwidth: mean download across successful probes in the window.
    let mut stmt = conn
        .prepare(
            "SELECT d.account_id, AVG(p.download_mbps)
             FROM quality_probes p
             JOIN devices d ON d.id = p.device_id
             WHERE p.started_at >= ?1 AND p.started_at < ?2
               AND p.success = 1
             GROUP BY d.account_id",
        )
        .map_err(Error::Sqlite)?;
    let bandwidth = stmt
        .query_map(params![start, end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })
        .map_err(Error::Sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::Sqlite)?;
    for (account_id, avg) in bandwidth {
        accounts.entry(account_id).or_default().avg_download_mbps = Some(avg);
    }

    accounts.remove(SYSTEM_ACCOUNT_ID);
    Ok(accounts)
}

/// Global totals: summed points and devices, activity-weighted means for
/// uptime and bandwidth.
fn system_row(
    granularity: RollupGranularity,
    window_start: i64,
    now: i64,
    rows: &[RollupRow],
) -> RollupRow {
    let points_earned = rows.iter().map(|r| r.points_earned).sum();
    let devices_seen = rows.iter().map(|r| r.devices_seen).sum();
    let uptime_pct = mean(rows.iter().map(|r| r.uptime_pct).filter(|v| *v > 0.0));
    let avg_download_mbps = mean(
        rows.iter()
            .map(|r| r.avg_download_mbps)
            .filter(|v| *v > 0.0),
    );

    RollupRow {
        granularity,
        window_start,
        account: AccountRef::System,
        points_earned,
        uptime_pct,
        avg_download_mbps,
        devices_seen,
        computed_at: now,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_row_totals() {
        let rows = vec![
            RollupRow {
                granularity: RollupGranularity::Hour,
                window_start: 0,
                account: AccountRef::Account("a".into()),
                points_earned: 40,
                uptime_pct: 50.0,
                avg_download_mbps: 20.0,
                devices_seen: 1,
                computed_at: 0,
            },
            RollupRow {
                granularity: RollupGranularity::Hour,
                window_start: 0,
                account: AccountRef::Account("b".into()),
                points_earned: 60,
                uptime_pct: 100.0,
                avg_download_mbps: 0.0,
                devices_seen: 2,
                computed_at: 0,
            },
        ];
        let system = system_row(RollupGranularity::Hour, 0, 0, &rows);
        assert!(system.account.is_system());
        assert_eq!(system.points_earned, 100);
        assert_eq!(system.devices_seen, 3);
        assert_eq!(system.uptime_pct, 75.0);
        assert_eq!(system.avg_download_mbps, 20.0);
    }

    #[test]
    fn test_mean_of_empty_is_zero() {
        assert_eq!(mean(std::iter::empty()), 0.0);
    }
}
