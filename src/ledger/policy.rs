//! Earn-type policy table
//!
//! Earn types are a closed enum with compile-time policy, not runtime
//! string dispatch. The cap and cooldown checks here run inside the same
//! transaction as the ledger insert, so a concurrent pair of earn calls
//! cannot both pass against a stale sum.

use crate::error::{Error, Result};
use rusqlite::{params, Transaction};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: i64 = 86_400;

/// The earn side of the ledger. Conversions are debits and live outside
/// this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarnType {
    /// Per-minute liveness credit from the heartbeat verifier.
    Uptime,
    /// Hourly quality bonus from the reward rule engine.
    Reward,
    /// Service-originated referral credit.
    Referral,
    /// Service-originated promotional credit.
    Bonus,
}

/// Per-type limits applied before any credit lands.
#[derive(Debug, Clone, Copy)]
pub struct EarnPolicy {
    /// Min seconds between two events of this type for one account.
    pub cooldown_secs: i64,
    /// Largest single credit of this type.
    pub max_per_event: i64,
}

impl EarnType {
    pub const fn policy(&self) -> EarnPolicy {
        match self {
            // Uptime and Reward are system-originated and already
            // idempotent per minute/window via their dedupe keys.
            EarnType::Uptime => EarnPolicy {
                cooldown_secs: 0,
                max_per_event: 60,
            },
            EarnType::Reward => EarnPolicy {
                cooldown_secs: 0,
                max_per_event: 10_000,
            },
            EarnType::Referral => EarnPolicy {
                cooldown_secs: SECONDS_PER_DAY,
                max_per_event: 500,
            },
            EarnType::Bonus => EarnPolicy {
                cooldown_secs: 3_600,
                max_per_event: 1_000,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EarnType::Uptime => "uptime",
            EarnType::Reward => "reward",
            EarnType::Referral => "referral",
            EarnType::Bonus => "bonus",
        }
    }
}

/// Start of the UTC day containing `now`.
pub fn day_start(now: i64) -> i64 {
    now - now.rem_euclid(SECONDS_PER_DAY)
}

/// Sum of points earned by the account so far in the UTC day of `now`.
/// Debits (negative amounts) never reduce the earned total.
pub fn earned_today(tx: &Transaction, account_id: &str, now: i64) -> Result<i64> {
    let start = day_start(now);
    let earned: i64 = tx
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_events
             WHERE account_id = ?1 AND amount > 0
               AND occurred_at >= ?2 AND occurred_at < ?3",
            params![account_id, start, start + SECONDS_PER_DAY],
            |row| row.get(0),
        )
        .map_err(Error::Sqlite)?;
    Ok(earned)
}

/// Enforce cooldown and daily cap for one pending credit, returning the
/// amount that may actually land. Must be called inside the award
/// transaction.
pub fn enforce(
    tx: &Transaction,
    account_id: &str,
    earn_type: EarnType,
    requested: i64,
    now: i64,
    daily_cap: i64,
) -> Result<i64> {
    let policy = earn_type.policy();

    if policy.cooldown_secs > 0 {
        let last: Option<i64> = tx
            .query_row(
                "SELECT MAX(occurred_at) FROM ledger_events
                 WHERE account_id = ?1 AND event_type = ?2",
                params![account_id, earn_type.as_str()],
                |row| row.get(0),
            )
            .map_err(Error::Sqlite)?;
        if let Some(last) = last {
            let elapsed = now - last;
            if elapsed < policy.cooldown_secs {
                return Err(Error::RateLimited(format!(
                    "{} cooldown: {}s remaining",
                    earn_type.as_str(),
                    policy.cooldown_secs - elapsed
                )));
            }
        }
    }

    let remaining = daily_cap - earned_today(tx, account_id, now)?;
    if remaining <= 0 {
        return Err(Error::DailyCapReached {
            account: account_id.to_string(),
            cap: daily_cap,
        });
    }

    Ok(requested.min(policy.max_per_event).min(remaining))
}
