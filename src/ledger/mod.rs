//! Ledger writer
//!
//! The single choke-point for point mutations. Every credit appends an
//! immutable ledger event and bumps the derived balance row inside one
//! transaction, keyed by a globally unique dedupe key: replaying the same
//! key is a successful no-op, never a double credit. Cap and cooldown
//! checks run inside the same transaction, so check-then-credit cannot
//! race against a concurrent earn for the same account.

pub mod policy;

use crate::error::{Error, Result};
use crate::storage::models::{validate_account_id, AccountId, Balance};
use crate::storage::DatabasePool;
use rusqlite::{params, OptionalExtension, Transaction};
use uuid::Uuid;

pub use policy::{day_start, EarnPolicy, EarnType};

/// One pending credit.
#[derive(Debug, Clone)]
pub struct AwardRequest {
    pub account_id: AccountId,
    pub device_id: Option<String>,
    pub earn_type: EarnType,
    pub amount: i64,
    pub source: String,
    pub rule_version: u32,
    pub dedupe_key: String,
    pub occurred_at: i64,
    pub meta: Option<serde_json::Value>,
}

/// What the writer did with a request.
#[derive(Debug, Clone)]
pub struct AwardOutcome {
    pub accepted: bool,
    /// The dedupe key had already been applied; nothing changed.
    pub duplicate: bool,
    /// Points actually credited after cap clamping (0 on duplicate).
    pub credited: i64,
    pub balance: Balance,
}

/// Daily earn usage for an account.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DailyUsage {
    pub used: i64,
    pub cap: i64,
    pub remain: i64,
}

/// Appends ledger events and maintains balances.
#[derive(Clone)]
pub struct LedgerWriter {
    pool: DatabasePool,
    daily_cap: i64,
}

impl LedgerWriter {
    pub fn new(pool: DatabasePool, daily_cap: i64) -> Self {
        Self { pool, daily_cap }
    }

    /// Create an account if it does not exist. Safe to call repeatedly.
    pub async fn ensure_account(&self, account_id: &str, now: i64) -> Result<()> {
        validate_account_id(account_id)?;
        let account_id = account_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO accounts (id, created_at) VALUES (?1, ?2)",
                    params![account_id, now],
                )
                .map_err(Error::Sqlite)?;
                Ok(())
            })
            .await
    }

    /// Append one credit event and bump the balance, atomically and
    /// idempotently.
    pub async fn award(&self, req: AwardRequest) -> Result<AwardOutcome> {
        validate_account_id(&req.account_id)?;
        if req.amount <= 0 {
            return Err(Error::Validation("award amount must be positive".into()));
        }
        if req.dedupe_key.is_empty() {
            return Err(Error::Validation("dedupe key is empty".into()));
        }

        let daily_cap = self.daily_cap;
        self.pool
            .transaction(move |tx| {
                let known: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM accounts WHERE id = ?1",
                        params![req.account_id],
                        |row| row.get(0),
                    )
                    .map_err(Error::Sqlite)?;
                if known == 0 {
                    return Err(Error::NotFound(format!("account {}", req.account_id)));
                }

                // A replayed key is a success with nothing to do. Checked
                // before caps so retries cannot trip the cooldown.
                if dedupe_key_exists(tx, &req.dedupe_key)? {
                    let balance = read_balance(tx, &req.account_id)?;
                    return Ok(AwardOutcome {
                        accepted: true,
                        duplicate: true,
                        credited: 0,
                        balance,
                    });
                }

                let credited = policy::enforce(
                    tx,
                    &req.account_id,
                    req.earn_type,
                    req.amount,
                    req.occurred_at,
                    daily_cap,
                )?;

                let meta = req
                    .meta
                    .as_ref()
                    .map(|m| serde_json::to_string(m))
                    .transpose()
                    .map_err(|e| Error::Serialization(e.to_string()))?;

                let inserted = tx.execute(
                    "INSERT INTO ledger_events
                     (id, account_id, device_id, event_type, amount, source,
                      rule_version, dedupe_key, occurred_at, meta)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        Uuid::new_v4().to_string(),
                        req.account_id,
                        req.device_id,
                        req.earn_type.as_str(),
                        credited,
                        req.source,
                        req.rule_version,
                        req.dedupe_key,
                        req.occurred_at,
                        meta,
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    // Lost a dedupe race to another writer between the
                    // pre-check and the insert: same answer, no credit.
                    Err(rusqlite::Error::SqliteFailure(e, ref msg))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation
                            && msg.as_deref().map_or(false, |m| m.contains("dedupe_key")) =>
                    {
                        let balance = read_balance(tx, &req.account_id)?;
                        return Ok(AwardOutcome {
                            accepted: true,
                            duplicate: true,
                            credited: 0,
                            balance,
                        });
                    }
                    Err(e) => return Err(Error::Sqlite(e)),
                }

                apply_balance_delta(tx, &req.account_id, credited, 0, req.occurred_at)?;
                let balance = read_balance(tx, &req.account_id)?;

                log::debug!(
                    "award: account={} type={} credited={} dedupe={}",
                    req.account_id,
                    req.earn_type.as_str(),
                    credited,
                    req.dedupe_key
                );

                Ok(AwardOutcome {
                    accepted: true,
                    duplicate: false,
                    credited,
                    balance,
                })
            })
            .await
    }

    pub async fn account_exists(&self, account_id: &str) -> Result<bool> {
        let account_id = account_id.to_string();
        self.pool
            .with_connection(move |conn| {
                let found: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM accounts WHERE id = ?1",
                        params![account_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(Error::Sqlite)?;
                Ok(found.is_some())
            })
            .await
    }

    /// Current balance, zero row if the account has never earned.
    pub async fn get_balance(&self, account_id: &str) -> Result<Balance> {
        let account_id = account_id.to_string();
        self.pool
            .with_connection(move |conn| {
                let tx = conn.transaction().map_err(Error::Sqlite)?;
                let balance = read_balance(&tx, &account_id)?;
                Ok(balance)
            })
            .await
    }

    /// Today's earn usage against the daily cap.
    pub async fn daily_usage(&self, account_id: &str, now: i64) -> Result<DailyUsage> {
        let account_id = account_id.to_string();
        let cap = self.daily_cap;
        self.pool
            .with_connection(move |conn| {
                let tx = conn.transaction().map_err(Error::Sqlite)?;
                let used = policy::earned_today(&tx, &account_id, now)?;
                Ok(DailyUsage {
                    used,
                    cap,
                    remain: (cap - used).max(0),
                })
            })
            .await
    }
}

fn dedupe_key_exists(tx: &Transaction, dedupe_key: &str) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM ledger_events WHERE dedupe_key = ?1",
            params![dedupe_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::Sqlite)?;
    Ok(found.is_some())
}

/// Read the balance row inside a transaction, defaulting to zero.
pub(crate) fn read_balance(tx: &Transaction, account_id: &str) -> Result<Balance> {
    let row = tx
        .query_row(
            "SELECT account_id, points, token_units, updated_at
             FROM balances WHERE account_id = ?1",
            params![account_id],
            |row| Balance::from_row(row),
        )
        .optional()
        .map_err(Error::Sqlite)?;
    Ok(row.unwrap_or(Balance {
        account_id: account_id.to_string(),
        points: 0,
        token_units: 0,
        updated_at: 0,
    }))
}

/// Upsert-increment the balance row. Negative deltas are the conversion
/// settlement's debit path; callers guarantee sufficiency beforehand in
/// the same transaction.
pub(crate) fn apply_balance_delta(
    tx: &Transaction,
    account_id: &str,
    points_delta: i64,
    token_units_delta: i64,
    now: i64,
) -> Result<()> {
    tx.execute(
        "INSERT INTO balances (account_id, points, token_units, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
             points = points + excluded.points,
             token_units = token_units + excluded.token_units,
             updated_at = excluded.updated_at",
        params![account_id, points_delta, token_units_delta, now],
    )
    .map_err(Error::Sqlite)?;
    Ok(())
}
