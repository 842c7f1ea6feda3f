//! Row models for the bandpoints schema
//!
//! Plain structs mirroring table shapes, plus the `AccountRef` sentinel
//! that keeps the global aggregate row out of the real-account namespace.

use rusqlite::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stable user identifier.
pub type AccountId = String;

/// Reserved id the rollup aggregator writes the global total under.
pub const SYSTEM_ACCOUNT_ID: &str = "system";

/// Either a real account or the synthetic system aggregate. Aggregation
/// code pattern-matches on this instead of comparing magic strings; on
/// the wire and in storage it is the account id or `"system"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountRef {
    Account(AccountId),
    System,
}

impl Serialize for AccountRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccountRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(AccountRef::from_column(String::deserialize(deserializer)?))
    }
}

impl AccountRef {
    pub fn as_str(&self) -> &str {
        match self {
            AccountRef::Account(id) => id,
            AccountRef::System => SYSTEM_ACCOUNT_ID,
        }
    }

    pub fn from_column(value: String) -> Self {
        if value == SYSTEM_ACCOUNT_ID {
            AccountRef::System
        } else {
            AccountRef::Account(value)
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, AccountRef::System)
    }
}

/// Reject ids that would collide with the aggregate sentinel or make
/// useless keys.
pub fn validate_account_id(id: &str) -> crate::error::Result<()> {
    if id.is_empty() {
        return Err(crate::error::Error::Validation("account id is empty".into()));
    }
    if id == SYSTEM_ACCOUNT_ID {
        return Err(crate::error::Error::Validation(
            "account id 'system' is reserved".into(),
        ));
    }
    Ok(())
}

/// Account row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub created_at: i64,
}

/// Balance row. Token holdings are stored as integer 1e-4 units so the
/// 4-decimal conversion arithmetic is exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub points: i64,
    pub token_units: i64,
    pub updated_at: i64,
}

impl Balance {
    pub fn token_amount(&self) -> Decimal {
        Decimal::from_i128_with_scale(self.token_units as i128, 4)
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get("account_id")?,
            points: row.get("points")?,
            token_units: row.get("token_units")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Device row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub account_id: AccountId,
    pub public_key: String,
    pub fingerprint: Option<String>,
    pub region: Option<String>,
    pub asn: Option<String>,
    pub risk_score: u8,
    pub created_at: i64,
}

impl Device {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            public_key: row.get("public_key")?,
            fingerprint: row.get("fingerprint")?,
            region: row.get("region")?,
            asn: row.get("asn")?,
            risk_score: row.get::<_, i64>("risk_score")?.clamp(0, u8::MAX as i64) as u8,
            created_at: row.get("created_at")?,
        })
    }
}

/// Immutable ledger event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: String,
    pub account_id: AccountId,
    pub device_id: Option<String>,
    pub event_type: String,
    pub amount: i64,
    pub source: String,
    pub rule_version: u32,
    pub dedupe_key: String,
    pub occurred_at: i64,
    pub meta: Option<serde_json::Value>,
}

/// Heartbeat row, one per device per minute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub device_id: String,
    pub minute_bucket: i64,
    pub latency_ms: Option<i64>,
    pub signature_ok: bool,
}

/// Independent bandwidth/latency measurement, write-once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityProbe {
    pub id: String,
    pub device_id: String,
    pub started_at: i64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: Option<i64>,
    pub success: bool,
}

/// Rollup window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupGranularity {
    Hour,
    Day,
}

impl RollupGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupGranularity::Hour => "hour",
            RollupGranularity::Day => "day",
        }
    }

    pub fn window_secs(&self) -> i64 {
        match self {
            RollupGranularity::Hour => 3600,
            RollupGranularity::Day => 86_400,
        }
    }

    /// Floor an epoch timestamp to the start of its window.
    pub fn window_start(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.window_secs())
    }
}

/// Materialized rollup row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupRow {
    pub granularity: RollupGranularity,
    pub window_start: i64,
    pub account: AccountRef,
    pub points_earned: i64,
    pub uptime_pct: f64,
    pub avg_download_mbps: f64,
    pub devices_seen: i64,
    pub computed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_ref_sentinel() {
        let real = AccountRef::from_column("acct-1".to_string());
        assert_eq!(real, AccountRef::Account("acct-1".to_string()));
        assert!(!real.is_system());

        let system = AccountRef::from_column("system".to_string());
        assert!(system.is_system());
        assert_eq!(system.as_str(), SYSTEM_ACCOUNT_ID);
    }

    #[test]
    fn test_reserved_id_rejected() {
        assert!(validate_account_id("system").is_err());
        assert!(validate_account_id("").is_err());
        assert!(validate_account_id("user-1").is_ok());
    }

    #[test]
    fn test_window_start_alignment() {
        let hour = RollupGranularity::Hour;
        assert_eq!(hour.window_start(3_700), 3_600);
        assert_eq!(hour.window_start(3_600), 3_600);
        let day = RollupGranularity::Day;
        assert_eq!(day.window_start(90_000), 86_400);
    }

    #[test]
    fn test_token_amount_scale() {
        let balance = Balance {
            account_id: "a".into(),
            points: 0,
            token_units: 12_345,
            updated_at: 0,
        };
        assert_eq!(balance.token_amount().to_string(), "1.2345");
    }
}
