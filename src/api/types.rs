//! HTTP surface types
//!
//! Wire DTOs for the core endpoints. Field names are camelCase on the
//! wire; conversion to core types happens at the handler boundary.

use crate::ledger::{DailyUsage, EarnType};
use crate::storage::models::{Balance, Device, QualityProbe, RollupGranularity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Heartbeat request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub public_key: String,
    pub timestamp: i64,
    pub nonce: String,
    pub latency_ms: Option<i64>,
    pub signature: String,
}

/// Heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub signature_ok: bool,
    pub awarded: i64,
}

/// Registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub public_key: String,
    pub fingerprint: Option<String>,
    pub region: Option<String>,
    pub asn: Option<String>,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

/// Registration response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device: DeviceInfo,
    pub signature_ok: bool,
}

/// Device as exposed over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub account_id: String,
    pub public_key: String,
    pub region: Option<String>,
    pub risk_score: u8,
}

impl From<Device> for DeviceInfo {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            account_id: device.account_id,
            public_key: device.public_key,
            region: device.region,
            risk_score: device.risk_score,
        }
    }
}

/// Service earn request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnBody {
    pub account_id: String,
    #[serde(rename = "type")]
    pub earn_type: EarnType,
    pub amount: i64,
    pub meta: Option<serde_json::Value>,
    pub nonce: Option<String>,
}

/// Earn response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnResponse {
    pub credited: i64,
    pub duplicate: bool,
    pub daily: DailyUsage,
    pub balance: BalanceInfo,
}

/// Conversion request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertBody {
    pub account_id: String,
    pub points: i64,
}

/// Conversion response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub points_spent: i64,
    pub token_received: Decimal,
    pub rate: i64,
    pub balance: BalanceInfo,
}

/// Balance as exposed over the wire
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceInfo {
    pub account_id: String,
    pub points: i64,
    pub token_amount: Decimal,
}

impl From<Balance> for BalanceInfo {
    fn from(balance: Balance) -> Self {
        Self {
            token_amount: balance.token_amount(),
            account_id: balance.account_id,
            points: balance.points,
        }
    }
}

/// Rollup trigger body (cron/backfill)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupBody {
    pub window_start: Option<i64>,
}

/// Rollup trigger response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupResponse {
    pub window: WindowInfo,
    pub accounts_processed: usize,
    pub rewards_credited: usize,
}

/// Window echo in rollup responses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub granularity: RollupGranularity,
    pub start: i64,
    pub end: i64,
}

/// Quality probe ingest body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeBody {
    pub device_id: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: Option<i64>,
    #[serde(default = "default_true")]
    pub success: bool,
    pub started_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// Quality probe ingest response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub probe: ProbeInfo,
}

/// Probe as exposed over the wire
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeInfo {
    pub id: String,
    pub device_id: String,
    pub started_at: i64,
    pub download_mbps: f64,
    pub success: bool,
}

impl From<QualityProbe> for ProbeInfo {
    fn from(probe: QualityProbe) -> Self {
        Self {
            id: probe.id,
            device_id: probe.device_id,
            started_at: probe.started_at,
            download_mbps: probe.download_mbps,
            success: probe.success,
        }
    }
}

/// Error body for non-2xx responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earn_body_wire_shape() {
        let body: EarnBody = serde_json::from_str(
            r#"{"accountId":"a-1","type":"referral","amount":50,"nonce":"n-1"}"#,
        )
        .unwrap();
        assert_eq!(body.earn_type, EarnType::Referral);
        assert_eq!(body.amount, 50);

        // Unknown earn types fail at the boundary.
        assert!(serde_json::from_str::<EarnBody>(
            r#"{"accountId":"a-1","type":"jackpot","amount":50}"#
        )
        .is_err());
    }

    #[test]
    fn test_probe_success_defaults_true() {
        let body: ProbeBody = serde_json::from_str(
            r#"{"deviceId":"d-1","downloadMbps":80.5,"uploadMbps":12.0}"#,
        )
        .unwrap();
        assert!(body.success);
    }
}
