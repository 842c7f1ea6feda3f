//! Heartbeat verification and device registration
//!
//! Devices prove liveness with a signed ping per minute. Verification
//! never rejects the HTTP call on a bad signature — the minute is
//! recorded with `signature_ok = false` and simply earns nothing.
//! Timestamps outside the drift window are rejected outright and leave
//! no record (replay/clock-skew defense).

use crate::config::HeartbeatConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::ledger::{AwardRequest, EarnType, LedgerWriter};
use crate::storage::models::Device;
use crate::storage::DatabasePool;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire shape of a heartbeat ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub public_key: String,
    pub timestamp: i64,
    pub nonce: String,
    pub latency_ms: Option<i64>,
    pub signature: String,
}

/// What one heartbeat did.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatOutcome {
    pub signature_ok: bool,
    /// Points credited for this minute (0 on re-delivery or bad signature).
    pub awarded: i64,
    pub minute_bucket: i64,
}

/// Wire shape of a device registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub public_key: String,
    pub fingerprint: Option<String>,
    pub region: Option<String>,
    pub asn: Option<String>,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

/// Validates liveness pings and registers devices.
#[derive(Clone)]
pub struct HeartbeatVerifier {
    pool: DatabasePool,
    ledger: LedgerWriter,
    config: HeartbeatConfig,
}

impl HeartbeatVerifier {
    pub fn new(pool: DatabasePool, ledger: LedgerWriter, config: HeartbeatConfig) -> Self {
        Self {
            pool,
            ledger,
            config,
        }
    }

    /// Register a device, creating its owning account on first contact.
    /// Re-registration of a known public key is idempotent.
    pub async fn register(&self, req: RegisterRequest, now: i64) -> Result<Device> {
        check_drift(req.timestamp, now, self.config.register_max_drift_secs)?;

        let public_key = crypto::parse_public_key(&req.public_key)?;
        let signature = crypto::parse_signature(&req.signature)?;
        let message = crypto::registration_message(&req.public_key, req.timestamp, &req.nonce);
        if !crypto::verify(&public_key, message.as_bytes(), &signature) {
            return Err(Error::Auth("registration signature invalid".to_string()));
        }

        self.pool
            .transaction(move |tx| {
                if let Some(device) = device_by_public_key_tx(tx, &req.public_key)? {
                    return Ok(device);
                }

                let account_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO accounts (id, created_at) VALUES (?1, ?2)",
                    params![account_id, now],
                )
                .map_err(Error::Sqlite)?;

                let device = Device {
                    id: Uuid::new_v4().to_string(),
                    account_id,
                    public_key: req.public_key.clone(),
                    fingerprint: req.fingerprint.clone(),
                    region: req.region.clone(),
                    asn: req.asn.clone(),
                    risk_score: 0,
                    created_at: now,
                };
                tx.execute(
                    "INSERT INTO devices
                     (id, account_id, public_key, fingerprint, region, asn, risk_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        device.id,
                        device.account_id,
                        device.public_key,
                        device.fingerprint,
                        device.region,
                        device.asn,
                        device.risk_score as i64,
                        device.created_at,
                    ],
                )
                .map_err(Error::Sqlite)?;

                log::info!("registered device {} for account {}", device.id, device.account_id);
                Ok(device)
            })
            .await
    }

    /// Process one heartbeat ping.
    pub async fn handle(&self, req: HeartbeatRequest, now: i64) -> Result<HeartbeatOutcome> {
        check_drift(req.timestamp, now, self.config.max_drift_secs)?;

        let public_key = crypto::parse_public_key(&req.public_key)?;
        let device = self
            .device_by_public_key(&req.public_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", req.public_key)))?;

        let message =
            crypto::heartbeat_message(&req.public_key, req.timestamp, &req.nonce, req.latency_ms);
        // A malformed signature verifies as bad rather than erroring: the
        // minute is still recorded, it just earns nothing.
        let signature_ok = match crypto::parse_signature(&req.signature) {
            Ok(signature) => crypto::verify(&public_key, message.as_bytes(), &signature),
            Err(_) => false,
        };

        let minute_bucket = req.timestamp - req.timestamp.rem_euclid(60);

        let device_id = device.id.clone();
        let latency_ms = req.latency_ms;
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO heartbeats (device_id, minute_bucket, latency_ms, signature_ok)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(device_id, minute_bucket) DO UPDATE SET
                         latency_ms = excluded.latency_ms,
                         signature_ok = excluded.signature_ok",
                    params![device_id, minute_bucket, latency_ms, signature_ok],
                )
                .map_err(Error::Sqlite)?;
                Ok(())
            })
            .await?;

        let awarded = if signature_ok {
            let outcome = self
                .ledger
                .award(AwardRequest {
                    account_id: device.account_id.clone(),
                    device_id: Some(device.id.clone()),
                    earn_type: EarnType::Uptime,
                    amount: self.config.uptime_points_per_minute,
                    source: "heartbeat".to_string(),
                    rule_version: 0,
                    dedupe_key: format!("{}:UPTIME_MINUTE:{}", device.id, minute_bucket),
                    occurred_at: minute_bucket,
                    meta: None,
                })
                .await?;
            outcome.credited
        } else {
            log::warn!("heartbeat signature invalid for device {}", device.id);
            0
        };

        Ok(HeartbeatOutcome {
            signature_ok,
            awarded,
            minute_bucket,
        })
    }

    pub async fn device_by_public_key(&self, public_key: &str) -> Result<Option<Device>> {
        let public_key = public_key.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT id, account_id, public_key, fingerprint, region, asn,
                            risk_score, created_at
                     FROM devices WHERE public_key = ?1",
                    params![public_key],
                    |row| Device::from_row(row),
                )
                .optional()
                .map_err(Error::Sqlite)
            })
            .await
    }

    pub async fn device_by_id(&self, device_id: &str) -> Result<Option<Device>> {
        let device_id = device_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT id, account_id, public_key, fingerprint, region, asn,
                            risk_score, created_at
                     FROM devices WHERE id = ?1",
                    params![device_id],
                    |row| Device::from_row(row),
                )
                .optional()
                .map_err(Error::Sqlite)
            })
            .await
    }

    /// Update a device's risk score (fed by an external risk engine).
    pub async fn set_device_risk(&self, device_id: &str, risk_score: u8) -> Result<()> {
        let device_id = device_id.to_string();
        self.pool
            .with_connection(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE devices SET risk_score = ?1 WHERE id = ?2",
                        params![risk_score as i64, device_id],
                    )
                    .map_err(Error::Sqlite)?;
                if updated == 0 {
                    return Err(Error::NotFound(format!("device {}", device_id)));
                }
                Ok(())
            })
            .await
    }
}

fn device_by_public_key_tx(
    tx: &rusqlite::Transaction,
    public_key: &str,
) -> Result<Option<Device>> {
    tx.query_row(
        "SELECT id, account_id, public_key, fingerprint, region, asn, risk_score, created_at
         FROM devices WHERE public_key = ?1",
        params![public_key],
        |row| Device::from_row(row),
    )
    .optional()
    .map_err(Error::Sqlite)
}

fn check_drift(timestamp: i64, now: i64, max_drift_secs: i64) -> Result<()> {
    if (now - timestamp).abs() > max_drift_secs {
        return Err(Error::InvalidTimestamp(format!(
            "timestamp {} outside ±{}s of server time {}",
            timestamp, max_drift_secs, now
        )));
    }
    Ok(())
}
