//! Conversion settlement
//!
//! Debits points and credits tokens in one transaction: the sufficiency
//! check, the balance mutation, and the ledger debit event commit together
//! or not at all, so concurrent conversions cannot overdraw an account.
//! A runtime switch gates the whole path.

use crate::error::{Error, Result};
use crate::ledger::{apply_balance_delta, read_balance};
use crate::storage::models::{validate_account_id, Balance};
use crate::storage::DatabasePool;
use rusqlite::params;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Ledger event type for conversion debits.
pub const CONVERT_EVENT_TYPE: &str = "convert";

const TOKEN_SCALE: u32 = 4;

/// Result of a settled conversion.
#[derive(Debug, Clone)]
pub struct ConversionReceipt {
    pub points_spent: i64,
    pub token_received: Decimal,
    pub rate: i64,
    pub balance: Balance,
}

/// Settles point-to-token conversions.
#[derive(Clone)]
pub struct ConversionEngine {
    pool: DatabasePool,
    rate: i64,
    min_points: i64,
    enabled: Arc<AtomicBool>,
}

impl ConversionEngine {
    pub fn new(pool: DatabasePool, config: &crate::config::ConversionConfig) -> Self {
        Self {
            pool,
            rate: config.rate,
            min_points: config.min_points,
            enabled: Arc::new(AtomicBool::new(config.enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn rate(&self) -> i64 {
        self.rate
    }

    /// Convert `points` into tokens at the configured rate, rounded to
    /// 4 decimals.
    pub async fn convert(
        &self,
        account_id: &str,
        points: i64,
        now: i64,
    ) -> Result<ConversionReceipt> {
        if !self.is_enabled() {
            return Err(Error::ConversionDisabled);
        }
        validate_account_id(account_id)?;
        if points < self.min_points {
            return Err(Error::Validation(format!(
                "conversion requires at least {} points",
                self.min_points
            )));
        }

        let token_received = (Decimal::from(points) / Decimal::from(self.rate))
            .round_dp_with_strategy(TOKEN_SCALE, RoundingStrategy::MidpointAwayFromZero);
        let token_units = (token_received * Decimal::from(10_i64.pow(TOKEN_SCALE)))
            .to_i64()
            .ok_or_else(|| Error::Internal("token amount out of range".to_string()))?;

        let account_id = account_id.to_string();
        let rate = self.rate;
        let balance = self
            .pool
            .transaction(move |tx| {
                let balance = read_balance(tx, &account_id)?;
                if balance.points < points {
                    return Err(Error::InsufficientPoints {
                        have: balance.points,
                        want: points,
                    });
                }

                apply_balance_delta(tx, &account_id, -points, token_units, now)?;

                let meta = serde_json::json!({
                    "rate": rate,
                    "token_units": token_units,
                });
                tx.execute(
                    "INSERT INTO ledger_events
                     (id, account_id, device_id, event_type, amount, source,
                      rule_version, dedupe_key, occurred_at, meta)
                     VALUES (?1, ?2, NULL, ?3, ?4, 'conversion', 0, ?5, ?6, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        account_id,
                        CONVERT_EVENT_TYPE,
                        -points,
                        format!("{}:CONVERT:{}", account_id, Uuid::new_v4()),
                        now,
                        meta.to_string(),
                    ],
                )
                .map_err(Error::Sqlite)?;

                read_balance(tx, &account_id)
            })
            .await?;

        log::info!(
            "convert: account={} points={} tokens={}",
            balance.account_id,
            points,
            token_received
        );

        Ok(ConversionReceipt {
            points_spent: points,
            token_received,
            rate: self.rate,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConversionConfig, DatabaseConfig};
    use crate::ledger::{AwardRequest, EarnType, LedgerWriter};
    use rust_decimal_macros::dec;

    async fn setup() -> (tempfile::TempDir, DatabasePool, LedgerWriter) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("convert.db").to_str().unwrap().to_string(),
            ..DatabaseConfig::default()
        };
        let pool = DatabasePool::new(config).await.unwrap();
        let writer = LedgerWriter::new(pool.clone(), 100_000);
        writer.ensure_account("acct-1", 0).await.unwrap();
        writer
            .award(AwardRequest {
                account_id: "acct-1".to_string(),
                device_id: None,
                earn_type: EarnType::Reward,
                amount: 5_000,
                source: "test".to_string(),
                rule_version: 1,
                dedupe_key: "seed".to_string(),
                occurred_at: 1_700_000_000,
                meta: None,
            })
            .await
            .unwrap();
        (dir, pool, writer)
    }

    fn engine(pool: DatabasePool, enabled: bool) -> ConversionEngine {
        ConversionEngine::new(
            pool,
            &ConversionConfig {
                enabled,
                rate: 1_000,
                min_points: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_conversion_conserves_balance() {
        let (_dir, pool, writer) = setup().await;
        let engine = engine(pool, true);

        let receipt = engine.convert("acct-1", 2_500, 1_700_000_100).await.unwrap();
        assert_eq!(receipt.points_spent, 2_500);
        assert_eq!(receipt.token_received, dec!(2.5000));
        assert_eq!(receipt.balance.points, 2_500);
        assert_eq!(receipt.balance.token_units, 25_000);

        // The debit landed in the ledger too.
        let balance = writer.get_balance("acct-1").await.unwrap();
        assert_eq!(balance.points, 2_500);
    }

    #[tokio::test]
    async fn test_rounding_to_four_decimals() {
        let (_dir, pool, _writer) = setup().await;
        let engine = ConversionEngine::new(
            pool,
            &ConversionConfig {
                enabled: true,
                rate: 3_000,
                min_points: 1,
            },
        );

        let receipt = engine.convert("acct-1", 1, 1_700_000_100).await.unwrap();
        // 1/3000 = 0.000333.. rounds to 0.0003
        assert_eq!(receipt.token_received, dec!(0.0003));
        assert_eq!(receipt.balance.token_units, 3);
    }

    #[tokio::test]
    async fn test_insufficient_points_rejected() {
        let (_dir, pool, _writer) = setup().await;
        let engine = engine(pool, true);

        let err = engine.convert("acct-1", 10_000, 1_700_000_100).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPoints { have: 5_000, want: 10_000 }
        ));
    }

    #[tokio::test]
    async fn test_disabled_switch() {
        let (_dir, pool, _writer) = setup().await;
        let engine = engine(pool, false);

        let err = engine.convert("acct-1", 100, 1_700_000_100).await.unwrap_err();
        assert!(matches!(err, Error::ConversionDisabled));

        engine.set_enabled(true);
        assert!(engine.convert("acct-1", 100, 1_700_000_100).await.is_ok());
    }
}
