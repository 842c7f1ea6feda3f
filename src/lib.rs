//! bandpoints - points ledger, reward scoring, and rollup aggregation
//! for bandwidth-sharing nodes
//!
//! Devices prove liveness with signed per-minute heartbeats and earn
//! points that later convert to tokens. The crate is organized around a
//! single choke-point for balance mutations:
//! - crypto: device identities and signed liveness proofs
//! - storage: the SQLite-backed ledger store
//! - ledger: the idempotent writer every credit and debit flows through
//! - rules: pure reward scoring over rollup signals
//! - rollup: hourly/daily aggregation plus the reward pass
//! - convert: point-to-token settlement
//! - api: the HTTP surface the UI/ops layer consumes

pub mod api;
pub mod config;
pub mod convert;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod ledger;
pub mod rollup;
pub mod rules;
pub mod sim;
pub mod storage;

// Re-export commonly used types for easy access
pub use config::Config;
pub use convert::{ConversionEngine, ConversionReceipt};
pub use crypto::DeviceKeypair;
pub use error::{Error, Result};
pub use heartbeat::{HeartbeatOutcome, HeartbeatRequest, HeartbeatVerifier, RegisterRequest};
pub use ledger::{AwardOutcome, AwardRequest, EarnType, LedgerWriter};
pub use rollup::{RollupAggregator, RollupReport};
pub use rules::{score, RewardRule, Score, ScoreInput};
pub use storage::models::{AccountRef, Balance, Device, RollupGranularity};
pub use storage::DatabasePool;

use std::sync::Arc;

/// Everything a handler needs, built once at startup and passed around
/// explicitly. No module-level state.
pub struct CoreContext {
    pub config: Config,
    pub pool: DatabasePool,
    pub ledger: LedgerWriter,
    pub heartbeat: HeartbeatVerifier,
    pub conversion: ConversionEngine,
    pub aggregator: RollupAggregator,
}

impl CoreContext {
    /// Validate config, open the database, and wire the components.
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = DatabasePool::new(config.database.clone()).await?;
        let ledger = LedgerWriter::new(pool.clone(), config.caps.daily_cap);
        let heartbeat =
            HeartbeatVerifier::new(pool.clone(), ledger.clone(), config.heartbeat.clone());
        let conversion = ConversionEngine::new(pool.clone(), &config.conversion);
        let aggregator = RollupAggregator::new(pool.clone(), ledger.clone(), config.reward.clone());

        Ok(Arc::new(Self {
            config,
            pool,
            ledger,
            heartbeat,
            conversion,
            aggregator,
        }))
    }
}
