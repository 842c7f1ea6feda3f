//! Dev-only traffic simulator
//!
//! Drives the same core paths real devices hit: registration, signed
//! heartbeats (including deliberately skewed and corrupted ones), and
//! quality probes. All state lives on the `Simulator` instance, so tests
//! and CLI runs are isolated and can run in parallel.

use crate::crypto::DeviceKeypair;
use crate::error::Result;
use crate::heartbeat::{HeartbeatRequest, HeartbeatVerifier, RegisterRequest};
use crate::rollup::RollupAggregator;
use crate::storage::models::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Counters across a simulation run.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    pub heartbeats_accepted: u64,
    pub heartbeats_rejected: u64,
    pub signature_failures: u64,
    pub points_awarded: i64,
    pub probes_recorded: u64,
}

struct SimDevice {
    keypair: DeviceKeypair,
    device: Device,
}

/// Deterministic (seeded) load generator over the core components.
pub struct Simulator {
    verifier: HeartbeatVerifier,
    aggregator: RollupAggregator,
    rng: StdRng,
    devices: Vec<SimDevice>,
    pub stats: SimStats,
}

impl Simulator {
    pub fn new(verifier: HeartbeatVerifier, aggregator: RollupAggregator, seed: u64) -> Self {
        Self {
            verifier,
            aggregator,
            rng: StdRng::seed_from_u64(seed),
            devices: Vec::new(),
            stats: SimStats::default(),
        }
    }

    /// Register `count` fresh devices at time `now`.
    pub async fn provision(&mut self, count: usize, now: i64) -> Result<()> {
        for _ in 0..count {
            let keypair = DeviceKeypair::generate();
            let public_key = keypair.public_key_hex();
            let nonce = format!("sim-{:08x}", self.rng.gen::<u32>());
            let message = crate::crypto::registration_message(&public_key, now, &nonce);
            let signature = hex::encode(keypair.sign(message.as_bytes()).to_bytes());

            let device = self
                .verifier
                .register(
                    RegisterRequest {
                        public_key,
                        fingerprint: Some(format!("sim-fp-{:04x}", self.rng.gen::<u16>())),
                        region: None,
                        asn: None,
                        timestamp: now,
                        nonce,
                        signature,
                    },
                    now,
                )
                .await?;
            self.devices.push(SimDevice { keypair, device });
        }
        Ok(())
    }

    /// One simulated minute: every device heartbeats, a few misbehave,
    /// and the occasional probe lands.
    pub async fn tick(&mut self, now: i64) -> Result<()> {
        for i in 0..self.devices.len() {
            let nonce = format!("hb-{:08x}", self.rng.gen::<u32>());
            let latency_ms = Some(self.rng.gen_range(5..250));
            let misbehavior = self.rng.gen_range(0..100);

            // ~5% arrive outside the drift window, ~5% carry a bad signature.
            let timestamp = if misbehavior < 5 { now - 600 } else { now };
            let sim_device = &self.devices[i];
            let public_key = sim_device.keypair.public_key_hex();
            let message = crate::crypto::heartbeat_message(&public_key, timestamp, &nonce, latency_ms);
            let mut signature = hex::encode(sim_device.keypair.sign(message.as_bytes()).to_bytes());
            if (5..10).contains(&misbehavior) {
                signature = hex::encode([0u8; 64]);
            }

            let outcome = self
                .verifier
                .handle(
                    HeartbeatRequest {
                        public_key,
                        timestamp,
                        nonce,
                        latency_ms,
                        signature,
                    },
                    now,
                )
                .await;
            match outcome {
                Ok(outcome) if outcome.signature_ok => {
                    self.stats.heartbeats_accepted += 1;
                    self.stats.points_awarded += outcome.awarded;
                }
                Ok(_) => self.stats.signature_failures += 1,
                Err(_) => self.stats.heartbeats_rejected += 1,
            }

            if self.rng.gen_range(0..100) < 10 {
                let device_id = self.devices[i].device.id.clone();
                let download = self.rng.gen_range(10.0..200.0);
                let upload = self.rng.gen_range(2.0..40.0);
                self.aggregator
                    .record_probe(&device_id, download, upload, latency_ms, true, now)
                    .await?;
                self.stats.probes_recorded += 1;
            }
        }
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, HeartbeatConfig};
    use crate::ledger::LedgerWriter;
    use crate::rules::RewardRule;
    use crate::storage::DatabasePool;

    #[tokio::test]
    async fn test_simulator_is_isolated_and_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("sim.db").to_str().unwrap().to_string(),
            ..DatabaseConfig::default()
        };
        let pool = DatabasePool::new(config).await.unwrap();
        let ledger = LedgerWriter::new(pool.clone(), 100_000);
        let verifier =
            HeartbeatVerifier::new(pool.clone(), ledger.clone(), HeartbeatConfig::default());
        let aggregator = RollupAggregator::new(pool, ledger, RewardRule::default());

        let mut sim = Simulator::new(verifier, aggregator, 7);
        let base = 1_700_000_000;
        sim.provision(3, base).await.unwrap();
        assert_eq!(sim.device_count(), 3);

        for i in 0..5 {
            sim.tick(base + i * 60).await.unwrap();
        }

        let total = sim.stats.heartbeats_accepted
            + sim.stats.signature_failures
            + sim.stats.heartbeats_rejected;
        assert_eq!(total, 15);
        assert!(sim.stats.points_awarded > 0);
    }
}
