//! End-to-end aggregation flow: heartbeats and probes in, hourly and
//! daily rollups out, reward pass on top. Exercises re-run idempotency
//! and the conservation property between raw ledger events and rollup
//! rows.

mod common;

use bandpoints::crypto::{self, DeviceKeypair};
use bandpoints::heartbeat::{HeartbeatRequest, RegisterRequest};
use bandpoints::storage::models::{AccountRef, RollupGranularity};
use bandpoints::{CoreContext, Error};
use std::collections::HashMap;
use std::sync::Arc;

// Hour-aligned window inside a known UTC day.
const HOUR_START: i64 = 1_699_999_200;
const NOW: i64 = HOUR_START + 4_000;

async fn register_device(ctx: &Arc<CoreContext>, keypair: &DeviceKeypair) -> bandpoints::Device {
    let public_key = keypair.public_key_hex();
    let message = crypto::registration_message(&public_key, HOUR_START, "reg");
    ctx.heartbeat
        .register(
            RegisterRequest {
                public_key,
                fingerprint: None,
                region: None,
                asn: None,
                timestamp: HOUR_START,
                nonce: "reg".to_string(),
                signature: hex::encode(keypair.sign(message.as_bytes()).to_bytes()),
            },
            HOUR_START,
        )
        .await
        .unwrap()
}

async fn send_heartbeat(ctx: &Arc<CoreContext>, keypair: &DeviceKeypair, timestamp: i64) {
    let public_key = keypair.public_key_hex();
    let nonce = format!("n-{}", timestamp);
    let message = crypto::heartbeat_message(&public_key, timestamp, &nonce, Some(20));
    let outcome = ctx
        .heartbeat
        .handle(
            HeartbeatRequest {
                public_key,
                timestamp,
                nonce,
                latency_ms: Some(20),
                signature: hex::encode(keypair.sign(message.as_bytes()).to_bytes()),
            },
            timestamp,
        )
        .await
        .unwrap();
    assert!(outcome.signature_ok);
}

#[tokio::test]
async fn test_rollup_flow_conservation_and_idempotency() {
    let (_dir, ctx) = common::test_context().await;

    let keypair_a = DeviceKeypair::generate();
    let keypair_b = DeviceKeypair::generate();
    let device_a = register_device(&ctx, &keypair_a).await;
    let device_b = register_device(&ctx, &keypair_b).await;

    // Account A is up half the hour, account B the full hour.
    for i in 0..30 {
        send_heartbeat(&ctx, &keypair_a, HOUR_START + i * 60).await;
    }
    for i in 0..60 {
        send_heartbeat(&ctx, &keypair_b, HOUR_START + i * 60).await;
    }

    ctx.aggregator
        .record_probe(&device_a.id, 50.0, 10.0, Some(30), true, HOUR_START + 100)
        .await
        .unwrap();
    ctx.aggregator
        .record_probe(&device_b.id, 100.0, 10.0, Some(30), true, HOUR_START + 200)
        .await
        .unwrap();
    ctx.aggregator
        .record_probe(&device_b.id, 200.0, 10.0, Some(30), true, HOUR_START + 300)
        .await
        .unwrap();

    let report = ctx
        .aggregator
        .run(RollupGranularity::Hour, HOUR_START, NOW)
        .await
        .unwrap();
    assert_eq!(report.accounts_processed, 2);

    let first = ctx
        .aggregator
        .window_rows(RollupGranularity::Hour, HOUR_START)
        .await
        .unwrap();

    // Re-running the same window with the same inputs changes nothing.
    ctx.aggregator
        .run(RollupGranularity::Hour, HOUR_START, NOW)
        .await
        .unwrap();
    let second = ctx
        .aggregator
        .window_rows(RollupGranularity::Hour, HOUR_START)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );

    let by_account: HashMap<String, _> = first
        .iter()
        .map(|row| (row.account.as_str().to_string(), row.clone()))
        .collect();

    let row_a = &by_account[&device_a.account_id];
    assert_eq!(row_a.points_earned, 30);
    assert!((row_a.uptime_pct - 50.0).abs() < 1e-9);
    assert!((row_a.avg_download_mbps - 50.0).abs() < 1e-9);
    assert_eq!(row_a.devices_seen, 1);

    let row_b = &by_account[&device_b.account_id];
    assert_eq!(row_b.points_earned, 60);
    assert!((row_b.uptime_pct - 100.0).abs() < 1e-9);
    assert!((row_b.avg_download_mbps - 150.0).abs() < 1e-9);

    // The system row is the cross-account total.
    let system = first.iter().find(|row| row.account.is_system()).unwrap();
    assert_eq!(system.account, AccountRef::System);
    assert_eq!(
        system.points_earned,
        row_a.points_earned + row_b.points_earned
    );
    assert!((system.uptime_pct - 75.0).abs() < 1e-9);
    assert!((system.avg_download_mbps - 100.0).abs() < 1e-9);
    assert_eq!(system.devices_seen, 2);

    // Conservation against the raw ledger.
    let earned: Vec<(String, i64)> = ctx
        .pool
        .with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT account_id, SUM(amount) FROM ledger_events
                     WHERE occurred_at >= ?1 AND occurred_at < ?2 AND amount > 0
                     GROUP BY account_id ORDER BY account_id",
                )
                .map_err(Error::Sqlite)?;
            let rows = stmt
                .query_map([HOUR_START, HOUR_START + 3600], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(Error::Sqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::Sqlite)?;
            Ok(rows)
        })
        .await
        .unwrap();
    for (account_id, amount) in earned {
        assert_eq!(by_account[&account_id].points_earned, amount);
    }
}

#[tokio::test]
async fn test_reward_pass_and_daily_rollup() {
    let (_dir, ctx) = common::test_context().await;

    let keypair_a = DeviceKeypair::generate();
    let keypair_b = DeviceKeypair::generate();
    let device_a = register_device(&ctx, &keypair_a).await;
    let device_b = register_device(&ctx, &keypair_b).await;

    for i in 0..30 {
        send_heartbeat(&ctx, &keypair_a, HOUR_START + i * 60).await;
    }
    for i in 0..60 {
        send_heartbeat(&ctx, &keypair_b, HOUR_START + i * 60).await;
    }
    ctx.aggregator
        .record_probe(&device_a.id, 50.0, 10.0, None, true, HOUR_START + 100)
        .await
        .unwrap();
    ctx.aggregator
        .record_probe(&device_b.id, 150.0, 10.0, None, true, HOUR_START + 200)
        .await
        .unwrap();

    ctx.aggregator
        .run(RollupGranularity::Hour, HOUR_START, NOW)
        .await
        .unwrap();

    // First pass credits both accounts; replaying it credits nobody.
    let credited = ctx.aggregator.distribute_rewards(HOUR_START).await.unwrap();
    assert_eq!(credited, 2);
    let replay = ctx.aggregator.distribute_rewards(HOUR_START).await.unwrap();
    assert_eq!(replay, 0);

    // uptime 50% and 50 Mbps: floor(60 * 40/90 * 45/95) = 12 bonus points.
    let balance_a = ctx.ledger.get_balance(&device_a.account_id).await.unwrap();
    assert_eq!(balance_a.points, 30 + 12);
    // Full uptime and saturated bandwidth earn the full hourly base.
    let balance_b = ctx.ledger.get_balance(&device_b.account_id).await.unwrap();
    assert_eq!(balance_b.points, 60 + 60);

    // The daily rollup picks up uptime credits and the reward bonus.
    let day_start = RollupGranularity::Day.window_start(HOUR_START);
    ctx.aggregator
        .run(RollupGranularity::Day, day_start, NOW)
        .await
        .unwrap();
    let day_rows = ctx
        .aggregator
        .window_rows(RollupGranularity::Day, day_start)
        .await
        .unwrap();
    let day_by_account: HashMap<String, i64> = day_rows
        .iter()
        .map(|row| (row.account.as_str().to_string(), row.points_earned))
        .collect();
    assert_eq!(day_by_account[&device_a.account_id], 42);
    assert_eq!(day_by_account[&device_b.account_id], 120);
    assert_eq!(day_by_account["system"], 162);
}

#[tokio::test]
async fn test_risk_frozen_account_earns_no_reward() {
    let (_dir, ctx) = common::test_context().await;

    let keypair = DeviceKeypair::generate();
    let device = register_device(&ctx, &keypair).await;
    for i in 0..60 {
        send_heartbeat(&ctx, &keypair, HOUR_START + i * 60).await;
    }
    ctx.aggregator
        .record_probe(&device.id, 100.0, 10.0, None, true, HOUR_START + 100)
        .await
        .unwrap();

    ctx.heartbeat.set_device_risk(&device.id, 10).await.unwrap();

    ctx.aggregator
        .run(RollupGranularity::Hour, HOUR_START, NOW)
        .await
        .unwrap();
    let credited = ctx.aggregator.distribute_rewards(HOUR_START).await.unwrap();
    assert_eq!(credited, 0);

    // Uptime credits stand, the quality bonus does not.
    let balance = ctx.ledger.get_balance(&device.account_id).await.unwrap();
    assert_eq!(balance.points, 60);
}
