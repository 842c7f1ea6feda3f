//! Ledger invariants under concurrent callers: exactly-once application
//! per dedupe key, daily-cap enforcement, and conversion conservation.

mod common;

use bandpoints::{AwardRequest, EarnType, Error};

const NOW: i64 = 1_700_000_000;

fn request(account: &str, earn_type: EarnType, dedupe: &str, amount: i64) -> AwardRequest {
    AwardRequest {
        account_id: account.to_string(),
        device_id: None,
        earn_type,
        amount,
        source: "test".to_string(),
        rule_version: 1,
        dedupe_key: dedupe.to_string(),
        occurred_at: NOW,
        meta: None,
    }
}

#[tokio::test]
async fn test_concurrent_duplicate_dedupe_applies_once() {
    let (_dir, ctx) = common::test_context().await;
    ctx.ledger.ensure_account("acct-1", 0).await.unwrap();

    let writer_a = ctx.ledger.clone();
    let writer_b = ctx.ledger.clone();
    let (a, b) = tokio::join!(
        writer_a.award(request("acct-1", EarnType::Reward, "same-key", 100)),
        writer_b.award(request("acct-1", EarnType::Reward, "same-key", 100)),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one of the two landed.
    assert_eq!(a.duplicate as u8 + b.duplicate as u8, 1);
    assert_eq!(a.credited + b.credited, 100);

    let balance = ctx.ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.points, 100);

    let events: i64 = ctx
        .pool
        .with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM ledger_events WHERE dedupe_key = 'same-key'",
                [],
                |row| row.get(0),
            )
            .map_err(Error::Sqlite)
        })
        .await
        .unwrap();
    assert_eq!(events, 1);
}

#[tokio::test]
async fn test_concurrent_earns_never_exceed_daily_cap() {
    let (_dir, ctx) = common::test_context_with(|config| {
        config.caps.daily_cap = 100;
    })
    .await;
    ctx.ledger.ensure_account("acct-1", 0).await.unwrap();

    // Two 80-point requests against a 100-point cap, concurrently.
    let writer_a = ctx.ledger.clone();
    let writer_b = ctx.ledger.clone();
    let (a, b) = tokio::join!(
        writer_a.award(request("acct-1", EarnType::Reward, "k1", 80)),
        writer_b.award(request("acct-1", EarnType::Referral, "k2", 80)),
    );

    let credited: i64 = [a, b]
        .into_iter()
        .map(|outcome| outcome.map(|o| o.credited).unwrap_or(0))
        .sum();
    assert!(credited <= 100);
    assert_eq!(credited, 100);

    let balance = ctx.ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.points, 100);
}

#[tokio::test]
async fn test_concurrent_conversions_cannot_overdraw() {
    let (_dir, ctx) = common::test_context().await;
    ctx.ledger.ensure_account("acct-1", 0).await.unwrap();
    ctx.ledger
        .award(request("acct-1", EarnType::Reward, "seed", 100))
        .await
        .unwrap();

    let engine_a = ctx.conversion.clone();
    let engine_b = ctx.conversion.clone();
    let (a, b) = tokio::join!(
        engine_a.convert("acct-1", 80, NOW),
        engine_b.convert("acct-1", 80, NOW),
    );

    // One settles, the other bounces off the sufficiency check.
    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(failure, Error::InsufficientPoints { .. }));

    let balance = ctx.ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.points, 20);
    assert_eq!(balance.token_units, 800); // 80 / 1000 = 0.0800 tokens
}

#[tokio::test]
async fn test_retry_after_storage_noise_is_idempotent() {
    let (_dir, ctx) = common::test_context().await;
    ctx.ledger.ensure_account("acct-1", 0).await.unwrap();

    // A client retry loop replays the same dedupe key several times.
    for _ in 0..5 {
        let outcome = ctx
            .ledger
            .award(request("acct-1", EarnType::Bonus, "retry-key", 40))
            .await
            .unwrap();
        assert!(outcome.accepted);
    }

    let balance = ctx.ledger.get_balance("acct-1").await.unwrap();
    assert_eq!(balance.points, 40);
}
