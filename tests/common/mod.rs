//! Shared test harness: isolated core contexts over temp databases.
#![allow(dead_code)]

use bandpoints::{Config, CoreContext};
use std::sync::Arc;
use tempfile::TempDir;

pub const API_KEY: &str = "test-api-key";
pub const CRON_KEY: &str = "test-cron-key";
pub const VERIFIER_KEY: &str = "test-verifier-key";

/// Build a context over a fresh temp database. Keep the TempDir alive for
/// the duration of the test.
#[allow(dead_code)]
pub async fn test_context() -> (TempDir, Arc<CoreContext>) {
    test_context_with(|_| {}).await
}

pub async fn test_context_with(tweak: impl FnOnce(&mut Config)) -> (TempDir, Arc<CoreContext>) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.database.url = dir
        .path()
        .join("bandpoints-test.db")
        .to_str()
        .unwrap()
        .to_string();
    config.auth.api_key = Some(API_KEY.to_string());
    config.auth.cron_key = Some(CRON_KEY.to_string());
    config.auth.verifier_key = Some(VERIFIER_KEY.to_string());
    tweak(&mut config);

    let ctx = CoreContext::init(config).await.unwrap();
    (dir, ctx)
}
