//! Database management with transaction support
//!
//! Features:
//! - Atomic transactions with automatic rollback
//! - WAL mode for better concurrency
//! - Connection pooling
//! - Schema initialization with the uniqueness constraints the ledger
//!   relies on for idempotency

pub mod models;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Database connection pool
pub struct DatabasePool {
    connections: Arc<RwLock<Vec<DatabaseConnection>>>,
    config: DatabaseConfig,
}

/// Managed database connection
///
/// The connection is wrapped in a `Mutex` purely to satisfy `Sync` (a bare
/// `rusqlite::Connection` is `Send` but not `Sync`). Access is already
/// serialized by the pool's outer `RwLock` write guard, so this inner lock
/// is always uncontended.
struct DatabaseConnection {
    conn: Mutex<Connection>,
    in_use: bool,
    last_used: Instant,
    transaction_count: u64,
}

impl DatabasePool {
    /// Create a new database pool and initialize the schema
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if config.url != ":memory:" {
            if let Some(parent) = Path::new(&config.url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(Error::Io)?;
                }
            }
        }

        // First connection sets up the schema
        let setup_conn = Self::create_connection(&config)?;
        Self::initialize_schema(&setup_conn)?;

        let mut connections = Vec::with_capacity(config.max_connections as usize);
        connections.push(DatabaseConnection {
            conn: Mutex::new(setup_conn),
            in_use: false,
            last_used: Instant::now(),
            transaction_count: 0,
        });

        Ok(Self {
            connections: Arc::new(RwLock::new(connections)),
            config,
        })
    }

    /// Create a new database connection with optimal settings
    fn create_connection(config: &DatabaseConfig) -> Result<Connection> {
        let conn = Connection::open(&config.url)
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        if config.enable_wal && config.url != ":memory:" {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| Error::Database(format!("Failed to enable WAL: {}", e)))?;
        }

        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| Error::Database(format!("Failed to set synchronous: {}", e)))?;

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| Error::Database(format!("Failed to enable foreign keys: {}", e)))?;

        conn.busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .map_err(|e| Error::Database(format!("Failed to set busy timeout: {}", e)))?;

        Ok(conn)
    }

    /// Execute a database operation with a connection from the pool
    pub async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.connection_timeout_secs);

        loop {
            {
                let mut connections = self.connections.write().await;

                if let Some(entry) = connections.iter_mut().find(|c| !c.in_use) {
                    entry.in_use = true;
                    entry.last_used = Instant::now();
                    entry.transaction_count += 1;

                    let result = {
                        let mut conn = entry
                            .conn
                            .lock()
                            .expect("pool connection mutex poisoned");
                        f(&mut conn)
                    };
                    entry.in_use = false;
                    return result;
                }

                if connections.len() < self.config.max_connections as usize {
                    match Self::create_connection(&self.config) {
                        Ok(conn) => {
                            connections.push(DatabaseConnection {
                                conn: Mutex::new(conn),
                                in_use: false,
                                last_used: Instant::now(),
                                transaction_count: 0,
                            });
                            continue;
                        }
                        Err(e) => {
                            log::warn!("Failed to create new connection: {}", e);
                        }
                    }
                }
            }

            if start.elapsed() > timeout {
                return Err(Error::Database("Connection pool timeout".to_string()));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Execute a write transaction with automatic rollback on error.
    /// Takes the write lock up front so read-then-write sequences inside
    /// the closure serialize against concurrent writers instead of
    /// failing on lock upgrade.
    pub async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R>,
    {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

            match f(&tx) {
                Ok(result) => {
                    tx.commit()
                        .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;
                    Ok(result)
                }
                // Transaction rolls back on drop
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Initialize database schema
    fn initialize_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balances (
                account_id TEXT PRIMARY KEY REFERENCES accounts(id),
                points INTEGER NOT NULL DEFAULT 0,
                token_units INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                public_key TEXT NOT NULL UNIQUE,
                fingerprint TEXT,
                region TEXT,
                asn TEXT,
                risk_score INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_events (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                device_id TEXT,
                event_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                source TEXT NOT NULL,
                rule_version INTEGER NOT NULL,
                dedupe_key TEXT NOT NULL UNIQUE,
                occurred_at INTEGER NOT NULL,
                meta TEXT
            );

            CREATE TABLE IF NOT EXISTS heartbeats (
                device_id TEXT NOT NULL REFERENCES devices(id),
                minute_bucket INTEGER NOT NULL,
                latency_ms INTEGER,
                signature_ok INTEGER NOT NULL,
                PRIMARY KEY (device_id, minute_bucket)
            );

            CREATE TABLE IF NOT EXISTS quality_probes (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL REFERENCES devices(id),
                started_at INTEGER NOT NULL,
                download_mbps REAL NOT NULL,
                upload_mbps REAL NOT NULL,
                latency_ms INTEGER,
                success INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rollups (
                granularity TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                points_earned INTEGER NOT NULL,
                uptime_pct REAL NOT NULL,
                avg_download_mbps REAL NOT NULL,
                devices_seen INTEGER NOT NULL,
                computed_at INTEGER NOT NULL,
                PRIMARY KEY (granularity, window_start, account_id)
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_account_time
                ON ledger_events(account_id, occurred_at);
            CREATE INDEX IF NOT EXISTS idx_ledger_account_type_time
                ON ledger_events(account_id, event_type, occurred_at);
            CREATE INDEX IF NOT EXISTS idx_heartbeats_minute
                ON heartbeats(minute_bucket);
            CREATE INDEX IF NOT EXISTS idx_probes_started
                ON quality_probes(started_at);",
        )
        .map_err(|e| Error::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Checkpoint the database (WAL mode)
    pub async fn checkpoint(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("PRAGMA wal_checkpoint(TRUNCATE)", [])
                .map_err(|e| Error::Database(format!("Checkpoint failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> DatabaseStats {
        let connections = self.connections.read().await;
        DatabaseStats {
            active_connections: connections.iter().filter(|c| c.in_use).count(),
            total_connections: connections.len(),
            total_transactions: connections.iter().map(|c| c.transaction_count).sum(),
        }
    }
}

impl Clone for DatabasePool {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            config: self.config.clone(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub active_connections: usize,
    pub total_connections: usize,
    pub total_transactions: u64,
}
