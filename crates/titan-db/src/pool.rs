//! # SQLite Pool for the Fiscal Worker
//!
//! Opens the store shared by the POS and the fiscal worker and hands out
//! repositories over one `SqlitePool`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  [database] section ──► DbConfig ──► Database::new                    │
//! │                                          │                           │
//! │                     open (WAL, FK on, busy wait)                     │
//! │                                          │                           │
//! │                          migrate (001 sales .. 003 receipts)         │
//! │                                          │                           │
//! │            ┌─────────────────────────────┼──────────────────────┐    │
//! │            ▼                             ▼                      ▼    │
//! │     SaleRepository          FiscalQueueRepository   FiscalReceiptRepository
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two worker invocations may overlap when the scheduler fires while a slow
//! batch is still running. Both write the same file, so every connection
//! waits on a locked database for `busy_timeout` instead of failing at once;
//! the queue claim itself is a single conditional UPDATE.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::fiscal_queue::FiscalQueueRepository;
use crate::repository::fiscal_receipt::FiscalReceiptRepository;
use crate::repository::sale::SaleRepository;

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// How to open the fiscal store.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/titan/fiscal.db")
///     .max_connections(4)
///     .busy_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// A batch is sequential, so a handful of connections is plenty.
    /// Default: 4
    pub max_connections: u32,

    pub min_connections: u32,

    /// How long to wait for a free pooled connection. Default: 30 s
    pub acquire_timeout: Duration,

    /// How long a statement waits on a database locked by another
    /// writer (the POS or an overlapping batch). Default: 5 s
    pub busy_timeout: Duration,

    pub idle_timeout: Option<Duration>,

    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
            run_migrations: true,
        }
    }

    /// A private in-memory database, used by tests.
    ///
    /// Pinned to one connection that never expires: SQLite drops an
    /// in-memory database together with its last connection.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(1),
            idle_timeout: None,
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        Ok(options.foreign_keys(true).busy_timeout(self.busy_timeout))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the fiscal store. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, applies pending migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let in_memory = config.is_in_memory();
        info!(
            path = %config.database_path.display(),
            in_memory,
            max_connections = config.max_connections,
            "Opening fiscal store"
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        } else {
            debug!("Skipping migrations");
        }

        Ok(db)
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sales(&self) -> SaleRepository {
        SaleRepository::new(self.pool.clone())
    }

    pub fn fiscal_queue(&self) -> FiscalQueueRepository {
        FiscalQueueRepository::new(self.pool.clone())
    }

    pub fn fiscal_receipts(&self) -> FiscalReceiptRepository {
        FiscalReceiptRepository::new(self.pool.clone())
    }

    /// Waits for in-flight statements, then closes every connection.
    pub async fn close(&self) {
        debug!(open = self.pool.size(), "Closing fiscal store");
        self.pool.close().await;
    }

    /// `true` when a trivial query round-trips. Used by `health`.
    pub async fn health_check(&self) -> bool {
        match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Fiscal store health check failed");
                false
            }
        }
    }
}
