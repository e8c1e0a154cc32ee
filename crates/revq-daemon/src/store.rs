//! Transactional persistence over `SQLite`.
//!
//! The store is the single source of truth and the sole coordination medium
//! between workers. It provides:
//!
//! - the shared connection behind `Arc<Mutex<Connection>>`
//! - schema initialization for `jobs`, `work_queue`, `outbox`,
//!   `dead_letters`, and `audit`
//! - the **store clock**: a `now_ms()` SQL function registered on the
//!   connection, so every transactional time comparison uses the store's
//!   clock rather than a caller-supplied timestamp
//! - an immediate-mode transaction helper
//!
//! `SQLite` has no `SELECT ... FOR UPDATE SKIP LOCKED`; the equivalent mutual
//! exclusion is a conditional `UPDATE ... RETURNING` claim under the
//! single-writer lock plus owner predicates on every later mutation, which
//! makes a stolen lease a 0-rows no-op instead of a race.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// A row that must exist was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (`job`, `work item`, `dead letter`, ...).
        entity: &'static str,
        /// The id that failed to resolve.
        id: i64,
    },

    /// A persisted label failed to parse back into its domain type.
    #[error("corrupt row: {detail}")]
    CorruptRow {
        /// What failed to parse.
        detail: String,
    },
}

/// Convenience alias for store results.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        idempotency_key TEXT NOT NULL,
        changelist_id INTEGER NOT NULL,
        review_version INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'in_progress', 'succeeded', 'retryable_failed', 'failed')),
        result_ref TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency_key
        ON jobs(idempotency_key);
    CREATE INDEX IF NOT EXISTS idx_jobs_changelist
        ON jobs(changelist_id, review_version);

    CREATE TABLE IF NOT EXISTS work_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id),
        stage TEXT NOT NULL CHECK (stage IN ('fetch', 'llm', 'notify')),
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued', 'running', 'completed', 'failed')),
        priority INTEGER NOT NULL DEFAULT 0,
        run_at_ms INTEGER NOT NULL,
        claimed_by TEXT,
        lease_expires_at_ms INTEGER,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error_class TEXT,
        created_at_ms INTEGER NOT NULL,
        started_at_ms INTEGER,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_work_queue_claim
        ON work_queue(status, run_at_ms, priority, created_at_ms);

    CREATE TABLE IF NOT EXISTS outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id),
        changelist_id INTEGER NOT NULL,
        recipient TEXT NOT NULL,
        review_version INTEGER NOT NULL,
        payload TEXT NOT NULL,
        idempotency_token TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'sent', 'failed_permanent')),
        notification_id TEXT,
        notified_at_ms INTEGER,
        send_attempted_at_ms INTEGER,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        last_error_class TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_key
        ON outbox(changelist_id, recipient, review_version);
    CREATE INDEX IF NOT EXISTS idx_outbox_job
        ON outbox(job_id);

    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id),
        stage TEXT NOT NULL CHECK (stage IN ('fetch', 'llm', 'notify')),
        error_class TEXT NOT NULL,
        last_stack TEXT,
        sanitized_context TEXT NOT NULL,
        remediation_evidence_ref TEXT,
        replay_start_stage TEXT,
        replay_count INTEGER NOT NULL DEFAULT 0,
        resolution_notes TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        first_failure_at_ms INTEGER NOT NULL,
        last_failure_at_ms INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'open'
            CHECK (status IN ('open', 'replaying', 'resolved', 'reopened')),
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dead_letters_triage
        ON dead_letters(error_class, stage);

    CREATE TABLE IF NOT EXISTS audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event TEXT NOT NULL,
        job_id INTEGER,
        detail TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    );
";

/// Shared handle to the `SQLite` store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory store. Each call yields an independent database.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // The store clock. Registered per-connection so SQL-side time
        // comparisons never mix caller clocks.
        conn.create_scalar_function("now_ms", 0, FunctionFlags::SQLITE_UTF8, |_ctx| {
            Ok(Utc::now().timestamp_millis())
        })?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!("store schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the locked connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction. All writes roll back
    /// if `f` returns an error.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Reads the store clock.
    pub fn now_ms(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT now_ms()", [], |row| row.get(0))?))
    }
}
