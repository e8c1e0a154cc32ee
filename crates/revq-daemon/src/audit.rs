//! Append-only audit trail.
//!
//! Finalizations, replays, and outbox contract violations leave a durable
//! audit row so operator triage never depends on log retention.

use rusqlite::params;
use serde_json::Value;

use crate::store::{Result, Store};

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Row id.
    pub audit_id: i64,
    /// Stable event name (`replay_started`, `outbox_contract_violation`, ...).
    pub event: String,
    /// Related job, when there is one.
    pub job_id: Option<i64>,
    /// JSON detail.
    pub detail: String,
    /// Store-clock timestamp, ms.
    pub created_at_ms: i64,
}

/// Audit log operations.
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: Store,
}

impl AuditLog {
    /// Creates audit operations over the store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Appends an audit row. `detail` must already be sanitized.
    pub fn record(&self, event: &str, job_id: Option<i64>, detail: &Value) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit (event, job_id, detail, created_at_ms)
                 VALUES (?1, ?2, ?3, now_ms())",
                params![event, job_id, detail.to_string()],
            )?;
            Ok(())
        })
    }

    /// Lists audit rows for a job, oldest first.
    pub fn for_job(&self, job_id: i64) -> Result<Vec<AuditRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event, job_id, detail, created_at_ms
                 FROM audit WHERE job_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![job_id], |row| {
                    Ok(AuditRecord {
                        audit_id: row.get(0)?,
                        event: row.get(1)?,
                        job_id: row.get(2)?,
                        detail: row.get(3)?,
                        created_at_ms: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
