//! Durable work queue with lease-based mutual exclusion.
//!
//! State machine: `queued → running → (completed | failed)`, plus
//! `running → queued` when an expired lease is swept. Terminal states are
//! immutable.
//!
//! Every mutation after `claim` is owner-guarded in SQL
//! (`id AND claimed_by AND status = 'running'`): a worker whose lease was
//! stolen observes 0 rows affected and must cease ownership-requiring side
//! effects. That makes the stolen-lease case a silent no-op rather than a
//! race, and gives crash recovery without worker tombstones — the sweeper
//! requeues anything whose lease ran out.

use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use revq_core::error::ErrorClass;
use revq_core::retry::{RetryPolicy, Stage};

use crate::store::{Result, Store, StoreError};

/// Queue-row status labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkStatus {
    /// Eligible for claiming once `run_at` passes.
    Queued,
    /// Claimed under a live lease.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully with budget exhausted or a non-retryable
    /// class. Terminal.
    Failed,
}

impl WorkStatus {
    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::CorruptRow {
                detail: format!("unknown work status: {other}"),
            }),
        }
    }
}

/// One durable work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Queue row id.
    pub work_id: i64,
    /// Owning job.
    pub job_id: i64,
    /// Pipeline stage this item executes.
    pub stage: Stage,
    /// Opaque stage payload (JSON by convention).
    pub payload: String,
    /// Current status.
    pub status: WorkStatus,
    /// Claim priority; higher claims first.
    pub priority: i64,
    /// Earliest eligible claim time (store clock, ms).
    pub run_at_ms: i64,
    /// Owning worker, non-null iff `running`.
    pub claimed_by: Option<String>,
    /// Lease expiry (store clock, ms), set iff `running`.
    pub lease_expires_at_ms: Option<i64>,
    /// Attempts started so far. Monotonically non-decreasing.
    pub attempt_count: u32,
    /// Class of the most recent failure, if any.
    pub last_error_class: Option<ErrorClass>,
    /// Creation time (store clock, ms).
    pub created_at_ms: i64,
    /// First claim time, if ever claimed.
    pub started_at_ms: Option<i64>,
    /// Last mutation time.
    pub updated_at_ms: i64,
}

impl WorkItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let stage_label: String = row.get("stage")?;
        let status_label: String = row.get("status")?;
        let error_label: Option<String> = row.get("last_error_class")?;
        Ok(Self {
            work_id: row.get("id")?,
            job_id: row.get("job_id")?,
            stage: Stage::parse(&stage_label).map_err(|e| corrupt(&e.to_string()))?,
            payload: row.get("payload")?,
            status: WorkStatus::parse(&status_label).map_err(|e| corrupt(&e.to_string()))?,
            priority: row.get("priority")?,
            run_at_ms: row.get("run_at_ms")?,
            claimed_by: row.get("claimed_by")?,
            lease_expires_at_ms: row.get("lease_expires_at_ms")?,
            attempt_count: row.get("attempt_count")?,
            last_error_class: error_label
                .map(|label| ErrorClass::parse(&label).map_err(|e| corrupt(&e.to_string())))
                .transpose()?,
            created_at_ms: row.get("created_at_ms")?,
            started_at_ms: row.get("started_at_ms")?,
            updated_at_ms: row.get("updated_at_ms")?,
        })
    }
}

/// Maps a domain parse failure into a rusqlite row error so it can surface
/// through `query_row` without losing the detail.
fn corrupt(detail: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        detail.to_string().into(),
    )
}

/// Why an owner-guarded mutation affected 0 rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRejection {
    /// `not_owner` when another worker holds the row, `invalid_transition`
    /// otherwise (wrong status, unknown row).
    pub code: &'static str,
    /// Current owner, if the row exists.
    pub owner: Option<String>,
    /// Current status label, if the row exists.
    pub status: Option<String>,
}

/// Outcome of an owner-guarded terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The transition was applied (1 row).
    Applied,
    /// 0 rows affected; diagnostics say why.
    Rejected(MutationRejection),
}

impl MutationOutcome {
    /// Whether the mutation was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Disposition of a `fail` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDisposition {
    /// Retryable class with remaining budget: requeued with a jittered
    /// `run_at`.
    Requeued {
        /// Attempts already consumed, inclusive of the one that failed.
        attempt_count: u32,
        /// Delay applied before the item becomes claimable again.
        delay: Duration,
    },
    /// Terminal failure: non-retryable class or exhausted budget. The caller
    /// routes the item to the failure pipeline.
    Exhausted {
        /// Attempts consumed.
        attempt_count: u32,
    },
    /// The caller no longer owns the row. No state was changed.
    LostOwnership(MutationRejection),
}

const WORK_ITEM_COLUMNS: &str = "id, job_id, stage, payload, status, priority, run_at_ms, \
     claimed_by, lease_expires_at_ms, attempt_count, last_error_class, \
     created_at_ms, started_at_ms, updated_at_ms";

/// Durable queue operations.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    store: Store,
    active_bound: Option<i64>,
}

impl WorkQueue {
    /// Creates queue operations over the store, with no bound on concurrent
    /// `running` rows.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self {
            store,
            active_bound: None,
        }
    }

    /// Caps the number of `running` rows a claim may create. Expired leases
    /// count against the bound until the sweeper requeues them, so a sweep
    /// restores claim capacity.
    #[must_use]
    pub const fn with_active_bound(mut self, bound: i64) -> Self {
        self.active_bound = Some(bound);
        self
    }

    /// Enqueues a work item. `run_at_delay` defers eligibility relative to
    /// the store clock; `None` means immediately eligible.
    pub fn enqueue(
        &self,
        job_id: i64,
        stage: Stage,
        payload: &str,
        priority: i64,
        run_at_delay: Option<Duration>,
    ) -> Result<i64> {
        let delay_ms = i64::try_from(run_at_delay.unwrap_or(Duration::ZERO).as_millis())
            .unwrap_or(i64::MAX);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO work_queue
                     (job_id, stage, payload, priority, run_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, now_ms() + ?5, now_ms(), now_ms())",
                params![job_id, stage.as_str(), payload, priority, delay_ms],
            )?;
            let work_id = conn.last_insert_rowid();
            debug!(work_id, job_id, stage = %stage, priority, "enqueued work item");
            Ok(work_id)
        })
    }

    /// Atomically claims the highest-priority eligible item, transitioning it
    /// to `running` under a lease. Ordering: `priority DESC, created_at ASC`.
    ///
    /// At most one worker ever observes a successful claim for a given item:
    /// the claim is a single conditional `UPDATE` under `SQLite`'s write
    /// lock, and the inner `SELECT` re-checks eligibility.
    pub fn claim(&self, worker_id: &str, lease_duration: Duration) -> Result<Option<WorkItem>> {
        let lease_ms = i64::try_from(lease_duration.as_millis()).unwrap_or(i64::MAX);
        let claimed = self.store.transaction(|conn| {
            if let Some(bound) = self.active_bound {
                let running: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM work_queue WHERE status = 'running'",
                    [],
                    |row| row.get(0),
                )?;
                if running >= bound {
                    return Ok(None);
                }
            }
            let item = conn
                .query_row(
                    &format!(
                        "UPDATE work_queue
                         SET status = 'running',
                             claimed_by = ?1,
                             lease_expires_at_ms = now_ms() + ?2,
                             attempt_count = attempt_count + 1,
                             started_at_ms = COALESCE(started_at_ms, now_ms()),
                             updated_at_ms = now_ms()
                         WHERE id = (
                             SELECT id FROM work_queue
                             WHERE status = 'queued' AND run_at_ms <= now_ms()
                             ORDER BY priority DESC, created_at_ms ASC, id ASC
                             LIMIT 1
                         )
                         RETURNING {WORK_ITEM_COLUMNS}"
                    ),
                    params![worker_id, lease_ms],
                    WorkItem::from_row,
                )
                .optional()?;
            Ok(item)
        })?;
        if let Some(item) = &claimed {
            info!(
                work_id = item.work_id,
                job_id = item.job_id,
                stage = %item.stage,
                worker_id,
                attempt = item.attempt_count,
                "claimed work item"
            );
        }
        Ok(claimed)
    }

    /// Renews the lease. Returns `false` (0 rows affected) when the caller is
    /// no longer the owner; the worker must then cease ownership-requiring
    /// side effects and let the sweeper reclaim.
    pub fn heartbeat(
        &self,
        work_id: i64,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool> {
        let lease_ms = i64::try_from(lease_duration.as_millis()).unwrap_or(i64::MAX);
        let rows = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work_queue
                 SET lease_expires_at_ms = now_ms() + ?3,
                     updated_at_ms = now_ms()
                 WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
                params![work_id, worker_id, lease_ms],
            )?)
        })?;
        if rows == 0 {
            warn!(work_id, worker_id, "heartbeat lost lease");
        }
        Ok(rows == 1)
    }

    /// Owner-guarded transition to `completed`.
    pub fn complete(&self, work_id: i64, worker_id: &str) -> Result<MutationOutcome> {
        self.finalize(work_id, worker_id, WorkStatus::Completed, None)
    }

    /// Owner-guarded failure. When the class is retryable and budget remains
    /// under `policy`, the item is requeued with a jittered delay instead of
    /// terminating; otherwise it transitions to `failed` and the caller
    /// routes it to the failure pipeline.
    pub fn fail(
        &self,
        work_id: i64,
        worker_id: &str,
        error_class: ErrorClass,
        retry_after: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<FailDisposition> {
        let attempt_count: Option<u32> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT attempt_count FROM work_queue
                     WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
                    params![work_id, worker_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        let Some(attempt_count) = attempt_count else {
            return Ok(FailDisposition::LostOwnership(
                self.rejection_for(work_id, worker_id)?,
            ));
        };

        if error_class.is_retryable() && policy.has_budget(attempt_count) {
            let delay = policy.sample_delay(attempt_count, retry_after);
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let rows = self.store.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE work_queue
                     SET status = 'queued',
                         claimed_by = NULL,
                         lease_expires_at_ms = NULL,
                         run_at_ms = now_ms() + ?3,
                         last_error_class = ?4,
                         updated_at_ms = now_ms()
                     WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
                    params![work_id, worker_id, delay_ms, error_class.as_str()],
                )?)
            })?;
            if rows == 0 {
                return Ok(FailDisposition::LostOwnership(
                    self.rejection_for(work_id, worker_id)?,
                ));
            }
            info!(
                work_id,
                worker_id,
                error_class = %error_class,
                attempt = attempt_count,
                delay_ms,
                "requeued failed work item with backoff"
            );
            return Ok(FailDisposition::Requeued {
                attempt_count,
                delay,
            });
        }

        match self.finalize(
            work_id,
            worker_id,
            WorkStatus::Failed,
            Some(error_class),
        )? {
            MutationOutcome::Applied => {
                warn!(
                    work_id,
                    worker_id,
                    error_class = %error_class,
                    attempt = attempt_count,
                    "work item failed terminally"
                );
                Ok(FailDisposition::Exhausted { attempt_count })
            }
            MutationOutcome::Rejected(rejection) => Ok(FailDisposition::LostOwnership(rejection)),
        }
    }

    fn finalize(
        &self,
        work_id: i64,
        worker_id: &str,
        target: WorkStatus,
        error_class: Option<ErrorClass>,
    ) -> Result<MutationOutcome> {
        let rows = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work_queue
                 SET status = ?3,
                     claimed_by = NULL,
                     lease_expires_at_ms = NULL,
                     last_error_class = COALESCE(?4, last_error_class),
                     updated_at_ms = now_ms()
                 WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
                params![
                    work_id,
                    worker_id,
                    target.as_str(),
                    error_class.map(ErrorClass::as_str)
                ],
            )?)
        })?;
        if rows == 1 {
            Ok(MutationOutcome::Applied)
        } else {
            Ok(MutationOutcome::Rejected(
                self.rejection_for(work_id, worker_id)?,
            ))
        }
    }

    /// Builds the rejection diagnostics for a 0-rows mutation, mirroring the
    /// owner/status introspection the worker logs on lease loss.
    fn rejection_for(&self, work_id: i64, worker_id: &str) -> Result<MutationRejection> {
        let row: Option<(Option<String>, String)> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT claimed_by, status FROM work_queue WHERE id = ?1",
                    params![work_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        Ok(match row {
            Some((owner, status)) => {
                let code = match &owner {
                    Some(current) if current != worker_id => "not_owner",
                    _ => "invalid_transition",
                };
                MutationRejection {
                    code,
                    owner,
                    status: Some(status),
                }
            }
            None => MutationRejection {
                code: "invalid_transition",
                owner: None,
                status: None,
            },
        })
    }

    /// Requeues every `running` row whose lease has expired. Idempotent and
    /// safe under concurrent invocation: the predicate and the claim path
    /// both go through the store's write lock.
    pub fn requeue_expired(&self) -> Result<usize> {
        let rows = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work_queue
                 SET status = 'queued',
                     claimed_by = NULL,
                     lease_expires_at_ms = NULL,
                     updated_at_ms = now_ms()
                 WHERE status = 'running' AND lease_expires_at_ms <= now_ms()",
                [],
            )?)
        })?;
        if rows > 0 {
            info!(requeued = rows, "requeued expired leases");
        }
        Ok(rows)
    }

    /// Fetches a work item by id.
    pub fn get(&self, work_id: i64) -> Result<WorkItem> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_queue WHERE id = ?1"),
                params![work_id],
                WorkItem::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "work item",
                id: work_id,
            })
        })
    }

    /// Test/ops hook: force a lease expiry time, bypassing owner guards.
    #[doc(hidden)]
    pub fn force_lease_expiry(&self, work_id: i64, delta_ms: i64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE work_queue SET lease_expires_at_ms = now_ms() + ?2 WHERE id = ?1",
                params![work_id, delta_ms],
            )?;
            Ok(())
        })
    }
}
