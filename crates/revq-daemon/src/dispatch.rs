//! Job creation, idempotency dedupe, and the versioned rerun gate.
//!
//! A job is the unit of review work for one `(changelist_id,
//! review_version)`. `idempotency_key` uniquely identifies a job: duplicate
//! submissions return the existing row, never a second job. A job that
//! reached `succeeded` is immutable; the only way to review the changelist
//! again is a new job with a strictly greater `review_version`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{Result, Store, StoreError};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Created, no worker has started it.
    Pending,
    /// A worker is executing one of its stages.
    InProgress,
    /// Terminal success: result validated, every recipient notified.
    Succeeded,
    /// A retryable failure was recorded; the queue will re-run the stage.
    RetryableFailed,
    /// Terminal failure with a corresponding dead letter.
    Failed,
}

impl JobStatus {
    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::RetryableFailed => "retryable_failed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "retryable_failed" => Ok(Self::RetryableFailed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::CorruptRow {
                detail: format!("unknown job status: {other}"),
            }),
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One review job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Row id.
    pub job_id: i64,
    /// Caller-supplied unique submission key.
    pub idempotency_key: String,
    /// The changelist under review.
    pub changelist_id: i64,
    /// Monotonic review version for the changelist.
    pub review_version: i64,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Reference to the validated result, once the llm stage completed.
    pub result_ref: Option<String>,
    /// Creation time (store clock, ms).
    pub created_at_ms: i64,
    /// Last mutation time.
    pub updated_at_ms: i64,
}

impl Job {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_label: String = row.get("status")?;
        Ok(Self {
            job_id: row.get("id")?,
            idempotency_key: row.get("idempotency_key")?,
            changelist_id: row.get("changelist_id")?,
            review_version: row.get("review_version")?,
            status: JobStatus::parse(&status_label).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.to_string().into(),
                )
            })?,
            result_ref: row.get("result_ref")?,
            created_at_ms: row.get("created_at_ms")?,
            updated_at_ms: row.get("updated_at_ms")?,
        })
    }
}

/// How a submission resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// A new job row was created.
    Created,
    /// The idempotency key matched an existing job; that job is returned.
    DuplicateIdempotency,
    /// A succeeded job already covers this exact version; returned as no-op.
    AlreadySucceededSameVersion,
    /// A newer version over a succeeded review requires an explicit rerun.
    RerunRequired,
    /// The requested version is older than an already-succeeded review.
    StaleReviewVersion,
}

/// Result of [`JobDispatch::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Resolution status.
    pub status: SubmitStatus,
    /// The relevant job (new, or the prior row that resolved the request).
    pub job: Job,
    /// Whether a row was created by this call.
    pub created: bool,
}

/// Errors from finalize and rerun gating.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `finalize(succeeded)` was requested while outbox rows remain
    /// unnotified.
    #[error("job {job_id} has {pending} unnotified outbox rows")]
    OutboxIncomplete {
        /// The job being finalized.
        job_id: i64,
        /// Rows still lacking `notified_at`.
        pending: usize,
    },

    /// A status transition fell outside the job state machine.
    #[error("job {job_id}: illegal transition to {target}")]
    IllegalTransition {
        /// The job.
        job_id: i64,
        /// Requested target status label.
        target: &'static str,
    },
}

/// Job dispatch operations.
#[derive(Debug, Clone)]
pub struct JobDispatch {
    store: Store,
}

impl JobDispatch {
    /// Creates dispatch operations over the store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Submits a job, applying idempotency dedupe and the versioned rerun
    /// gate. `rerun_requested` acknowledges a rerun over a previously
    /// succeeded review at a strictly greater version.
    pub fn submit(
        &self,
        idempotency_key: &str,
        changelist_id: i64,
        review_version: i64,
        rerun_requested: bool,
    ) -> Result<Submission> {
        self.store.transaction(|conn| {
            if let Some(existing) = Self::get_by_key(conn, idempotency_key)? {
                debug!(
                    job_id = existing.job_id,
                    idempotency_key, "duplicate submission resolved to existing job"
                );
                return Ok(Submission {
                    status: SubmitStatus::DuplicateIdempotency,
                    job: existing,
                    created: false,
                });
            }

            if let Some(prior) = Self::latest_succeeded(conn, changelist_id)? {
                if review_version == prior.review_version {
                    return Ok(Submission {
                        status: SubmitStatus::AlreadySucceededSameVersion,
                        job: prior,
                        created: false,
                    });
                }
                if review_version < prior.review_version {
                    return Ok(Submission {
                        status: SubmitStatus::StaleReviewVersion,
                        job: prior,
                        created: false,
                    });
                }
                if !rerun_requested {
                    return Ok(Submission {
                        status: SubmitStatus::RerunRequired,
                        job: prior,
                        created: false,
                    });
                }
            }

            let inserted = conn.execute(
                "INSERT INTO jobs
                     (idempotency_key, changelist_id, review_version, status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'pending', now_ms(), now_ms())
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![idempotency_key, changelist_id, review_version],
            )?;
            let job = Self::get_by_key(conn, idempotency_key)?.ok_or(StoreError::CorruptRow {
                detail: format!("job vanished after insert: {idempotency_key}"),
            })?;
            let created = inserted == 1;
            if created {
                info!(
                    job_id = job.job_id,
                    changelist_id, review_version, "created review job"
                );
            }
            Ok(Submission {
                status: if created {
                    SubmitStatus::Created
                } else {
                    SubmitStatus::DuplicateIdempotency
                },
                job,
                created,
            })
        })
    }

    /// Fetches a job by id.
    pub fn get_job(&self, job_id: i64) -> Result<Job> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![job_id],
                Job::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "job",
                id: job_id,
            })
        })
    }

    /// Marks a job `in_progress`. Legal from `pending`, `retryable_failed`,
    /// a re-claimed `in_progress`, or `failed` (operator replay).
    pub fn mark_in_progress(&self, job_id: i64) -> Result<(), DispatchError> {
        let rows = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                 SET status = 'in_progress', updated_at_ms = now_ms()
                 WHERE id = ?1
                   AND status IN ('pending', 'retryable_failed', 'in_progress', 'failed')",
                params![job_id],
            )?)
        })?;
        if rows == 1 {
            Ok(())
        } else {
            Err(DispatchError::IllegalTransition {
                job_id,
                target: "in_progress",
            })
        }
    }

    /// Records the validated result reference on the job.
    pub fn record_result_ref(&self, job_id: i64, result_ref: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET result_ref = ?2, updated_at_ms = now_ms() WHERE id = ?1",
                params![job_id, result_ref],
            )?;
            Ok(())
        })
    }

    /// Marks a job `retryable_failed` while the queue waits out a backoff.
    pub fn mark_retryable_failed(&self, job_id: i64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs
                 SET status = 'retryable_failed', updated_at_ms = now_ms()
                 WHERE id = ?1 AND status IN ('pending', 'in_progress')",
                params![job_id],
            )?;
            Ok(())
        })
    }

    /// Finalizes a job to `succeeded`. Refused while any outbox row for the
    /// job's `(changelist_id, review_version)` lacks `notified_at`.
    pub fn finalize_succeeded(&self, job_id: i64) -> Result<(), DispatchError> {
        self.store
            .transaction(|conn| {
                let job = conn
                    .query_row(
                        "SELECT * FROM jobs WHERE id = ?1",
                        params![job_id],
                        Job::from_row,
                    )
                    .optional()?
                    .ok_or(StoreError::NotFound {
                        entity: "job",
                        id: job_id,
                    })?;

                let pending: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM outbox
                     WHERE changelist_id = ?1 AND review_version = ?2 AND notified_at_ms IS NULL",
                    params![job.changelist_id, job.review_version],
                    |row| row.get(0),
                )?;
                if pending > 0 {
                    // Surfaced as OutboxIncomplete by the caller below.
                    return Ok(Some(usize::try_from(pending).unwrap_or(usize::MAX)));
                }

                let rows = conn.execute(
                    "UPDATE jobs
                     SET status = 'succeeded', updated_at_ms = now_ms()
                     WHERE id = ?1 AND status = 'in_progress'",
                    params![job_id],
                )?;
                if rows == 1 {
                    info!(job_id, "job succeeded");
                    Ok(None)
                } else {
                    Err(StoreError::CorruptRow {
                        detail: format!("job {job_id} not in_progress at finalize"),
                    })
                }
            })
            .map_err(DispatchError::Store)
            .and_then(|pending| match pending {
                None => Ok(()),
                Some(pending) => Err(DispatchError::OutboxIncomplete { job_id, pending }),
            })
    }

    /// Finalizes a job to `failed`. The caller is responsible for the
    /// corresponding dead letter.
    pub fn finalize_failed(&self, job_id: i64) -> Result<(), DispatchError> {
        let rows = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                 SET status = 'failed', updated_at_ms = now_ms()
                 WHERE id = ?1 AND status NOT IN ('succeeded')",
                params![job_id],
            )?)
        })?;
        if rows == 1 {
            info!(job_id, "job failed");
            Ok(())
        } else {
            Err(DispatchError::IllegalTransition {
                job_id,
                target: "failed",
            })
        }
    }

    fn get_by_key(conn: &Connection, idempotency_key: &str) -> Result<Option<Job>> {
        Ok(conn
            .query_row(
                "SELECT * FROM jobs WHERE idempotency_key = ?1",
                params![idempotency_key],
                Job::from_row,
            )
            .optional()?)
    }

    fn latest_succeeded(conn: &Connection, changelist_id: i64) -> Result<Option<Job>> {
        Ok(conn
            .query_row(
                "SELECT * FROM jobs
                 WHERE changelist_id = ?1 AND status = 'succeeded'
                 ORDER BY review_version DESC, id DESC
                 LIMIT 1",
                params![changelist_id],
                Job::from_row,
            )
            .optional()?)
    }

    /// Test/ops hook: the latest succeeded job for a changelist.
    pub fn latest_succeeded_job(&self, changelist_id: i64) -> Result<Option<Job>> {
        self.store
            .with_conn(|conn| Self::latest_succeeded(conn, changelist_id))
    }
}
