//! Per-recipient notification outbox with exactly-once delivery semantics.
//!
//! Every delivery intent is one row, uniquely keyed by `(changelist_id,
//! recipient, review_version)`. The delivery protocol is **send first, then
//! mark**: a row never moves to `sent` before the provider acknowledged the
//! send, and `notification_id` is always persisted before or together with
//! `notified_at`, never the reverse.
//!
//! Crash windows are covered by two mechanisms:
//!
//! - the provider idempotency token is derived from the outbox key, so a
//!   resend after an un-marked send is absorbed by a compliant provider
//! - an attempt sentinel (`send_attempted_at_ms`) is persisted before the
//!   provider call; [`Outbox::reconcile_ambiguous`] later asks the provider
//!   whether the token was delivered and either backfills the marker or
//!   clears the sentinel for a clean resend
//!
//! A row marked `sent` that the provider has no record of is a contract
//! violation: it is alerted and audited, never silently repaired.

use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use revq_core::error::ErrorClass;
use revq_core::provider::{notification_token, DeliveryLookup, NotificationProvider};
use revq_core::redact::redact;

use crate::audit::AuditLog;
use crate::store::{Result, Store, StoreError};

/// Outbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Awaiting delivery.
    Pending,
    /// Provider acknowledged; `notification_id` and `notified_at` are set.
    Sent,
    /// The provider rejected the recipient permanently; operator action
    /// required before the job can succeed.
    FailedPermanent,
}

impl OutboxStatus {
    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed_permanent" => Ok(Self::FailedPermanent),
            other => Err(StoreError::CorruptRow {
                detail: format!("unknown outbox status: {other}"),
            }),
        }
    }
}

/// One delivery intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Row id.
    pub entry_id: i64,
    /// Owning job.
    pub job_id: i64,
    /// Outbox key: changelist.
    pub changelist_id: i64,
    /// Outbox key: recipient.
    pub recipient: String,
    /// Outbox key: review version.
    pub review_version: i64,
    /// Notification payload (JSON).
    pub payload: String,
    /// Deterministic provider idempotency token for the key.
    pub idempotency_token: String,
    /// Row status.
    pub status: OutboxStatus,
    /// Provider message id, set before or with `notified_at`.
    pub notification_id: Option<String>,
    /// Delivery marker (store clock, ms). Set only after provider ack.
    pub notified_at_ms: Option<i64>,
    /// Attempt sentinel: set before a provider call whose outcome may not
    /// have been persisted.
    pub send_attempted_at_ms: Option<i64>,
    /// Send attempts so far.
    pub attempt_count: u32,
    /// Redacted detail of the most recent failure.
    pub last_error: Option<String>,
    /// Classification of the most recent failure.
    pub last_error_class: Option<ErrorClass>,
    /// Last mutation time.
    pub updated_at_ms: i64,
}

impl OutboxEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_label: String = row.get("status")?;
        Ok(Self {
            entry_id: row.get("id")?,
            job_id: row.get("job_id")?,
            changelist_id: row.get("changelist_id")?,
            recipient: row.get("recipient")?,
            review_version: row.get("review_version")?,
            payload: row.get("payload")?,
            idempotency_token: row.get("idempotency_token")?,
            status: OutboxStatus::parse(&status_label).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.to_string().into(),
                )
            })?,
            notification_id: row.get("notification_id")?,
            notified_at_ms: row.get("notified_at_ms")?,
            send_attempted_at_ms: row.get("send_attempted_at_ms")?,
            attempt_count: row.get("attempt_count")?,
            last_error: row.get("last_error")?,
            last_error_class: {
                let label: Option<String> = row.get("last_error_class")?;
                label
                    .map(|label| {
                        ErrorClass::parse(&label).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                e.to_string().into(),
                            )
                        })
                    })
                    .transpose()?
            },
            updated_at_ms: row.get("updated_at_ms")?,
        })
    }
}

/// Outcome of delivering one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The provider accepted a fresh send.
    Sent {
        /// Provider message id.
        message_id: String,
    },
    /// `notified_at` was already set; nothing to do.
    AlreadySent {
        /// The previously recorded message id.
        message_id: String,
    },
    /// Provider-side truth was backfilled without resending.
    Reconciled {
        /// The message id confirmed by the lookup.
        message_id: String,
    },
    /// The recipient is permanently undeliverable.
    FailedPermanent {
        /// Classification of the rejection.
        class: ErrorClass,
    },
    /// A retryable failure; the row stays `pending`.
    Failed {
        /// Classification of the failure.
        class: ErrorClass,
        /// Upstream retry hint, if any.
        retry_after: Option<Duration>,
    },
}

/// Summary of a [`Outbox::reconcile_ambiguous`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows whose delivery marker was backfilled from provider truth.
    pub backfilled: usize,
    /// Rows whose dangling sentinel was cleared for a clean resend.
    pub cleared: usize,
    /// Rows marked `sent` that the provider has no record of.
    pub violations: usize,
}

/// Outbox operations.
#[derive(Debug, Clone)]
pub struct Outbox {
    store: Store,
    audit: AuditLog,
}

impl Outbox {
    /// Creates outbox operations over the store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        let audit = AuditLog::new(store.clone());
        Self { store, audit }
    }

    /// Inserts one pending row per recipient under the unique outbox key.
    /// Collisions leave existing rows untouched, so rerunning materialize
    /// after a crash is safe.
    pub fn materialize(
        &self,
        job_id: i64,
        changelist_id: i64,
        review_version: i64,
        recipients: &[String],
        payload: &str,
    ) -> Result<usize> {
        self.store.transaction(|conn| {
            let mut inserted = 0;
            for recipient in recipients {
                let token = notification_token(changelist_id, recipient, review_version);
                inserted += conn.execute(
                    "INSERT INTO outbox
                         (job_id, changelist_id, recipient, review_version, payload,
                          idempotency_token, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, now_ms(), now_ms())
                     ON CONFLICT(changelist_id, recipient, review_version) DO NOTHING",
                    params![job_id, changelist_id, recipient, review_version, payload, token],
                )?;
            }
            debug!(job_id, changelist_id, review_version, inserted, "materialized outbox rows");
            Ok(inserted)
        })
    }

    /// Rows for a job still awaiting delivery, ordered by recipient.
    pub fn pending_for_job(&self, job_id: i64) -> Result<Vec<OutboxEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM outbox
                 WHERE job_id = ?1 AND status = 'pending' AND notified_at_ms IS NULL
                 ORDER BY recipient ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![job_id], OutboxEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Count of rows for a job in `failed_permanent`.
    pub fn permanent_failures_for_job(&self, job_id: i64) -> Result<usize> {
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE job_id = ?1 AND status = 'failed_permanent'",
                params![job_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(usize::MAX))
        })
    }

    /// Classification of the first `failed_permanent` row of a job, if any.
    pub fn first_permanent_failure_class(&self, job_id: i64) -> Result<Option<ErrorClass>> {
        let label: Option<Option<String>> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_error_class FROM outbox
                     WHERE job_id = ?1 AND status = 'failed_permanent'
                     ORDER BY id ASC LIMIT 1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(match label {
            None => None,
            Some(Some(label)) => {
                Some(ErrorClass::parse(&label).map_err(|e| StoreError::CorruptRow {
                    detail: e.to_string(),
                })?)
            }
            // Row predates the class column; treat as a policy rejection.
            Some(None) => Some(ErrorClass::ContentPolicyReject),
        })
    }

    /// Delivers every pending row of a job with send-then-mark semantics.
    /// Rows are independent: one recipient's failure does not block another.
    pub fn deliver_pending(
        &self,
        job_id: i64,
        provider: &dyn NotificationProvider,
        deadline: Duration,
    ) -> Result<Vec<(i64, DeliveryResult)>> {
        let mut results = Vec::new();
        for entry in self.pending_for_job(job_id)? {
            let result = self.deliver_entry(entry.entry_id, provider, deadline)?;
            results.push((entry.entry_id, result));
        }
        Ok(results)
    }

    /// Delivers one row. The ladder is normative:
    ///
    /// 1. Re-read the row. `notified_at` set ⇒ skip.
    /// 2. `notification_id` set but unmarked ⇒ reconcile via provider lookup;
    ///    backfill without resending when delivered.
    /// 3. Otherwise persist the attempt sentinel, send with the deterministic
    ///    token, and on ack persist id + marker + status in a single write.
    pub fn deliver_entry(
        &self,
        entry_id: i64,
        provider: &dyn NotificationProvider,
        deadline: Duration,
    ) -> Result<DeliveryResult> {
        let entry = self.get(entry_id)?;

        if entry.notified_at_ms.is_some() {
            let message_id = entry.notification_id.clone().unwrap_or_default();
            return Ok(DeliveryResult::AlreadySent { message_id });
        }

        if entry.notification_id.is_some() {
            match provider.lookup(&entry.idempotency_token) {
                Ok(DeliveryLookup::Delivered { message_id }) => {
                    self.mark_sent(entry_id, &message_id)?;
                    info!(entry_id, recipient = %entry.recipient, "reconciled delivery from provider truth");
                    return Ok(DeliveryResult::Reconciled { message_id });
                }
                Ok(DeliveryLookup::NotFound) => {
                    debug!(entry_id, "stale notification_id with no provider record; resending");
                }
                Err(err) => {
                    self.record_failure(entry_id, err.class, &err.message)?;
                    return Ok(DeliveryResult::Failed {
                        class: err.class,
                        retry_after: err.retry_after,
                    });
                }
            }
        }

        // Sentinel first: if the process dies between send and mark, the
        // reconciler knows a send may have happened.
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET send_attempted_at_ms = now_ms(),
                     attempt_count = attempt_count + 1,
                     updated_at_ms = now_ms()
                 WHERE id = ?1",
                params![entry_id],
            )?;
            Ok(())
        })?;

        match provider.send(
            &entry.recipient,
            &entry.payload,
            &entry.idempotency_token,
            deadline,
        ) {
            Ok(message_id) => {
                self.mark_sent(entry_id, &message_id)?;
                info!(entry_id, recipient = %entry.recipient, "notification sent");
                Ok(DeliveryResult::Sent { message_id })
            }
            Err(err) if err.class.is_retryable() => {
                // A timeout is ambiguous: the send may have landed. Keep the
                // sentinel so reconcile_ambiguous can ask the provider. A
                // definitive refusal clears it.
                if err.class != ErrorClass::NetworkTimeout {
                    self.clear_sentinel(entry_id)?;
                }
                self.record_failure(entry_id, err.class, &err.message)?;
                warn!(entry_id, class = %err.class, "notification send failed; will retry");
                Ok(DeliveryResult::Failed {
                    class: err.class,
                    retry_after: err.retry_after,
                })
            }
            Err(err) => {
                self.clear_sentinel(entry_id)?;
                self.record_failure(entry_id, err.class, &err.message)?;
                self.store.with_conn(|conn| {
                    conn.execute(
                        "UPDATE outbox
                         SET status = 'failed_permanent', updated_at_ms = now_ms()
                         WHERE id = ?1",
                        params![entry_id],
                    )?;
                    Ok(())
                })?;
                warn!(entry_id, class = %err.class, "recipient permanently undeliverable");
                Ok(DeliveryResult::FailedPermanent { class: err.class })
            }
        }
    }

    /// Background scan repairing ambiguous delivery state from provider
    /// truth, and flagging marker-without-evidence rows as contract
    /// violations.
    pub fn reconcile_ambiguous(
        &self,
        provider: &dyn NotificationProvider,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let ambiguous: Vec<OutboxEntry> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM outbox
                 WHERE status = 'pending'
                   AND notified_at_ms IS NULL
                   AND (notification_id IS NOT NULL OR send_attempted_at_ms IS NOT NULL)
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], OutboxEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        for entry in ambiguous {
            match provider.lookup(&entry.idempotency_token) {
                Ok(DeliveryLookup::Delivered { message_id }) => {
                    self.mark_sent(entry.entry_id, &message_id)?;
                    report.backfilled += 1;
                }
                Ok(DeliveryLookup::NotFound) => {
                    self.store.with_conn(|conn| {
                        conn.execute(
                            "UPDATE outbox
                             SET send_attempted_at_ms = NULL,
                                 notification_id = NULL,
                                 updated_at_ms = now_ms()
                             WHERE id = ?1 AND notified_at_ms IS NULL",
                            params![entry.entry_id],
                        )?;
                        Ok(())
                    })?;
                    report.cleared += 1;
                }
                Err(err) => {
                    debug!(entry_id = entry.entry_id, class = %err.class, "lookup failed; row left for next sweep");
                }
            }
        }

        let marked: Vec<OutboxEntry> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM outbox
                 WHERE status = 'sent' AND notified_at_ms IS NOT NULL
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], OutboxEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        for entry in marked {
            if let Ok(DeliveryLookup::NotFound) = provider.lookup(&entry.idempotency_token) {
                report.violations += 1;
                error!(
                    entry_id = entry.entry_id,
                    recipient = %entry.recipient,
                    "outbox row marked sent but provider has no record; contract violation"
                );
                self.audit.record(
                    "outbox_contract_violation",
                    Some(entry.job_id),
                    &serde_json::json!({
                        "entry_id": entry.entry_id,
                        "changelist_id": entry.changelist_id,
                        "review_version": entry.review_version,
                        "notification_id": entry.notification_id,
                    }),
                )?;
            }
        }

        Ok(report)
    }

    /// Fetches an outbox row by id.
    pub fn get(&self, entry_id: i64) -> Result<OutboxEntry> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM outbox WHERE id = ?1",
                params![entry_id],
                OutboxEntry::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "outbox entry",
                id: entry_id,
            })
        })
    }

    /// Single-write marker: id, timestamp, and status land together, after
    /// provider acknowledgment. `notified_at` is never set in any other
    /// statement.
    fn mark_sent(&self, entry_id: i64, message_id: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET notification_id = ?2,
                     notified_at_ms = now_ms(),
                     status = 'sent',
                     send_attempted_at_ms = NULL,
                     last_error = NULL,
                     updated_at_ms = now_ms()
                 WHERE id = ?1 AND notified_at_ms IS NULL",
                params![entry_id, message_id],
            )?;
            Ok(())
        })
    }

    fn clear_sentinel(&self, entry_id: i64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET send_attempted_at_ms = NULL, updated_at_ms = now_ms()
                 WHERE id = ?1",
                params![entry_id],
            )?;
            Ok(())
        })
    }

    fn record_failure(&self, entry_id: i64, class: ErrorClass, message: &str) -> Result<()> {
        let scrubbed = redact(message);
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET last_error = ?2, last_error_class = ?3, updated_at_ms = now_ms()
                 WHERE id = ?1",
                params![entry_id, scrubbed, class.as_str()],
            )?;
            Ok(())
        })
    }

    /// Test/ops hook: overwrite crash-window fields directly.
    #[doc(hidden)]
    pub fn force_crash_state(
        &self,
        entry_id: i64,
        notification_id: Option<&str>,
        sentinel: bool,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET notification_id = ?2,
                     send_attempted_at_ms = CASE WHEN ?3 THEN now_ms() ELSE NULL END,
                     updated_at_ms = now_ms()
                 WHERE id = ?1",
                params![entry_id, notification_id, sentinel],
            )?;
            Ok(())
        })
    }
}
