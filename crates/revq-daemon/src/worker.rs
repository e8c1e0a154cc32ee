//! The worker runtime: claim → process → finalize.
//!
//! Each worker is independent; the store is the only coordination medium.
//! Within one job the stages run in order `fetch → llm → notify`, each as its
//! own work item so retry budgets stay per-stage and completed work is
//! preserved across failures.
//!
//! Cancellation is cooperative: the worker renews its lease at every
//! side-effect boundary. A heartbeat returning `false` means the lease is
//! gone — the worker discards in-flight results and exits the processing
//! function without raising a failure; the sweeper owns recovery from there.
//! Every external call carries a deadline from [`WorkerConfig`]; expiry is
//! classified `NETWORK_TIMEOUT` by the provider implementations.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use revq_core::error::ErrorClass;
use revq_core::provider::{ChangeFetcher, FileDiff, NotificationProvider, ReviewModelClient};
use revq_core::retry::{RetryPolicy, Stage};
use revq_core::validator::{Diagnostic, DiagnosticCode, ResultValidator, ValidationOutcome, ValidatorConfig};

use crate::audit::AuditLog;
use crate::dispatch::{DispatchError, JobDispatch};
use crate::failure::{DeadLetterFilter, DeadLetterStatus, FailurePipeline};
use crate::outbox::{DeliveryResult, Outbox};
use crate::queue::{FailDisposition, MutationOutcome, WorkItem, WorkQueue};
use crate::store::{Store, StoreError};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease duration per claim. Heartbeats renew at side-effect boundaries;
    /// external deadlines below must fit inside it.
    pub lease_duration: Duration,
    /// Deadline for the changelist fetcher.
    pub fetch_deadline: Duration,
    /// Deadline for the review model call.
    pub model_deadline: Duration,
    /// Deadline per notification send.
    pub notify_deadline: Duration,
    /// Depot allow-list handed to the fetcher.
    pub allow_list: Vec<String>,
    /// Prompt submitted with every diff. Must already be redaction-safe.
    pub review_prompt: String,
    /// Retry policy shared by all stages.
    pub retry: RetryPolicy,
    /// Validator version gates.
    pub validator: ValidatorConfig,
}

impl WorkerConfig {
    /// Recommended timed-heartbeat cadence for loop drivers: one third of the
    /// lease, so two renewals can be missed before the sweeper reclaims.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_duration / 3
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            fetch_deadline: Duration::from_secs(15),
            model_deadline: Duration::from_secs(120),
            notify_deadline: Duration::from_secs(10),
            allow_list: Vec::new(),
            review_prompt: String::new(),
            retry: RetryPolicy::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Stage payload carried through the queue. Fields accumulate as stages
/// complete: `fetch` fills `changed_files` and `diffs` for `llm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePayload {
    /// Owning job.
    pub job_id: i64,
    /// Changelist under review.
    pub changelist_id: i64,
    /// Review version.
    pub review_version: i64,
    /// Recipients for the notify stage.
    pub recipients: Vec<String>,
    /// Claim priority, carried so downstream stages keep it.
    #[serde(default)]
    pub priority: i64,
    /// Changed files, populated by the fetch stage.
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Per-file diffs, populated by the fetch stage.
    #[serde(default)]
    pub diffs: Vec<FileDiff>,
}

/// Outcome of one `run_once` tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerTick {
    /// No eligible work.
    Idle,
    /// A work item was processed to an owned terminal or requeued state.
    Processed {
        /// The processed item.
        work_id: i64,
    },
    /// The lease was lost mid-processing; results were discarded.
    LeaseLost {
        /// The abandoned item.
        work_id: i64,
    },
}

/// Errors that abort a worker tick (infrastructure, not job failures).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Job state machine violation.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A stage payload failed to decode. Always an invariant violation.
    #[error("work item {work_id}: malformed stage payload: {source}")]
    MalformedPayload {
        /// The item carrying the payload.
        work_id: i64,
        /// Decode error.
        source: serde_json::Error,
    },
}

/// A claim-processing worker.
pub struct Worker {
    worker_id: String,
    queue: WorkQueue,
    dispatch: JobDispatch,
    outbox: Outbox,
    failure: FailurePipeline,
    audit: AuditLog,
    validator: ResultValidator,
    fetcher: Box<dyn ChangeFetcher>,
    model: Box<dyn ReviewModelClient>,
    provider: Box<dyn NotificationProvider>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates a worker over the store and external collaborators.
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        store: &Store,
        fetcher: Box<dyn ChangeFetcher>,
        model: Box<dyn ReviewModelClient>,
        provider: Box<dyn NotificationProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue: WorkQueue::new(store.clone()),
            dispatch: JobDispatch::new(store.clone()),
            outbox: Outbox::new(store.clone()),
            failure: FailurePipeline::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            validator: ResultValidator::new(config.validator.clone()),
            fetcher,
            model,
            provider,
            config,
        }
    }

    /// Generates a process-unique worker id.
    #[must_use]
    pub fn generate_id() -> String {
        format!("worker-{}", Uuid::new_v4())
    }

    /// The worker's id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims and processes at most one work item.
    pub fn run_once(&self) -> Result<WorkerTick, WorkerError> {
        let Some(item) = self.queue.claim(&self.worker_id, self.config.lease_duration)? else {
            return Ok(WorkerTick::Idle);
        };

        let payload: StagePayload = serde_json::from_str(&item.payload).map_err(|source| {
            WorkerError::MalformedPayload {
                work_id: item.work_id,
                source,
            }
        })?;

        self.dispatch.mark_in_progress(payload.job_id)?;

        match item.stage {
            Stage::Fetch => self.process_fetch(&item, payload),
            Stage::Llm => self.process_llm(&item, payload),
            Stage::Notify => self.process_notify(&item, &payload),
        }
    }

    /// Drains the queue until it reports no eligible work. Test and
    /// single-host convenience; production deployments loop `run_once` with
    /// their own pacing.
    pub fn run_until_idle(&self) -> Result<Vec<WorkerTick>, WorkerError> {
        let mut ticks = Vec::new();
        loop {
            match self.run_once()? {
                WorkerTick::Idle => break,
                tick => ticks.push(tick),
            }
        }
        Ok(ticks)
    }

    /// Renews the lease; `false` means ownership is gone and the caller must
    /// discard all in-flight results.
    fn renew_lease(&self, work_id: i64) -> Result<bool, WorkerError> {
        Ok(self
            .queue
            .heartbeat(work_id, &self.worker_id, self.config.lease_duration)?)
    }

    fn process_fetch(
        &self,
        item: &WorkItem,
        mut payload: StagePayload,
    ) -> Result<WorkerTick, WorkerError> {
        debug!(work_id = item.work_id, changelist_id = payload.changelist_id, "fetch stage");
        let change_set = match self.fetcher.fetch(
            payload.changelist_id,
            &self.config.allow_list,
            self.config.fetch_deadline,
        ) {
            Ok(change_set) => change_set,
            Err(err) => return self.handle_stage_failure(item, &payload, err.class, err.retry_after, &err.message),
        };

        if !self.renew_lease(item.work_id)? {
            return Ok(WorkerTick::LeaseLost {
                work_id: item.work_id,
            });
        }

        payload.changed_files = change_set.changed_files;
        payload.diffs = change_set.diffs;
        let next = serde_json::to_string(&payload).map_err(|source| {
            WorkerError::MalformedPayload {
                work_id: item.work_id,
                source,
            }
        })?;
        self.queue
            .enqueue(payload.job_id, Stage::Llm, &next, payload.priority, None)?;
        self.complete_item(item)
    }

    fn process_llm(
        &self,
        item: &WorkItem,
        payload: StagePayload,
    ) -> Result<WorkerTick, WorkerError> {
        debug!(work_id = item.work_id, changelist_id = payload.changelist_id, "llm stage");
        let diff_bundle = payload
            .diffs
            .iter()
            .map(|entry| format!("--- {}\n{}", entry.file, entry.diff))
            .collect::<Vec<_>>()
            .join("\n");

        let raw = match self.model.review(
            &self.config.review_prompt,
            &diff_bundle,
            self.config.model_deadline,
        ) {
            Ok(raw) => raw,
            Err(err) => return self.handle_stage_failure(item, &payload, err.class, err.retry_after, &err.message),
        };

        if !self.renew_lease(item.work_id)? {
            return Ok(WorkerTick::LeaseLost {
                work_id: item.work_id,
            });
        }

        match self.validator.validate(&raw, &payload.changed_files) {
            ValidationOutcome::Rejected { diagnostics } => {
                let class = class_for_rejection(&diagnostics);
                self.audit_diagnostics(payload.job_id, "response_rejected", &diagnostics)?;
                warn!(
                    job_id = payload.job_id,
                    class = %class,
                    "model response rejected by validator"
                );
                self.handle_stage_failure(
                    item,
                    &payload,
                    class,
                    None,
                    "model response rejected by output-contract validator",
                )
            }
            ValidationOutcome::Ok {
                result,
                diagnostics,
            } => {
                self.audit_diagnostics(payload.job_id, "response_validated", &diagnostics)?;

                let result_json = serde_json::to_string(&result).map_err(|source| {
                    WorkerError::MalformedPayload {
                        work_id: item.work_id,
                        source,
                    }
                })?;
                self.dispatch
                    .record_result_ref(payload.job_id, &result_json)?;

                let notification_payload = serde_json::json!({
                    "changelist_id": payload.changelist_id,
                    "review_version": payload.review_version,
                    "summary": result.summary,
                    "findings": result.findings,
                })
                .to_string();
                self.outbox.materialize(
                    payload.job_id,
                    payload.changelist_id,
                    payload.review_version,
                    &payload.recipients,
                    &notification_payload,
                )?;

                let next = serde_json::to_string(&payload).map_err(|source| {
                    WorkerError::MalformedPayload {
                        work_id: item.work_id,
                        source,
                    }
                })?;
                self.queue.enqueue(
                    payload.job_id,
                    Stage::Notify,
                    &next,
                    payload.priority,
                    None,
                )?;
                self.complete_item(item)
            }
        }
    }

    fn process_notify(
        &self,
        item: &WorkItem,
        payload: &StagePayload,
    ) -> Result<WorkerTick, WorkerError> {
        debug!(work_id = item.work_id, job_id = payload.job_id, "notify stage");
        let results = self.outbox.deliver_pending(
            payload.job_id,
            self.provider.as_ref(),
            self.config.notify_deadline,
        )?;

        if !self.renew_lease(item.work_id)? {
            return Ok(WorkerTick::LeaseLost {
                work_id: item.work_id,
            });
        }

        // Rows in failed_permanent — from this round or a prior one — block
        // success until an operator resolves them.
        if let Some(class) = self.outbox.first_permanent_failure_class(payload.job_id)? {
            return self.handle_stage_failure(
                item,
                payload,
                class,
                None,
                "recipient permanently undeliverable",
            );
        }

        let retryable = results.iter().find_map(|(_, result)| match result {
            DeliveryResult::Failed { class, retry_after } => Some((*class, *retry_after)),
            _ => None,
        });
        if let Some((class, retry_after)) = retryable {
            return self.handle_stage_failure(
                item,
                payload,
                class,
                retry_after,
                "notification delivery failed",
            );
        }

        // Everything for this job is delivered; finalize, then resolve any
        // replaying dead letter once the notify item itself is completed
        // (resolution verifies downstream stage completion).
        self.dispatch.finalize_succeeded(payload.job_id)?;
        self.audit.record(
            "job_succeeded",
            Some(payload.job_id),
            &serde_json::json!({
                "changelist_id": payload.changelist_id,
                "review_version": payload.review_version,
            }),
        )?;
        let tick = self.complete_item(item)?;
        if matches!(tick, WorkerTick::Processed { .. }) {
            self.resolve_replaying_dead_letters(payload.job_id);
        }
        Ok(tick)
    }

    fn resolve_replaying_dead_letters(&self, job_id: i64) {
        let replaying = self.failure.list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            status: Some(DeadLetterStatus::Replaying),
            ..DeadLetterFilter::default()
        });
        if let Ok(letters) = replaying {
            for letter in letters {
                if let Err(err) = self
                    .failure
                    .resolve_replay(letter.dl_id, "replayed pipeline completed")
                {
                    warn!(dl_id = letter.dl_id, %err, "dead letter resolution deferred");
                }
            }
        }
    }

    fn complete_item(&self, item: &WorkItem) -> Result<WorkerTick, WorkerError> {
        match self.queue.complete(item.work_id, &self.worker_id)? {
            MutationOutcome::Applied => Ok(WorkerTick::Processed {
                work_id: item.work_id,
            }),
            MutationOutcome::Rejected(rejection) => {
                // Ownership evaporated between the last heartbeat and the
                // finalize; someone else owns recovery now.
                info!(
                    work_id = item.work_id,
                    code = rejection.code,
                    "finalize affected 0 rows; exiting silently"
                );
                Ok(WorkerTick::LeaseLost {
                    work_id: item.work_id,
                })
            }
        }
    }

    /// Routes a stage failure: retryable-with-budget requeues under backoff;
    /// everything else dead-letters and fails the job.
    fn handle_stage_failure(
        &self,
        item: &WorkItem,
        payload: &StagePayload,
        class: ErrorClass,
        retry_after: Option<Duration>,
        detail: &str,
    ) -> Result<WorkerTick, WorkerError> {
        let disposition = self.queue.fail(
            item.work_id,
            &self.worker_id,
            class,
            retry_after,
            &self.config.retry,
        )?;
        match disposition {
            FailDisposition::Requeued { attempt_count, delay } => {
                self.dispatch.mark_retryable_failed(payload.job_id)?;
                debug!(
                    work_id = item.work_id,
                    attempt = attempt_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "stage will retry"
                );
                Ok(WorkerTick::Processed {
                    work_id: item.work_id,
                })
            }
            FailDisposition::Exhausted { attempt_count } => {
                let context = BTreeMap::from([
                    ("changelist_id".to_string(), payload.changelist_id.to_string()),
                    ("review_version".to_string(), payload.review_version.to_string()),
                    ("work_id".to_string(), item.work_id.to_string()),
                ]);
                self.failure.record_failure(
                    payload.job_id,
                    item.stage,
                    class,
                    detail,
                    attempt_count,
                    &context,
                )?;
                self.dispatch.finalize_failed(payload.job_id)?;
                Ok(WorkerTick::Processed {
                    work_id: item.work_id,
                })
            }
            FailDisposition::LostOwnership(_) => Ok(WorkerTick::LeaseLost {
                work_id: item.work_id,
            }),
        }
    }

    fn audit_diagnostics(
        &self,
        job_id: i64,
        event: &str,
        diagnostics: &[Diagnostic],
    ) -> Result<(), WorkerError> {
        if diagnostics.is_empty() {
            return Ok(());
        }
        let detail = serde_json::json!({ "diagnostics": diagnostics });
        self.audit.record(event, Some(job_id), &detail)?;
        Ok(())
    }
}

/// Maps a validator rejection onto the failure taxonomy. Schema and content
/// rejections are never retried.
fn class_for_rejection(diagnostics: &[Diagnostic]) -> ErrorClass {
    let reason = diagnostics
        .iter()
        .rev()
        .find(|diag| diag.code == DiagnosticCode::ResponseRejected)
        .and_then(|diag| diag.reason);
    match reason {
        Some(DiagnosticCode::InvalidJson) => ErrorClass::InvalidJson,
        Some(DiagnosticCode::MissingRequiredField) => ErrorClass::MissingField,
        _ => ErrorClass::SchemaInvalid,
    }
}
