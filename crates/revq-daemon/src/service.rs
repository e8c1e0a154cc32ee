//! The in-process service contract.
//!
//! `submit_review` / `get_job` / `request_rerun` / `list_dead_letters` /
//! `replay` — the surface callers see. There is deliberately no HTTP or CLI
//! layer here; embedding applications own that.

use thiserror::Error;
use tracing::info;

use revq_core::retry::Stage;

use crate::dispatch::{DispatchError, Job, JobDispatch, SubmitStatus, Submission};
use crate::failure::{
    DeadLetter, DeadLetterFilter, FailureError, FailurePipeline, ReplayPlan, RestartMode,
};
use crate::queue::WorkQueue;
use crate::store::{Store, StoreError};
use crate::worker::StagePayload;

/// Errors surfaced by the service contract.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Job state machine violation.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Failure-pipeline violation (evidence guard, verification).
    #[error(transparent)]
    Failure(#[from] FailureError),

    /// Stage payload serialization failure.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A submission plus the enqueued work, when one was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// The dispatch decision and job row.
    pub submission: Submission,
    /// The fetch-stage work item, present iff a job was created.
    pub work_id: Option<i64>,
}

/// How a rerun request resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerunOutcome {
    /// A new job was created and enqueued.
    Allowed {
        /// The new job.
        job: Job,
        /// Its fetch-stage work item.
        work_id: i64,
    },
    /// Same version as the succeeded review; the prior job is returned.
    PriorJob(Job),
    /// The request was refused.
    Blocked {
        /// Stable reason label (`stale_review_version`, ...).
        reason: &'static str,
        /// The job that caused the refusal.
        prior: Job,
    },
}

/// The exposed in-process service.
#[derive(Debug, Clone)]
pub struct ReviewService {
    dispatch: JobDispatch,
    queue: WorkQueue,
    failure: FailurePipeline,
}

impl ReviewService {
    /// Creates the service over the store.
    #[must_use]
    pub fn new(store: &Store) -> Self {
        Self {
            dispatch: JobDispatch::new(store.clone()),
            queue: WorkQueue::new(store.clone()),
            failure: FailurePipeline::new(store.clone()),
        }
    }

    /// Submits a review request. Duplicate idempotency keys return the
    /// existing job without enqueueing anything.
    pub fn submit_review(
        &self,
        idempotency_key: &str,
        changelist_id: i64,
        review_version: i64,
        recipients: &[String],
        priority: i64,
    ) -> Result<SubmitOutcome, ServiceError> {
        let submission =
            self.dispatch
                .submit(idempotency_key, changelist_id, review_version, false)?;
        let work_id = if submission.created {
            Some(self.enqueue_fetch(&submission.job, recipients, priority)?)
        } else {
            None
        };
        Ok(SubmitOutcome {
            submission,
            work_id,
        })
    }

    /// Requests a versioned rerun over a previously succeeded review.
    pub fn request_rerun(
        &self,
        idempotency_key: &str,
        changelist_id: i64,
        new_review_version: i64,
        recipients: &[String],
        priority: i64,
    ) -> Result<RerunOutcome, ServiceError> {
        let submission =
            self.dispatch
                .submit(idempotency_key, changelist_id, new_review_version, true)?;
        Ok(match submission.status {
            SubmitStatus::Created => {
                let work_id = self.enqueue_fetch(&submission.job, recipients, priority)?;
                info!(
                    job_id = submission.job.job_id,
                    changelist_id, new_review_version, "rerun granted"
                );
                RerunOutcome::Allowed {
                    job: submission.job,
                    work_id,
                }
            }
            SubmitStatus::DuplicateIdempotency => RerunOutcome::Blocked {
                reason: "duplicate_idempotency",
                prior: submission.job,
            },
            SubmitStatus::AlreadySucceededSameVersion => RerunOutcome::PriorJob(submission.job),
            SubmitStatus::RerunRequired => RerunOutcome::Blocked {
                reason: "rerun_required",
                prior: submission.job,
            },
            SubmitStatus::StaleReviewVersion => RerunOutcome::Blocked {
                reason: "stale_review_version",
                prior: submission.job,
            },
        })
    }

    /// Fetches a job by id.
    pub fn get_job(&self, job_id: i64) -> Result<Job, ServiceError> {
        Ok(self.dispatch.get_job(job_id)?)
    }

    /// Lists dead letters for operator triage.
    pub fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetter>, ServiceError> {
        Ok(self.failure.list_dead_letters(filter)?)
    }

    /// Grants an operator replay of a dead letter.
    pub fn replay(
        &self,
        dl_id: i64,
        restart_mode: RestartMode,
        remediation_evidence_ref: &str,
    ) -> Result<ReplayPlan, ServiceError> {
        Ok(self
            .failure
            .replay(dl_id, restart_mode, remediation_evidence_ref)?)
    }

    fn enqueue_fetch(
        &self,
        job: &Job,
        recipients: &[String],
        priority: i64,
    ) -> Result<i64, ServiceError> {
        let payload = StagePayload {
            job_id: job.job_id,
            changelist_id: job.changelist_id,
            review_version: job.review_version,
            recipients: recipients.to_vec(),
            priority,
            changed_files: Vec::new(),
            diffs: Vec::new(),
        };
        let encoded = serde_json::to_string(&payload)?;
        Ok(self
            .queue
            .enqueue(job.job_id, Stage::Fetch, &encoded, priority, None)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkStatus;

    fn service() -> (ReviewService, Store) {
        let store = Store::in_memory().unwrap();
        (ReviewService::new(&store), store)
    }

    fn recipients() -> Vec<String> {
        vec!["reviewer@example.com".to_string()]
    }

    #[test]
    fn test_submit_review_enqueues_fetch_once() {
        let (service, store) = service();
        let first = service
            .submit_review("cl42-v1", 42, 1, &recipients(), 5)
            .unwrap();
        assert!(first.submission.created);
        let work_id = first.work_id.unwrap();

        let queue = WorkQueue::new(store.clone());
        let item = queue.get(work_id).unwrap();
        assert_eq!(item.status, WorkStatus::Queued);
        assert_eq!(item.stage, Stage::Fetch);
        assert_eq!(item.priority, 5);
        let payload: StagePayload = serde_json::from_str(&item.payload).unwrap();
        assert_eq!(payload.changelist_id, 42);
        assert_eq!(payload.recipients, recipients());

        let dup = service
            .submit_review("cl42-v1", 42, 1, &recipients(), 5)
            .unwrap();
        assert!(!dup.submission.created);
        assert!(dup.work_id.is_none());
        assert_eq!(dup.submission.job.job_id, first.submission.job.job_id);
    }

    #[test]
    fn test_request_rerun_blocked_without_prior_success_path() {
        let (service, _store) = service();
        let v1 = service
            .submit_review("cl7-v1", 7, 1, &recipients(), 0)
            .unwrap();
        // No succeeded review yet: a rerun with a fresh key simply creates a
        // new job under the same version.
        let outcome = service
            .request_rerun("cl7-v1-again", 7, 1, &recipients(), 0)
            .unwrap();
        let RerunOutcome::Allowed { job, .. } = outcome else {
            panic!("expected Allowed, got {outcome:?}");
        };
        assert_ne!(job.job_id, v1.submission.job.job_id);
    }
}
