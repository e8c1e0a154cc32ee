//! # revq-daemon
//!
//! Durable coordination core for the revq review pipeline. All cross-worker
//! coordination is expressed against the SQLite store — locked claims, unique
//! indexes, and owner-guarded updates — so correctness survives process
//! restarts. No in-process lock substitutes for a store predicate.
//!
//! Components, leaves first:
//!
//! - [`store`]: transactional persistence and the store clock
//! - [`queue`]: durable work queue with lease-based mutual exclusion
//! - [`dispatch`]: job creation, idempotency dedupe, versioned rerun gate
//! - [`outbox`]: per-recipient delivery log with send-then-mark semantics
//! - [`failure`]: error classification, dead letters, operator replay
//! - [`sweeper`]: lease-expiry sweeper restoring queue capacity
//! - [`worker`]: the claim → process → finalize runtime
//! - [`service`]: the in-process contract exposed to callers
//! - [`audit`]: append-only audit trail

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod dispatch;
pub mod failure;
pub mod outbox;
pub mod queue;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use service::ReviewService;
pub use store::Store;
