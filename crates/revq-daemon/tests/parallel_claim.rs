//! Concurrency properties of the work queue: exactly-one-claimer, non-owner
//! no-ops, and lease-expiry recovery across independent connections to the
//! same database file.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use revq_core::retry::Stage;
use revq_daemon::queue::{MutationOutcome, WorkQueue, WorkStatus};
use revq_daemon::sweeper::sweep_once;
use revq_daemon::Store;

const LEASE: Duration = Duration::from_secs(10);

fn seed_job(store: &Store) -> i64 {
    store
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (idempotency_key, changelist_id, review_version, created_at_ms, updated_at_ms)
                 VALUES (hex(randomblob(8)), 1, 1, now_ms(), now_ms())",
                [],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .unwrap()
}

#[test]
fn test_every_item_claimed_by_exactly_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");

    let seed_store = Store::open(&db_path).unwrap();
    let job_id = seed_job(&seed_store);
    let seed_queue = WorkQueue::new(seed_store);
    const ITEMS: usize = 8;
    const WORKERS: usize = 4;
    for _ in 0..ITEMS {
        seed_queue
            .enqueue(job_id, Stage::Fetch, "{}", 0, None)
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let barrier = Arc::clone(&barrier);
        let db_path = db_path.clone();
        handles.push(thread::spawn(move || {
            // Each worker simulates a separate process: its own connection.
            let queue = WorkQueue::new(Store::open(&db_path).unwrap());
            let worker_id = format!("worker-{worker}");
            barrier.wait();
            let mut claimed = Vec::new();
            while let Some(item) = queue.claim(&worker_id, LEASE).unwrap() {
                claimed.push(item.work_id);
            }
            claimed
        }));
    }

    let mut all_claimed: Vec<i64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    all_claimed.sort_unstable();

    let mut deduped = all_claimed.clone();
    deduped.dedup();
    assert_eq!(all_claimed.len(), ITEMS, "every item claimed");
    assert_eq!(deduped.len(), ITEMS, "no item claimed twice");
}

#[test]
fn test_single_item_contended_claim_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("contended.db");

    let seed_store = Store::open(&db_path).unwrap();
    let job_id = seed_job(&seed_store);
    let work_id = WorkQueue::new(seed_store)
        .enqueue(job_id, Stage::Fetch, "{}", 0, None)
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let db_path = db_path.clone();
            thread::spawn(move || {
                let queue = WorkQueue::new(Store::open(&db_path).unwrap());
                barrier.wait();
                queue
                    .claim(&format!("worker-{worker}"), LEASE)
                    .unwrap()
                    .map(|item| item.work_id)
            })
        })
        .collect();

    let results: Vec<Option<i64>> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    let winners: Vec<i64> = results.into_iter().flatten().collect();
    assert_eq!(winners, vec![work_id]);
}

#[test]
fn test_crashed_worker_lease_expires_and_second_worker_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("crash.db");

    let store = Store::open(&db_path).unwrap();
    let job_id = seed_job(&store);
    let queue = WorkQueue::new(store);
    let work_id = queue.enqueue(job_id, Stage::Fetch, "{}", 0, None).unwrap();

    // W1 claims with a 10s lease and "crashes" (never heartbeats again).
    let w1_item = queue.claim("w1", LEASE).unwrap().unwrap();
    assert_eq!(w1_item.work_id, work_id);

    // Before expiry the item is invisible to other claimers and the sweeper.
    assert!(queue.claim("w2", LEASE).unwrap().is_none());
    assert_eq!(sweep_once(&queue).unwrap(), 0);

    queue.force_lease_expiry(work_id, -1).unwrap();
    assert_eq!(sweep_once(&queue).unwrap(), 1);

    // W2 claims and completes.
    let sweeper_store = Store::open(&db_path).unwrap();
    let w2_queue = WorkQueue::new(sweeper_store);
    let w2_item = w2_queue.claim("w2", LEASE).unwrap().unwrap();
    assert_eq!(w2_item.work_id, work_id);
    assert!(w2_queue.complete(work_id, "w2").unwrap().is_applied());

    // W1's late finalize and heartbeat are silent no-ops; one completion
    // only.
    assert!(!queue.heartbeat(work_id, "w1", LEASE).unwrap());
    let stale = queue.complete(work_id, "w1").unwrap();
    assert!(matches!(stale, MutationOutcome::Rejected(_)));
    assert_eq!(queue.get(work_id).unwrap().status, WorkStatus::Completed);
}

#[test]
fn test_sweeper_runs_concurrently_with_claims() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("concurrent-sweep.db");

    let store = Store::open(&db_path).unwrap();
    let job_id = seed_job(&store);
    let queue = WorkQueue::new(store);
    const ITEMS: usize = 6;
    for _ in 0..ITEMS {
        let work_id = queue.enqueue(job_id, Stage::Fetch, "{}", 0, None).unwrap();
        queue.claim("doomed", LEASE).unwrap().unwrap();
        queue.force_lease_expiry(work_id, -1).unwrap();
    }

    let barrier = Arc::new(Barrier::new(3));
    let sweeper = {
        let barrier = Arc::clone(&barrier);
        let db_path = db_path.clone();
        thread::spawn(move || {
            let queue = WorkQueue::new(Store::open(&db_path).unwrap());
            barrier.wait();
            let mut total = 0;
            for _ in 0..4 {
                total += sweep_once(&queue).unwrap();
            }
            total
        })
    };
    let claimers: Vec<_> = (0..2)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let db_path = db_path.clone();
            thread::spawn(move || {
                let queue = WorkQueue::new(Store::open(&db_path).unwrap());
                barrier.wait();
                let worker_id = format!("claimer-{worker}");
                let mut claimed = Vec::new();
                for _ in 0..ITEMS {
                    if let Some(item) = queue.claim(&worker_id, LEASE).unwrap() {
                        queue.complete(item.work_id, &worker_id).unwrap();
                        claimed.push(item.work_id);
                    }
                }
                claimed
            })
        })
        .collect();

    let _swept = sweeper.join().unwrap();
    let mut completed: Vec<i64> = claimers
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    completed.sort_unstable();
    completed.dedup();

    // Whatever was requeued before the claimers drained is completed at most
    // once; nothing is lost or double-owned.
    let store = Store::open(&db_path).unwrap();
    let queue = WorkQueue::new(store);
    for work_id in &completed {
        assert_eq!(queue.get(*work_id).unwrap().status, WorkStatus::Completed);
    }
}
