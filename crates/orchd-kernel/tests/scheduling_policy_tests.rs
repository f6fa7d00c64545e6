//! Completion-order scenarios: a held slot, a backlog, and the two
//! policies deciding who goes next.

mod common;

use std::time::Duration;

use orchd_client::{submit, SubmitMode, SubmitOutcome};
use orchd_kernel::Policy;

use common::TestServer;

const TIMEOUT: Duration = Duration::from_secs(20);

/// Submit one slot-holding sleep, then ten quick tasks with descending
/// expected times (99, 98, …, 90 ms) while the sleep blocks the single
/// slot. Returns the log order of ids once everything completed.
async fn held_slot_backlog(policy: Policy) -> Vec<u32> {
    let server = TestServer::start(1, policy);

    let outcome = submit(server.paths.clone(), "sleep 1", 1, SubmitMode::Single)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Scheduled(1));

    for k in (90..=99).rev() {
        let outcome = submit(server.paths.clone(), "echo hi", k, SubmitMode::Single)
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Scheduled(_)));
    }

    let records = server.wait_for_log_count(11, TIMEOUT).await;
    records.iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn sjf_serves_the_backlog_shortest_first() {
    // ids 2..=11 carry expected times 99..=90, so shortest-first means
    // highest id first.
    let order = held_slot_backlog(Policy::Sjf).await;
    assert_eq!(order, vec![1, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2]);
}

#[tokio::test]
async fn fcfs_serves_the_backlog_in_arrival_order() {
    let order = held_slot_backlog(Policy::Fcfs).await;
    assert_eq!(order, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
}

#[tokio::test]
async fn wider_slot_tables_run_tasks_concurrently() {
    let server = TestServer::start(3, Policy::Fcfs);

    // Three half-second sleeps; with three slots they overlap, so the
    // whole batch finishes far sooner than sequentially.
    let started = std::time::Instant::now();
    for _ in 0..3 {
        submit(server.paths.clone(), "sleep 0.5", 500, SubmitMode::Single)
            .await
            .unwrap();
    }
    server.wait_for_log_count(3, TIMEOUT).await;
    assert!(
        started.elapsed() < Duration::from_millis(1400),
        "three sleeps did not overlap: {:?}",
        started.elapsed()
    );
}
