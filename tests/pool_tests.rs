
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use probe_pool::config::PoolConfig;
use probe_pool::store::{JobStatus, JobStore, MemoryJobStore, SqliteJobStore, NO_RESULT_CODE};
use probe_pool::worker::{WorkerPhase, WorkerPool};
use probe_pool::PoolError;
use test_harness::{fast_pool_config, numbered_targets, targets, FlakyStore, StubExecutor};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_mixed_outcomes_with_two_workers() {
    let store = Arc::new(MemoryJobStore::new());
    let ids = store
        .enqueue(&targets(&["http://a", "http://b", "http://c"]))
        .await
        .unwrap();

    let executor = StubExecutor::new()
        .respond("http://a", 200)
        .respond("http://b", 200)
        .fail_after("http://c", "connection reset", Duration::from_millis(50));

    let pool = WorkerPool::new(fast_pool_config(2), store.clone(), Arc::new(executor)).unwrap();
    let completion = pool.take_completion().unwrap();
    pool.start(CancellationToken::new()).await.unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), completion.wait())
        .await
        .expect("pool should finish")
        .expect("completion should fire");
    assert_eq!(summary.jobs_processed, 3);
    assert_eq!(summary.lanes_failed, 0);
    assert!(!summary.cancelled);

    for id in &ids[..2] {
        let job = store.get(*id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_code, Some(200));
        assert!(job.error.is_none());
    }
    let c = store.get(ids[2]).await.unwrap().unwrap();
    assert_eq!(c.status, JobStatus::Failed);
    assert_eq!(c.error.as_deref(), Some("connection reset"));
    assert_eq!(c.result_code, Some(NO_RESULT_CODE));

    let terminal = store.list_terminal().await.unwrap();
    assert_eq!(terminal.len(), 3);
    assert_eq!(terminal[0].id, ids[2], "slowest job finished last");

    let mut listed: Vec<i64> = terminal.iter().map(|j| j.id).collect();
    listed.sort_unstable();
    assert_eq!(listed, ids);
    for pair in terminal.windows(2) {
        assert!(
            pair[0].finished_at >= pair[1].finished_at,
            "jobs {} and {} out of order",
            pair[0].id,
            pair[1].id
        );
    }

    let counts = store.counts().await.unwrap();
    assert!(summary.drained(&counts));

    let snapshot = pool.status_feed().snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot
        .values()
        .all(|w| w.phase == WorkerPhase::NoJobsAvailable));
}

#[tokio::test]
async fn test_empty_store_with_three_workers() {
    let store = Arc::new(MemoryJobStore::new());
    let executor = StubExecutor::new();
    let pool = WorkerPool::new(fast_pool_config(3), store.clone(), Arc::new(executor.clone())).unwrap();
    let completion = pool.take_completion().unwrap();

    pool.start(CancellationToken::new()).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(1), completion.wait())
        .await
        .expect("empty queue should drain immediately")
        .unwrap();

    assert_eq!(summary.jobs_processed, 0);
    assert_eq!(executor.calls(), 0);
    assert!(store.list_terminal().await.unwrap().is_empty());

    let snapshot = pool.status_feed().snapshot().await;
    assert_eq!(snapshot.len(), 3);
    for (id, status) in snapshot {
        assert_eq!(status.worker_id, id);
        assert_eq!(status.phase, WorkerPhase::NoJobsAvailable);
        assert!(status.job_id.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_workers_than_jobs() {
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    store.enqueue(&numbered_targets(3)).await.unwrap();

    let executor = StubExecutor::new().with_default_delay(Duration::from_millis(10));
    let pool = WorkerPool::new(fast_pool_config(8), store.clone(), Arc::new(executor.clone())).unwrap();

    let summary = pool.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.jobs_processed, 3);
    assert_eq!(executor.calls(), 3);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.pending + counts.processing + counts.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_executed_once_under_load() {
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    store.enqueue(&numbered_targets(100)).await.unwrap();

    let executor = StubExecutor::new();
    let pool = WorkerPool::new(fast_pool_config(6), store.clone(), Arc::new(executor.clone())).unwrap();
    let summary = pool.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.jobs_processed, 100);
    assert_eq!(executor.calls(), 100);
    assert_eq!(store.list_terminal().await.unwrap().len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observed_status_never_moves_backwards() {
    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    let store = Arc::new(MemoryJobStore::new());
    let ids = store.enqueue(&numbered_targets(20)).await.unwrap();
    let executor = StubExecutor::new()
        .with_default_delay(Duration::from_millis(5))
        .fail_after("http://host-3", "refused", Duration::from_millis(5));

    let pool = WorkerPool::new(fast_pool_config(4), store.clone(), Arc::new(executor)).unwrap();
    let completion = pool.take_completion().unwrap();

    let stop = CancellationToken::new();
    let observer = {
        let store = store.clone();
        let ids = ids.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut seen: HashMap<i64, Vec<JobStatus>> = HashMap::new();
            while !stop.is_cancelled() {
                for id in &ids {
                    let status = store.get(*id).await.unwrap().unwrap().status;
                    let history = seen.entry(*id).or_default();
                    if history.last() != Some(&status) {
                        history.push(status);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            seen
        })
    };

    pool.start(CancellationToken::new()).await.unwrap();
    completion.wait().await.unwrap();
    stop.cancel();
    let seen = observer.await.unwrap();

    for (id, history) in seen {
        for pair in history.windows(2) {
            assert!(
                rank(pair[0]) < rank(pair[1]),
                "job {} went {:?}",
                id,
                history
            );
        }
    }
    assert_eq!(store.counts().await.unwrap().terminal(), 20);
}

#[tokio::test]
async fn test_zero_workers_rejected_at_construction() {
    let store = Arc::new(MemoryJobStore::new());
    let result = WorkerPool::new(PoolConfig::new(0), store, Arc::new(StubExecutor::new()));
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

#[tokio::test]
async fn test_pool_starts_only_once() {
    let store = Arc::new(MemoryJobStore::new());
    let pool = WorkerPool::new(fast_pool_config(1), store, Arc::new(StubExecutor::new())).unwrap();

    let handle = pool.start(CancellationToken::new()).await.unwrap();
    handle.await.unwrap();

    assert!(matches!(
        pool.start(CancellationToken::new()).await,
        Err(PoolError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_completion_handed_out_once() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(&targets(&["http://a"])).await.unwrap();
    let pool = WorkerPool::new(fast_pool_config(2), store, Arc::new(StubExecutor::new())).unwrap();

    let completion = pool.take_completion();
    assert!(completion.is_some());
    assert!(pool.take_completion().is_none());

    let handle = pool.start(CancellationToken::new()).await.unwrap();
    let from_completion = completion.unwrap().wait().await.unwrap();
    let from_handle = handle.await.unwrap();
    assert_eq!(from_completion, from_handle);
    assert_eq!(from_completion.jobs_processed, 1);
}

#[tokio::test]
async fn test_completion_without_run_resolves_none() {
    let store = Arc::new(MemoryJobStore::new());
    let pool = WorkerPool::new(fast_pool_config(1), store, Arc::new(StubExecutor::new())).unwrap();
    let completion = pool.take_completion().unwrap();
    drop(pool);
    assert!(completion.wait().await.is_none());
}

#[tokio::test]
async fn test_transient_claim_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    store.enqueue(&targets(&["http://a", "http://b"])).await.unwrap();

    let pool = WorkerPool::new(fast_pool_config(1), store.clone(), Arc::new(StubExecutor::new())).unwrap();
    let summary = pool.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.jobs_processed, 2);
    assert_eq!(summary.lanes_failed, 0);
    // two failures, two jobs, one final empty claim
    assert_eq!(store.claim_attempts(), 5);
    assert_eq!(store.counts().await.unwrap().completed, 2);
}

#[tokio::test]
async fn test_persistent_claim_failure_stops_lane() {
    let store = Arc::new(FlakyStore::broken());
    store.enqueue(&targets(&["http://a"])).await.unwrap();

    let config = fast_pool_config(2);
    let max_attempts = config.claim_retry.max_attempts as usize;
    let pool = WorkerPool::new(config, store.clone(), Arc::new(StubExecutor::new())).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), pool.run(CancellationToken::new()))
        .await
        .expect("lanes must give up instead of spinning")
        .unwrap();

    assert_eq!(summary.jobs_processed, 0);
    assert_eq!(summary.lanes_failed, 2);
    assert_eq!(store.claim_attempts(), 2 * max_attempts);

    let snapshot = pool.status_feed().snapshot().await;
    assert!(snapshot.values().all(|w| w.phase == WorkerPhase::Error));
    assert_eq!(store.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_permanent_claim_failure_stops_lane_without_retry() {
    let store = Arc::new(FlakyStore::read_only());
    store.enqueue(&targets(&["http://a"])).await.unwrap();

    let pool = WorkerPool::new(fast_pool_config(2), store.clone(), Arc::new(StubExecutor::new())).unwrap();
    let summary = pool.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.jobs_processed, 0);
    assert_eq!(summary.lanes_failed, 2);
    assert_eq!(store.claim_attempts(), 2, "one claim per lane, no retries");

    let snapshot = pool.status_feed().snapshot().await;
    assert!(snapshot.values().all(|w| w.phase == WorkerPhase::Error));
}

#[tokio::test]
async fn test_failed_lanes_leave_run_undrained() {
    let store = Arc::new(FlakyStore::broken());
    store.enqueue(&targets(&["http://a", "http://b"])).await.unwrap();

    let pool = WorkerPool::new(fast_pool_config(2), store.clone(), Arc::new(StubExecutor::new())).unwrap();
    let summary = pool.run(CancellationToken::new()).await.unwrap();
    assert!(!summary.cancelled);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.pending, 2);
    assert!(!summary.drained(&counts), "unfinished jobs must be kept");
}

#[tokio::test]
async fn test_leftover_processing_job_leaves_run_undrained() {
    let store = Arc::new(MemoryJobStore::new());
    let ids = store.enqueue(&targets(&["http://a", "http://b"])).await.unwrap();
    // Claimed by a run that never completed it.
    let stale = store.claim_next().await.unwrap();
    assert_eq!(stale.id, ids[0]);

    let pool = WorkerPool::new(fast_pool_config(2), store.clone(), Arc::new(StubExecutor::new())).unwrap();
    let summary = pool.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.jobs_processed, 1);
    assert_eq!(summary.lanes_failed, 0);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.processing, 1);
    assert!(!summary.drained(&counts));
}

#[tokio::test]
async fn test_cancellation_stops_new_claims() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(&numbered_targets(10)).await.unwrap();

    let executor = StubExecutor::new().with_default_delay(Duration::from_millis(200));
    let pool = WorkerPool::new(fast_pool_config(2), store.clone(), Arc::new(executor)).unwrap();
    let completion = pool.take_completion().unwrap();

    let cancel = CancellationToken::new();
    pool.start(cancel.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), completion.wait())
        .await
        .expect("cancelled pool should finish once in-flight probes end")
        .unwrap();
    assert!(summary.cancelled);
    assert!(summary.jobs_processed >= 1 && summary.jobs_processed <= 2);

    // In-flight probes were allowed to finish and were recorded.
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.processing, 0);
    assert_eq!(counts.terminal(), summary.jobs_processed);
    assert_eq!(counts.pending, 10 - summary.jobs_processed);
}

#[tokio::test]
async fn test_cancellation_interrupts_pace_but_records_job() {
    let store = Arc::new(MemoryJobStore::new());
    let ids = store.enqueue(&targets(&["http://a", "http://b"])).await.unwrap();

    let config = fast_pool_config(1).with_pace(Duration::from_secs(30));
    let pool = WorkerPool::new(config, store.clone(), Arc::new(StubExecutor::new())).unwrap();

    let cancel = CancellationToken::new();
    let handle = pool.start(cancel.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pace must not outlive cancellation")
        .unwrap();
    assert_eq!(summary.jobs_processed, 1);

    let first = store.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    let second = store.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_status_feed_tracks_current_job() {
    let store = Arc::new(MemoryJobStore::new());
    let ids = store.enqueue(&targets(&["http://slow"])).await.unwrap();

    let executor = StubExecutor::new().with_default_delay(Duration::from_millis(200));
    let pool = WorkerPool::new(fast_pool_config(1), store, Arc::new(executor)).unwrap();
    let feed = pool.status_feed();

    let handle = pool.start(CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let busy = feed.get(0).await.unwrap();
    assert_eq!(busy.phase, WorkerPhase::Processing);
    assert_eq!(busy.job_id, Some(ids[0]));

    handle.await.unwrap();
    let done = feed.get(0).await.unwrap();
    assert_eq!(done.phase, WorkerPhase::NoJobsAvailable);
    assert!(done.job_id.is_none());
}
