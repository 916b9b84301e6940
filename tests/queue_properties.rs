//! End-to-end queue behavior over a real database file.
//!
//! These tests exercise the claim protocol, lease recovery, retry handling
//! and scheduling strategies against a temporary SQLite store, including the
//! concurrency guarantees the queue is built around.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;

use taskforge::scheduler::{
    FailureKind, NewTask, RetryPolicy, SchedulingStrategy, TaskEvent, TaskStatus,
};
use taskforge::storage::{ClaimRequest, FailureDisposition, StoreConfig, StoreError, TaskStore};

async fn open_store() -> (TaskStore, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let store = TaskStore::open(dir.path().join("queue.db"), StoreConfig::default())
        .await
        .expect("open store");
    (store, dir)
}

fn claim<'a>(worker_id: &'a str, strategy: SchedulingStrategy) -> ClaimRequest<'a> {
    ClaimRequest {
        worker_id,
        strategy,
        lease: Duration::from_secs(60),
        task_types: None,
    }
}

/// An immediate-retry policy so retried tasks are claimable right away.
fn instant_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::ZERO).with_jitter(0.0)
}

#[tokio::test]
async fn exactly_one_claim_per_task() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{i}");
            store
                .claim(&claim(&worker_id, SchedulingStrategy::Fifo))
                .await
                .expect("claim")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join").is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimant must win the lease");
}

#[tokio::test]
async fn concurrent_claimants_never_duplicate() {
    let (store, _dir) = open_store().await;
    for i in 0..20 {
        store
            .enqueue(NewTask::new("t", json!({"n": i})))
            .await
            .expect("enqueue");
    }

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let seen = Arc::clone(&seen);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{i}");
            loop {
                match store
                    .claim(&claim(&worker_id, SchedulingStrategy::Fifo))
                    .await
                    .expect("claim")
                {
                    Some(task) => {
                        seen.lock().await.push(task.id);
                        store
                            .complete(task.id, &worker_id, json!(null))
                            .await
                            .expect("complete");
                    }
                    None => break,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let seen = seen.lock().await;
    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 20, "all tasks claimed");
    assert_eq!(unique.len(), 20, "no task claimed twice");
}

#[tokio::test]
async fn expired_lease_is_reclaimable_but_not_before() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");

    let short_lease = ClaimRequest {
        worker_id: "w1",
        strategy: SchedulingStrategy::Fifo,
        lease: Duration::from_millis(300),
        task_types: None,
    };
    let task = store
        .claim(&short_lease)
        .await
        .expect("claim")
        .expect("task available");

    // Lease is live: a second claimant sees no work.
    assert!(store
        .claim(&claim("w2", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let reclaimed = store
        .claim(&claim("w2", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("expired lease must be reclaimable");
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
}

#[tokio::test]
async fn retry_exhaustion_dead_letters_at_max_attempts() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})).with_max_attempts(2))
        .await
        .expect("enqueue");
    let policy = instant_retry();

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    let first = store
        .fail(task.id, "w1", FailureKind::Retryable, "boom", &policy)
        .await
        .expect("fail");
    assert!(matches!(first, FailureDisposition::Retried { .. }));

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("retried task claimable again");
    let second = store
        .fail(task.id, "w1", FailureKind::Retryable, "boom", &policy)
        .await
        .expect("fail");
    assert_eq!(second, FailureDisposition::DeadLettered);

    let task = store.task(task.id).await.expect("fetch");
    assert_eq!(task.status, TaskStatus::Dead);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_deref(), Some("boom"));

    // Dead tasks are never claimable.
    assert!(store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .is_none());
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})).with_max_attempts(5))
        .await
        .expect("enqueue");

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    let disposition = store
        .fail(
            task.id,
            "w1",
            FailureKind::Permanent,
            "invalid params",
            &instant_retry(),
        )
        .await
        .expect("fail");

    assert_eq!(disposition, FailureDisposition::DeadLettered);
    let task = store.task(task.id).await.expect("fetch");
    assert_eq!(task.status, TaskStatus::Dead);
    assert_eq!(task.attempts, 1, "dead after exactly one attempt");
}

#[tokio::test]
async fn fifo_and_lifo_orders_are_exact_reverses() {
    let (store, _dir) = open_store().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let enqueued = store
            .enqueue(NewTask::new("t", json!({"n": i})))
            .await
            .expect("enqueue");
        ids.push(enqueued.id);
    }

    let mut fifo_order = Vec::new();
    while let Some(task) = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
    {
        fifo_order.push(task.id);
        store
            .complete(task.id, "w1", json!(null))
            .await
            .expect("complete");
    }
    assert_eq!(fifo_order, ids, "FIFO claims in enqueue order");

    // Re-enqueue the same shape and drain LIFO.
    let mut ids = Vec::new();
    for i in 0..4 {
        let enqueued = store
            .enqueue(NewTask::new("t", json!({"n": i})))
            .await
            .expect("enqueue");
        ids.push(enqueued.id);
    }
    let mut lifo_order = Vec::new();
    while let Some(task) = store
        .claim(&claim("w1", SchedulingStrategy::Lifo))
        .await
        .expect("claim")
    {
        lifo_order.push(task.id);
        store
            .complete(task.id, "w1", json!(null))
            .await
            .expect("complete");
    }
    ids.reverse();
    assert_eq!(lifo_order, ids, "LIFO claims newest first");
}

#[tokio::test]
async fn priority_strategy_serves_lowest_value_first() {
    let (store, _dir) = open_store().await;
    for priority in [5, 1, 3] {
        store
            .enqueue(NewTask::new("t", json!({})).with_priority(priority))
            .await
            .expect("enqueue");
    }

    let mut order = Vec::new();
    while let Some(task) = store
        .claim(&claim("w1", SchedulingStrategy::Priority))
        .await
        .expect("claim")
    {
        order.push(task.priority);
        store
            .complete(task.id, "w1", json!(null))
            .await
            .expect("complete");
    }
    assert_eq!(order, vec![1, 3, 5]);
}

#[tokio::test]
async fn weighted_random_drains_all_tasks() {
    let (store, _dir) = open_store().await;
    for priority in [0, 1, 2, 3, 4] {
        store
            .enqueue(NewTask::new("t", json!({})).with_priority(priority))
            .await
            .expect("enqueue");
    }

    let strategy = SchedulingStrategy::WeightedRandom { top_k: 3 };
    let mut claimed = HashSet::new();
    while let Some(task) = store.claim(&claim("w1", strategy)).await.expect("claim") {
        claimed.insert(task.id);
        store
            .complete(task.id, "w1", json!(null))
            .await
            .expect("complete");
    }
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn idempotency_key_deduplicates_enqueue() {
    let (store, _dir) = open_store().await;

    let first = store
        .enqueue(NewTask::new("t", json!({"a": 1})).with_idempotency_key("job-1"))
        .await
        .expect("enqueue");
    let second = store
        .enqueue(NewTask::new("t", json!({"a": 2})).with_idempotency_key("job-1"))
        .await
        .expect("enqueue");

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.id, second.id);

    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.total(), 1, "exactly one stored task");
}

#[tokio::test]
async fn delayed_task_is_unclaimable_until_due() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(
            NewTask::new("t", json!({}))
                .with_run_after(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .expect("enqueue");

    assert!(store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .is_none());
}

#[tokio::test]
async fn cancel_is_allowed_only_while_queued() {
    let (store, _dir) = open_store().await;
    let queued = store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");
    store.cancel(queued.id).await.expect("cancel queued");

    let task = store.task(queued.id).await.expect("fetch");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("cancelled by operator"));

    // A leased task cannot be cancelled out from under its worker.
    let leased = store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");
    store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    let err = store.cancel(leased.id).await.expect_err("cancel must fail");
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            status: TaskStatus::Leased,
            ..
        }
    ));
}

#[tokio::test]
async fn requeue_dead_resets_the_attempt_budget() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})).with_max_attempts(1))
        .await
        .expect("enqueue");

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    store
        .fail(task.id, "w1", FailureKind::Retryable, "boom", &instant_retry())
        .await
        .expect("fail");
    assert_eq!(
        store.task(task.id).await.expect("fetch").status,
        TaskStatus::Dead
    );

    store.requeue_dead(task.id).await.expect("requeue");
    let task = store.task(task.id).await.expect("fetch");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 0);
    assert!(task.last_error.is_none());

    // Requeue is for dead tasks only.
    let err = store
        .requeue_dead(task.id)
        .await
        .expect_err("requeue of a queued task must fail");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn completion_requires_the_lease_holder() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");
    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");

    let err = store
        .complete(task.id, "w2", json!(null))
        .await
        .expect_err("wrong worker must not complete");
    assert!(matches!(err, StoreError::LeaseNotHeld { .. }));

    let err = store
        .extend_lease(task.id, "w2", Duration::from_secs(30))
        .await
        .expect_err("wrong worker must not renew");
    assert!(matches!(err, StoreError::LeaseNotHeld { .. }));

    store
        .complete(task.id, "w1", json!({"ok": true}))
        .await
        .expect("holder completes");
    let task = store.task(task.id).await.expect("fetch");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn task_type_filter_restricts_claims() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("scrape.page", json!({})))
        .await
        .expect("enqueue");
    store
        .enqueue(NewTask::new("score.item", json!({})))
        .await
        .expect("enqueue");

    let types = vec!["score.item".to_string()];
    let request = ClaimRequest {
        worker_id: "w1",
        strategy: SchedulingStrategy::Fifo,
        lease: Duration::from_secs(60),
        task_types: Some(&types),
    };

    let task = store
        .claim(&request)
        .await
        .expect("claim")
        .expect("matching task");
    assert_eq!(task.task_type, "score.item");
    assert!(store.claim(&request).await.expect("claim").is_none());
}

#[tokio::test]
async fn every_claim_commits_with_exactly_one_audit_entry() {
    let (store, _dir) = open_store().await;
    let mut ids = Vec::new();
    for _ in 0..12 {
        let enqueued = store
            .enqueue(NewTask::new("t", json!({})))
            .await
            .expect("enqueue");
        ids.push(enqueued.id);
    }

    let mut handles = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{i}");
            let mut won = Vec::new();
            while let Some(task) = store
                .claim(&claim(&worker_id, SchedulingStrategy::Fifo))
                .await
                .expect("claim")
            {
                won.push(task.id);
            }
            won
        }));
    }
    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.expect("join"));
    }
    claimed.sort_unstable();
    assert_eq!(claimed, ids);

    // The lease and its audit entry land together, even under contention.
    for id in ids {
        let log = store.task_log(id).await.expect("task log");
        let claimed_events = log
            .iter()
            .filter(|entry| entry.event == TaskEvent::Claimed)
            .count();
        assert_eq!(claimed_events, 1, "task {id} claimed-event count");
    }
}

#[tokio::test]
async fn audit_log_records_the_lifecycle() {
    let (store, _dir) = open_store().await;
    let enqueued = store
        .enqueue(NewTask::new("t", json!({})).with_max_attempts(2))
        .await
        .expect("enqueue");
    let policy = instant_retry();

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    store
        .fail(task.id, "w1", FailureKind::Retryable, "boom", &policy)
        .await
        .expect("fail");
    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    store
        .complete(task.id, "w1", json!(null))
        .await
        .expect("complete");

    let events: Vec<TaskEvent> = store
        .task_log(enqueued.id)
        .await
        .expect("log")
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert_eq!(
        events,
        vec![
            TaskEvent::Claimed,
            TaskEvent::Failed,
            TaskEvent::Retried,
            TaskEvent::Claimed,
            TaskEvent::Succeeded,
        ]
    );
}

#[tokio::test]
async fn worker_registry_tracks_heartbeats() {
    let (store, _dir) = open_store().await;
    store
        .register_worker("host-a", &["scrape.page".to_string()], Some("eu-west"))
        .await
        .expect("register");

    let before = store.list_workers().await.expect("list")[0].last_heartbeat;
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.worker_heartbeat("host-a").await.expect("heartbeat");

    let workers = store.list_workers().await.expect("list");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].region.as_deref(), Some("eu-west"));
    assert!(workers[0].last_heartbeat > before);

    let err = store
        .worker_heartbeat("host-b")
        .await
        .expect_err("unknown worker");
    assert!(matches!(err, StoreError::WorkerNotRegistered(_)));

    store.remove_worker("host-a").await.expect("remove");
    assert!(store.list_workers().await.expect("list").is_empty());
}

#[tokio::test]
async fn maintenance_prunes_only_old_log_entries() {
    let (store, _dir) = open_store().await;
    store
        .enqueue(NewTask::new("t", json!({})))
        .await
        .expect("enqueue");
    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task");
    store
        .complete(task.id, "w1", json!(null))
        .await
        .expect("complete");

    // Entries are fresh; a one-day retention removes nothing.
    let pruned = store
        .prune_logs(chrono::Duration::days(1))
        .await
        .expect("prune");
    assert_eq!(pruned, 0);
    assert_eq!(store.task_log(task.id).await.expect("log").len(), 2);

    // Zero retention removes everything.
    let pruned = store
        .prune_logs(chrono::Duration::zero())
        .await
        .expect("prune");
    assert_eq!(pruned, 2);

    store.checkpoint().await.expect("checkpoint");
}

#[tokio::test]
async fn store_reopens_with_state_intact() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("queue.db");

    {
        let store = TaskStore::open(&path, StoreConfig::default())
            .await
            .expect("open");
        store
            .enqueue(NewTask::new("t", json!({"n": 1})))
            .await
            .expect("enqueue");
    }

    let store = TaskStore::open(&path, StoreConfig::default())
        .await
        .expect("reopen");
    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.queued, 1);

    let task = store
        .claim(&claim("w1", SchedulingStrategy::Fifo))
        .await
        .expect("claim")
        .expect("task survived restart");
    assert_eq!(task.params, json!({"n": 1}));
}
