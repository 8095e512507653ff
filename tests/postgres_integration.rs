//! Integration tests against a real PostgreSQL database.
//!
//! Each test uses its own queue names, so they can share one database.
//! Run with: PGTASK_TEST_DATABASE_URL=postgres://localhost/pgtask_test cargo test --test postgres_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use pgtask::broker::{Broker, EnqueueRequest, Wake};
use pgtask::scheduler::{paused_next_run, NewSchedule, ScheduleStore, Scheduler, TickOutcome};
use pgtask::storage::{Database, DatabaseError, TaskState};
use pgtask::BrokerError;
use pgtask::worker::{actor_fn, ActorRegistry, ActorSpec, WorkerPool, WorkerPoolConfig};
use tokio::sync::OnceCell;
use uuid::Uuid;

const PREFIX: &str = "pgtask";

static MIGRATED: OnceCell<()> = OnceCell::const_new();

fn get_test_database_url() -> String {
    std::env::var("PGTASK_TEST_DATABASE_URL")
        .expect("PGTASK_TEST_DATABASE_URL environment variable must be set for integration tests")
}

async fn create_test_database() -> Database {
    MIGRATED
        .get_or_init(|| async {
            let db = Database::connect(&get_test_database_url())
                .await
                .expect("Should connect for migrations");
            db.run_migrations(PREFIX)
                .await
                .expect("Migrations should apply");
            db.close().await;
        })
        .await;

    Database::connect(&get_test_database_url())
        .await
        .expect("Should connect to test database")
}

fn unique_queue(label: &str) -> String {
    format!("{}_{}", label, &Uuid::new_v4().simple().to_string()[..12])
}

/// Ticks until this process wins the lock; other tests may be ticking too.
async fn tick_as_leader(scheduler: &Scheduler) -> usize {
    for _ in 0..50 {
        match scheduler.tick().await.expect("Tick should succeed") {
            TickOutcome::Dispatched(count) => return count,
            TickOutcome::NotLeader => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    panic!("Never became scheduler leader");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_integration -- --ignored
async fn test_concurrent_claims_hand_out_one_row() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("claim");

    let id = broker
        .enqueue(&queue, "claim.actor", b"[]".to_vec(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");

    let actors = vec!["claim.actor".to_string()];
    let (a, b) = tokio::join!(
        broker.tasks().claim(&queue, &actors),
        broker.tasks().claim(&queue, &actors)
    );
    let claimed: Vec<_> = [a.expect("claim a"), b.expect("claim b")]
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(claimed.len(), 1, "Exactly one claim should win");
    assert_eq!(claimed[0].message_id, id);
    assert_eq!(claimed[0].state, TaskState::Consumed);

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_claim_skips_future_eta_and_unknown_actors() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("eta");

    broker
        .enqueue_request(
            EnqueueRequest::new(&queue, "eta.actor").with_delay(Duration::from_secs(3600)),
        )
        .await
        .expect("Delayed enqueue should succeed");
    broker
        .enqueue(&queue, "someone.else", Vec::new(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");

    let claimed = broker
        .tasks()
        .claim(&queue, &["eta.actor".to_string()])
        .await
        .expect("Claim should succeed");
    assert!(claimed.is_none(), "Delayed and foreign tasks are not claimable");

    let stats = broker.queue_stats(&queue).await.expect("stats");
    assert_eq!(stats.queued, 2);

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_enqueue_notifies_only_after_commit() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("notify");

    let mut subscription = broker
        .subscribe(&[queue.clone()])
        .await
        .expect("Subscribe should succeed");

    let mut tx = db.pool().begin().await.expect("begin");
    let id = broker
        .enqueue_in(&mut *tx, EnqueueRequest::new(&queue, "notify.actor"))
        .await
        .expect("Enqueue in transaction should succeed");

    let wake = subscription
        .next_wake(Duration::from_millis(300))
        .await
        .expect("wait");
    assert_eq!(wake, Wake::TimedOut, "No notification before commit");

    tx.commit().await.expect("commit");

    let wake = subscription
        .next_wake(Duration::from_secs(5))
        .await
        .expect("wait");
    match wake {
        Wake::Notified {
            queue_channel,
            message_id,
        } => {
            assert_eq!(message_id, id);
            assert_eq!(queue_channel, format!("{}.tasks.{}.enqueue", PREFIX, queue));
        }
        other => panic!("Expected a notification, got {:?}", other),
    }

    // The listener holds a pool connection until dropped.
    drop(subscription);
    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_rolled_back_enqueue_leaves_nothing() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("rollback");

    let mut tx = db.pool().begin().await.expect("begin");
    let id = broker
        .enqueue_in(&mut *tx, EnqueueRequest::new(&queue, "rollback.actor"))
        .await
        .expect("Enqueue in transaction should succeed");
    tx.rollback().await.expect("rollback");

    assert!(broker.tasks().get(id).await.expect("get").is_none());

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_result_round_trip() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("result");

    let id = broker
        .enqueue(&queue, "result.actor", Vec::new(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");
    assert!(broker.fetch_result(id).await.expect("fetch").is_none());

    let task = broker
        .tasks()
        .claim(&queue, &["result.actor".to_string()])
        .await
        .expect("claim")
        .expect("Task should be claimable");
    broker
        .tasks()
        .complete(task.message_id, Some(b"42"), Some(Duration::from_secs(60)))
        .await
        .expect("Complete should succeed");

    let result = broker
        .fetch_result(id)
        .await
        .expect("fetch")
        .expect("Result should be stored");
    assert_eq!(result.payload, b"42".to_vec());
    assert!(result.expiry.is_some());
    assert!(!result.is_expired(Utc::now()));

    let unknown = broker.fetch_result(Uuid::new_v4()).await.expect("fetch");
    assert!(unknown.is_none());

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_requeue_counts_retry() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("retry");
    let actors = vec!["retry.actor".to_string()];

    let id = broker
        .enqueue(&queue, "retry.actor", Vec::new(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");
    broker
        .tasks()
        .claim(&queue, &actors)
        .await
        .expect("claim")
        .expect("Task should be claimable");
    broker
        .tasks()
        .reject(id, true, None)
        .await
        .expect("Requeue should succeed");

    let task = broker
        .tasks()
        .claim(&queue, &actors)
        .await
        .expect("claim")
        .expect("Requeued task should be claimable");
    assert_eq!(task.retries, 1);

    broker
        .tasks()
        .reject(id, false, None)
        .await
        .expect("Reject should succeed");
    let task = broker.tasks().get(id).await.expect("get").expect("row");
    assert_eq!(task.state, TaskState::Rejected);

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_reenqueue_of_consumed_task_is_refused() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("inflight");
    let actors = vec!["inflight.actor".to_string()];

    let id = broker
        .enqueue(&queue, "inflight.actor", Vec::new(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");
    broker
        .tasks()
        .claim(&queue, &actors)
        .await
        .expect("claim")
        .expect("Task should be claimable");

    let err = broker
        .enqueue_request(EnqueueRequest::new(&queue, "inflight.actor").with_message_id(id))
        .await
        .expect_err("Re-enqueue of a consumed task should fail");
    assert!(matches!(
        err,
        BrokerError::Database(DatabaseError::InFlight(failed)) if failed == id
    ));

    let second = broker.tasks().claim(&queue, &actors).await.expect("claim");
    assert!(second.is_none(), "The in-flight task must not be handed out again");
    let task = broker.tasks().get(id).await.expect("get").expect("row");
    assert_eq!(task.state, TaskState::Consumed);

    // Once finished it may be re-queued under the same id.
    broker
        .tasks()
        .reject(id, false, None)
        .await
        .expect("Reject should succeed");
    broker
        .enqueue_request(EnqueueRequest::new(&queue, "inflight.actor").with_message_id(id))
        .await
        .expect("Re-enqueue of a finished task should succeed");
    let task = broker.tasks().get(id).await.expect("get").expect("row");
    assert_eq!(task.state, TaskState::Queued);

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_expire_orphans_spares_delayed_tasks() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("orphan");

    let delayed = broker
        .enqueue_request(
            EnqueueRequest::new(&queue, "orphan.actor").with_delay(Duration::from_secs(3600)),
        )
        .await
        .expect("Delayed enqueue should succeed");
    let stale = broker
        .enqueue(&queue, "orphan.actor", Vec::new(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");

    sqlx::query("UPDATE tasks SET mtime = NOW() - INTERVAL '2 days' WHERE queue_name = $1")
        .bind(&queue)
        .execute(db.pool())
        .await
        .expect("Backdate should succeed");

    broker
        .tasks()
        .expire_orphans(Duration::from_secs(24 * 3600))
        .await
        .expect("Expire should succeed");

    let task = broker.tasks().get(delayed).await.expect("get").expect("row");
    assert_eq!(task.state, TaskState::Queued);
    let task = broker.tasks().get(stale).await.expect("get").expect("row");
    assert_eq!(task.state, TaskState::Rejected);

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_pause_is_idempotent() {
    let db = create_test_database().await;
    let store = ScheduleStore::new(db.pool().clone());
    let uid = unique_queue("pause");

    let schedule = store
        .create(NewSchedule::new(&uid, "pause.actor", "*/5 * * * *"))
        .await
        .expect("Create should succeed");
    assert!(schedule.next_run > Utc::now());

    let first = store.set_paused(schedule.id, true).await.expect("pause");
    let second = store.set_paused(schedule.id, true).await.expect("pause again");
    assert!(first.paused && second.paused);
    assert_eq!(first.next_run, paused_next_run());
    assert_eq!(second.next_run, paused_next_run());

    let resumed = store.set_paused(schedule.id, false).await.expect("resume");
    assert!(!resumed.paused);
    assert!(resumed.next_run > Utc::now());
    assert_eq!(resumed.next_run.minute() % 5, 0);

    assert!(store.delete(schedule.id).await.expect("delete"));
    assert!(!store.delete(schedule.id).await.expect("delete again"));

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_tick_without_lock_is_not_leader() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let scheduler = Scheduler::new(db.pool().clone(), broker);

    let mut tx = db.pool().begin().await.expect("begin");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(scheduler.lock_key())
        .execute(&mut *tx)
        .await
        .expect("Lock should be taken");

    let outcome = scheduler.tick().await.expect("Tick should succeed");
    assert_eq!(outcome, TickOutcome::NotLeader);

    tx.rollback().await.expect("rollback");
    tick_as_leader(&scheduler).await;

    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_due_schedule_is_dispatched_and_advanced() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let store = ScheduleStore::new(db.pool().clone());
    let queue = unique_queue("cron");

    let schedule = store
        .create(NewSchedule::new(&queue, "cron.actor", "*/5 * * * *").with_queue(&queue))
        .await
        .expect("Create should succeed");

    // Make it overdue by more than one period.
    sqlx::query("UPDATE schedules SET next_run = NOW() - INTERVAL '7 minutes' WHERE id = $1")
        .bind(schedule.id)
        .execute(db.pool())
        .await
        .expect("Backdate should succeed");

    let scheduler = Scheduler::new(db.pool().clone(), broker.clone());
    let dispatched = tick_as_leader(&scheduler).await;
    assert!(dispatched >= 1);

    // One task, not one per missed period.
    let stats = broker.queue_stats(&queue).await.expect("stats");
    assert_eq!(stats.queued, 1);

    let advanced = store
        .get(schedule.id)
        .await
        .expect("get")
        .expect("Schedule should exist");
    assert!(advanced.next_run > Utc::now());
    assert_eq!(advanced.next_run.minute() % 5, 0);
    assert_eq!(advanced.next_run.second(), 0);

    store.delete(schedule.id).await.expect("delete");
    db.close().await;
}

#[tokio::test]
#[ignore]
async fn test_worker_pool_runs_task_to_result() {
    let db = create_test_database().await;
    let broker = Broker::new(db.pool().clone(), PREFIX);
    let queue = unique_queue("pool");

    let mut registry = ActorRegistry::new();
    registry
        .register(actor_fn(
            ActorSpec::new("pool.upper").with_queue(&queue),
            |ctx| async move { Ok(Some(ctx.message.args.to_ascii_uppercase())) },
        ))
        .expect("register");

    let config = WorkerPoolConfig::new(2)
        .with_queues(vec![queue.clone()])
        .with_listen_timeout(Duration::from_secs(1));
    let mut pool =
        WorkerPool::new(config, broker.clone(), Arc::new(registry)).expect("Pool should build");
    pool.start().await.expect("Pool should start");

    let id = broker
        .enqueue(&queue, "pool.upper", b"shout".to_vec(), Vec::new(), Vec::new())
        .await
        .expect("Enqueue should succeed");
    broker
        .join(&queue, Some(Duration::from_secs(10)), Duration::from_millis(100))
        .await
        .expect("Queue should drain");

    let result = broker
        .fetch_result(id)
        .await
        .expect("fetch")
        .expect("Result should be stored");
    assert_eq!(result.payload, b"SHOUT".to_vec());

    pool.shutdown().await.expect("Pool should stop");
    assert_eq!(pool.stats().tasks_done, 1);

    db.close().await;
}

#[tokio::test]
async fn test_connect_rejects_malformed_url() {
    let result = Database::connect("not a database url").await;
    assert!(result.is_err());
}
