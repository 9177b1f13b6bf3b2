use grid_control::reclaim::{Reclaimer, ReclaimerConfig};
use grid_core::{
    backoff::ThrottleWindow,
    mem::{MemQueue, MemStateStore},
    model::TaskRow,
    priority::PriorityQueue,
    QueueSend, StateStore, TaskQueue, TaskState,
};
use std::{sync::Arc, time::Duration};

const PARTITIONS: u32 = 32;

struct Fixture {
    state: Arc<MemStateStore>,
    queue: Arc<PriorityQueue>,
    dlq: Arc<MemQueue>,
    reclaimer: Reclaimer,
}

fn fixture(max_retries: u32) -> Fixture {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    let queue = Arc::new(PriorityQueue::single(Arc::new(MemQueue::new("grid_tasks__0"))));
    let dlq = Arc::new(MemQueue::new("grid_tasks_dlq"));
    let throttle = Arc::new(ThrottleWindow::new(Duration::from_secs(60)));
    let reclaimer = Reclaimer::new(
        state.clone(),
        queue.clone(),
        Some(dlq.clone()),
        throttle,
        ReclaimerConfig {
            partitions: PARTITIONS,
            page_limit: 200,
            max_retries,
            throttle_skip_threshold: 1000,
        },
    );
    Fixture {
        state,
        queue,
        dlq,
        reclaimer,
    }
}

/// Seeds one task that an agent claimed and then abandoned: the row is
/// processing with an already-expired lease and the queue holds the leased
/// message under the stored handle.
async fn seed_abandoned_task(fx: &Fixture, session: &str, retries: u32) -> anyhow::Result<String> {
    let mut row = TaskRow::new_pending(session, 0, 0, PARTITIONS, "work".into(), 1);
    row.retries = retries;
    fx.state.put_batch(&[row.clone()]).await?;

    fx.queue
        .send(
            &[QueueSend {
                id: row.task_id.clone(),
                body: format!("{{\"task_id\":\"{}\"}}", row.task_id),
            }],
            0,
        )
        .await?;
    let (msg, _) = fx
        .queue
        .receive(Duration::ZERO, Duration::from_secs(600))
        .await?
        .expect("seeded message");

    let expired = chrono::Utc::now().timestamp() - 10;
    fx.state
        .claim(&row.task_id, "crashed-agent", &msg.handle, expired)
        .await?;
    Ok(row.task_id)
}

#[tokio::test]
async fn expired_task_goes_back_to_pending_and_message_reappears() -> anyhow::Result<()> {
    let fx = fixture(5);
    let task_id = seed_abandoned_task(&fx, "s2", 0).await?;

    let report = fx.reclaimer.sweep().await?;
    assert!(!report.skipped_for_throttling);
    assert_eq!(report.expired, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.failed, 0);

    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Pending));
    assert_eq!(row.task_owner, "NONE");
    assert_eq!(row.retries, 1);

    // The message is visible again for the next agent.
    let requeued = fx
        .queue
        .receive(Duration::ZERO, Duration::from_secs(30))
        .await?;
    assert!(requeued.is_some(), "message was not re-exposed");
    Ok(())
}

#[tokio::test]
async fn retries_at_ceiling_fail_the_task_and_drop_the_message() -> anyhow::Result<()> {
    let fx = fixture(5);
    let task_id = seed_abandoned_task(&fx, "s3", 5).await?;

    let report = fx.reclaimer.sweep().await?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);

    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Failed));
    assert_eq!(row.task_owner, "NONE");
    assert_eq!(fx.queue.depth(None).await?, 0, "message must be acked");
    Ok(())
}

#[tokio::test]
async fn bounded_retries_end_in_failed_exactly_at_the_ceiling() -> anyhow::Result<()> {
    let fx = fixture(3);
    let task_id = seed_abandoned_task(&fx, "s4", 0).await?;

    for expected_retries in 1..=3u32 {
        let report = fx.reclaimer.sweep().await?;
        let row = fx.state.get(&task_id, true).await?.expect("row exists");

        if expected_retries <= 3 && row.logical_state() == Some(TaskState::Pending) {
            assert_eq!(report.retried, 1);
            assert_eq!(row.retries, expected_retries);
            assert!(row.retries <= 3, "retries exceeded the ceiling");

            // Next agent claims it and abandons it again.
            let (msg, _) = fx
                .queue
                .receive(Duration::ZERO, Duration::from_secs(600))
                .await?
                .expect("requeued message");
            let expired = chrono::Utc::now().timestamp() - 10;
            fx.state
                .claim(&task_id, "crashed-agent", &msg.handle, expired)
                .await?;
        }
    }

    // The fourth sweep observes retries == max and fails the task.
    let report = fx.reclaimer.sweep().await?;
    assert_eq!(report.failed, 1);
    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Failed));
    assert_eq!(row.retries, 3);
    Ok(())
}

#[tokio::test]
async fn unroutable_queue_handle_quarantines_the_row() -> anyhow::Result<()> {
    let fx = fixture(5);

    // Processing row whose handle never existed in the queue: the lease reset
    // will succeed but the message cannot be re-exposed.
    let row = TaskRow::new_pending("s5", 0, 0, PARTITIONS, "work".into(), 1);
    fx.state.put_batch(&[row.clone()]).await?;
    let expired = chrono::Utc::now().timestamp() - 10;
    fx.state
        .claim(&row.task_id, "crashed-agent", "not-a-real-handle", expired)
        .await?;

    let report = fx.reclaimer.sweep().await?;
    assert_eq!(report.inconsistent, 1);
    assert_eq!(report.retried, 0);

    let row = fx.state.get(&row.task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Inconsistent));

    // Operators see the full row on the dead-letter queue.
    let dead = fx
        .dlq
        .receive(Duration::ZERO, Duration::from_secs(30))
        .await?
        .expect("dead-lettered row");
    let parsed: TaskRow = serde_json::from_str(&dead.body)?;
    assert_eq!(parsed.task_id, "s5_0");
    Ok(())
}

#[tokio::test]
async fn sweep_is_skipped_under_observed_throttling() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    let queue = Arc::new(PriorityQueue::single(Arc::new(MemQueue::new("grid_tasks__0"))));
    let throttle = Arc::new(ThrottleWindow::new(Duration::from_secs(60)));
    for _ in 0..11 {
        throttle.record();
    }
    let reclaimer = Reclaimer::new(
        state.clone(),
        queue,
        None,
        throttle,
        ReclaimerConfig {
            partitions: PARTITIONS,
            page_limit: 200,
            max_retries: 5,
            throttle_skip_threshold: 10,
        },
    );

    let row = TaskRow::new_pending("s6", 0, 0, PARTITIONS, "work".into(), 1);
    state.put_batch(&[row.clone()]).await?;
    let expired = chrono::Utc::now().timestamp() - 10;
    state
        .claim(&row.task_id, "crashed-agent", "h", expired)
        .await?;

    let report = reclaimer.sweep().await?;
    assert!(report.skipped_for_throttling);
    assert_eq!(report.expired, 0);

    // The expired row is untouched until a calmer cycle.
    let row = state.get(&row.task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Processing));
    Ok(())
}

#[tokio::test]
async fn empty_sweep_reports_nothing() -> anyhow::Result<()> {
    let fx = fixture(5);
    let report = fx.reclaimer.sweep().await?;
    assert_eq!(report, grid_control::reclaim::SweepReport::default());
    Ok(())
}
