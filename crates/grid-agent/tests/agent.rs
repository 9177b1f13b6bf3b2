use async_trait::async_trait;
use grid_agent::{Agent, AgentConfig, TaskOutcome, Worker, WorkerFailure};
use grid_core::{
    blob::BlobStore,
    mem::{MemObjectStore, MemQueue, MemStateStore},
    model::{TaskEnvelope, TaskRow},
    priority::PriorityQueue,
    ObjectStore, QueueSend, StateStore, TaskState,
};
use std::{sync::Arc, time::Duration};

const PARTITIONS: u32 = 32;

struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(
        &self,
        _task_id: &str,
        input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure> {
        let mut out = b"echo:".to_vec();
        out.extend_from_slice(input);
        Ok(out)
    }
}

struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn execute(
        &self,
        _task_id: &str,
        _input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure> {
        Err(WorkerFailure {
            message: "bad input".to_string(),
            error_payload: b"stack trace here".to_vec(),
        })
    }
}

struct SlowWorker {
    delay: Duration,
}

#[async_trait]
impl Worker for SlowWorker {
    async fn execute(
        &self,
        _task_id: &str,
        input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(input.to_vec())
    }
}

struct BlockedWorker;

#[async_trait]
impl Worker for BlockedWorker {
    async fn execute(
        &self,
        _task_id: &str,
        _input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure> {
        // Never returns; only cooperative cancellation can stop it.
        std::future::pending::<()>().await;
        unreachable!()
    }
}

struct Fixture {
    state: Arc<MemStateStore>,
    queue: Arc<PriorityQueue>,
    store: Arc<MemObjectStore>,
}

fn fixture() -> Fixture {
    Fixture {
        state: Arc::new(MemStateStore::new(PARTITIONS)),
        queue: Arc::new(PriorityQueue::single(Arc::new(MemQueue::new("grid_tasks__0")))),
        store: Arc::new(MemObjectStore::new()),
    }
}

fn test_config() -> AgentConfig {
    AgentConfig {
        long_poll: Duration::from_millis(100),
        empty_queue_backoff: Duration::from_millis(20),
        claim_retry_backoff: Duration::from_millis(20),
        receive_visibility: Duration::from_secs(60),
        task_visibility: Duration::from_secs(600),
        ttl_refresh_interval_sec: 1,
        ttl_expiration_offset_sec: 3,
        status_poll: Duration::from_millis(50),
        ..AgentConfig::default()
    }
}

fn agent(fx: &Fixture, id: &str, worker: Arc<dyn Worker>, cfg: AgentConfig) -> Agent {
    Agent::new(
        id,
        fx.state.clone(),
        fx.queue.clone(),
        BlobStore::new(fx.store.clone()),
        worker,
        cfg,
    )
}

/// Submits one task the way the control plane does: row first, then message.
async fn seed_task(fx: &Fixture, session: &str, index: usize, payload: &str) -> anyhow::Result<String> {
    let row = TaskRow::new_pending(session, index, 0, PARTITIONS, payload.to_string(), 1);
    fx.state.put_batch(&[row.clone()]).await?;
    fx.queue
        .send(
            &[QueueSend {
                id: row.task_id.clone(),
                body: TaskEnvelope::from_row(&row, 2).to_body()?,
            }],
            0,
        )
        .await?;
    Ok(row.task_id)
}

async fn wait_for_state(
    state: &MemStateStore,
    task_id: &str,
    wanted: TaskState,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let row = state.get(task_id, true).await?;
        if row.and_then(|r| r.logical_state()) == Some(wanted) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {task_id} to reach {wanted}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn claims_executes_finalizes_and_acks() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s1", 0, "payload-bytes").await?;
    let agent = agent(&fx, "agent-1", Arc::new(EchoWorker), test_config());

    let outcome = agent.poll_once().await?;
    assert_eq!(outcome, TaskOutcome::Finished);

    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Finished));
    assert_eq!(row.task_owner, "agent-1");
    assert!(row.task_completion_timestamp_ms > 0);

    let blobs = BlobStore::new(fx.store.clone());
    assert_eq!(blobs.get_output_utf8(&task_id).await?, "echo:payload-bytes");
    assert_eq!(fx.queue.depth(None).await?, 0, "message must be acked");
    Ok(())
}

#[tokio::test]
async fn user_failure_stores_error_payload_and_still_finishes() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s2", 0, "payload").await?;
    let agent = agent(&fx, "agent-1", Arc::new(FailingWorker), test_config());

    let outcome = agent.poll_once().await?;
    assert_eq!(outcome, TaskOutcome::Finished);

    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Finished));

    let blobs = BlobStore::new(fx.store.clone());
    assert_eq!(blobs.get_error(&task_id).await?, b"stack trace here");
    assert!(!blobs.output_exists(&task_id).await?);
    Ok(())
}

#[tokio::test]
async fn duplicate_delivery_has_exactly_one_winner() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s3", 0, "payload").await?;

    // Simulate duplicate delivery: claim the task as a faster agent first,
    // leaving the message visible for the slower one.
    fx.state.claim(&task_id, "agent-fast", "handle-x", i64::MAX).await?;

    let slow = agent(&fx, "agent-slow", Arc::new(EchoWorker), test_config());
    let outcome = slow.poll_once().await?;
    assert_eq!(outcome, TaskOutcome::Idle);

    // The loser must not ack: the message stays (leased) for the winner's
    // handle bookkeeping.
    assert_eq!(fx.queue.depth(None).await?, 1);
    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.task_owner, "agent-fast");
    assert!(!fx.store.exists(&format!("{task_id}-output")).await?);
    Ok(())
}

#[tokio::test]
async fn pre_claim_cancellation_drops_the_message() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s4", 0, "payload").await?;
    fx.state.cancel(&task_id).await?;

    let agent = agent(&fx, "agent-1", Arc::new(EchoWorker), test_config());
    let outcome = agent.poll_once().await?;
    assert_eq!(outcome, TaskOutcome::Idle);

    assert_eq!(fx.queue.depth(None).await?, 0, "cancelled task must be acked");
    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Cancelled));
    Ok(())
}

#[tokio::test]
async fn heartbeat_detects_cancel_and_aborts_the_worker() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s5", 0, "payload").await?;
    let agent = Arc::new(agent(&fx, "agent-1", Arc::new(BlockedWorker), test_config()));

    let running = tokio::spawn({
        let agent = agent.clone();
        async move { agent.poll_once().await }
    });

    wait_for_state(&fx.state, &task_id, TaskState::Processing).await?;
    fx.state.cancel(&task_id).await?;

    let outcome = running.await.expect("agent task")?;
    assert_eq!(outcome, TaskOutcome::Cancelled);

    // Message gone, no output written.
    assert_eq!(fx.queue.depth(None).await?, 0);
    assert!(!fx.store.exists(&format!("{task_id}-output")).await?);
    Ok(())
}

#[tokio::test]
async fn reclaimed_task_discards_the_result_without_ack() -> anyhow::Result<()> {
    let fx = fixture();
    let task_id = seed_task(&fx, "s6", 0, "payload").await?;
    let agent = Arc::new(agent(
        &fx,
        "agent-1",
        Arc::new(SlowWorker {
            delay: Duration::from_millis(400),
        }),
        test_config(),
    ));

    let running = tokio::spawn({
        let agent = agent.clone();
        async move { agent.poll_once().await }
    });

    wait_for_state(&fx.state, &task_id, TaskState::Processing).await?;
    // The reclaimer resets the task while the worker is still busy.
    fx.state.retry(&task_id, 1).await?;

    let outcome = running.await.expect("agent task")?;
    assert_eq!(outcome, TaskOutcome::Discarded);

    // The message is not acked and the row belongs to the next attempt.
    assert_eq!(fx.queue.depth(None).await?, 1);
    let row = fx.state.get(&task_id, true).await?.expect("row exists");
    assert_eq!(row.logical_state(), Some(TaskState::Pending));
    assert_eq!(row.retries, 1);
    Ok(())
}

#[tokio::test]
async fn empty_queue_sleeps_at_least_the_backoff_floor() -> anyhow::Result<()> {
    let fx = fixture();
    let cfg = AgentConfig {
        long_poll: Duration::ZERO,
        empty_queue_backoff: Duration::from_millis(50),
        ..test_config()
    };
    let agent = agent(&fx, "agent-1", Arc::new(EchoWorker), cfg);

    let started = tokio::time::Instant::now();
    let outcome = agent.poll_once().await?;
    let elapsed = started.elapsed();

    assert_eq!(outcome, TaskOutcome::Idle);
    assert!(elapsed >= Duration::from_millis(50), "slept only {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "slept too long: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_is_dropped() -> anyhow::Result<()> {
    let fx = fixture();
    fx.queue
        .send(
            &[QueueSend {
                id: "junk".to_string(),
                body: "not json".to_string(),
            }],
            0,
        )
        .await?;

    let agent = agent(&fx, "agent-1", Arc::new(EchoWorker), test_config());
    let outcome = agent.poll_once().await?;
    assert_eq!(outcome, TaskOutcome::Idle);
    assert_eq!(fx.queue.depth(None).await?, 0, "poison message must be dropped");
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_between_tasks() -> anyhow::Result<()> {
    let fx = fixture();
    let agent = Arc::new(agent(&fx, "agent-1", Arc::new(EchoWorker), test_config()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).expect("send shutdown");

    let exit = running.await.expect("agent task")?;
    assert_eq!(exit, grid_agent::AgentExit::Shutdown);
    Ok(())
}
