//! Lease-holding task executor.
//!
//! One agent owns at most one task at a time; concurrency scales by adding
//! agents, not by multiplexing within one. While a task runs, two
//! cooperative activities share the process: the executor (which may block
//! inside user code) and the heartbeater (which keeps the state-table lease
//! alive). They share exactly one piece of mutable state, the atomic
//! "execution complete" flag, which suppresses a spurious lost-lease verdict
//! when the finalize has already won.

use async_trait::async_trait;
use grid_core::{
    backoff::{jitter, Backoff},
    blob::BlobStore,
    model::{session_of_task, TaskEnvelope},
    priority::PriorityQueue,
    QueueMessage, Result, StateStore, TaskState,
    ttl::TtlExpirationGenerator,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;

/// Opaque `bytes -> bytes` user computation.
///
/// A worker error is NOT an infrastructure failure: it is treated as a
/// successful execution with an error payload at `<task_id>-error`, and the
/// task still finishes. Retry semantics exist only for infrastructure
/// failures, expressed through lease expiry.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        task_id: &str,
        input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure>;
}

#[derive(Debug)]
pub struct WorkerFailure {
    pub message: String,
    pub error_payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Queue long-poll duration per loop iteration.
    pub long_poll: Duration,

    /// Idle sleep when the queue is empty; the actual sleep is jittered in
    /// `[v, 2v)`.
    pub empty_queue_backoff: Duration,

    /// Pause after losing a claim race before polling again.
    pub claim_retry_backoff: Duration,

    /// Initial invisibility taken at receive time, before the claim decides
    /// ownership.
    pub receive_visibility: Duration,

    /// Invisibility extension taken right after a successful claim, long
    /// enough to cover the whole execution.
    pub task_visibility: Duration,

    /// Heartbeat cadence; must be strictly smaller than the offset.
    pub ttl_refresh_interval_sec: i64,

    /// Lease length granted per refresh.
    pub ttl_expiration_offset_sec: i64,

    /// Wakeup cadence of the heartbeat activity.
    pub status_poll: Duration,

    /// Whether task inputs live at `<task_id>-input` instead of inline in
    /// the message body.
    pub payload_in_external_store: bool,

    pub throttle_backoff_base: Duration,
    pub throttle_backoff_cap: Duration,
    pub throttle_backoff_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            long_poll: Duration::from_secs(10),
            empty_queue_backoff: Duration::from_secs(2),
            claim_retry_backoff: Duration::from_secs(1),
            receive_visibility: Duration::from_secs(60),
            task_visibility: Duration::from_secs(3600),
            ttl_refresh_interval_sec: 30,
            ttl_expiration_offset_sec: 90,
            status_poll: Duration::from_secs(1),
            payload_in_external_store: false,
            throttle_backoff_base: Duration::from_millis(100),
            throttle_backoff_cap: Duration::from_secs(5),
            throttle_backoff_attempts: 10,
        }
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Graceful shutdown was requested; the in-flight task (if any) was
    /// finished first. Process exit code 0.
    Shutdown,

    /// The running task was cancelled mid-execution. A clean process restart
    /// is the least-error path since the worker invocation may not be
    /// interruptible.
    Restart,
}

/// Outcome of one pass of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Nothing received, or a claim race was lost.
    Idle,
    /// Executed and finalized; the message is acked.
    Finished,
    /// Finalize hit `Condition`: the reclaimer reassigned the task, the
    /// result is discarded and the message is NOT acked.
    Discarded,
    /// Cancellation observed on heartbeat; worker aborted, message acked.
    Cancelled,
    /// The lease was lost to the reclaimer mid-execution.
    LeaseLost,
}

enum HeartbeatVerdict {
    Completed,
    Cancelled,
    Lost,
}

pub struct Agent {
    id: String,
    state: Arc<dyn StateStore>,
    queue: Arc<PriorityQueue>,
    blobs: BlobStore,
    worker: Arc<dyn Worker>,
    cfg: AgentConfig,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        state: Arc<dyn StateStore>,
        queue: Arc<PriorityQueue>,
        blobs: BlobStore,
        worker: Arc<dyn Worker>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            id: id.into(),
            state,
            queue,
            blobs,
            worker,
            cfg,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main event loop. Shutdown is observed between tasks only: an in-flight
    /// task always runs to its outcome first.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Result<AgentExit> {
        tracing::info!(event = "grid.agent.started", agent_id = %self.id, "agent started");

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!(
                    event = "grid.agent.shutdown",
                    agent_id = %self.id,
                    "agent shutting down"
                );
                return Ok(AgentExit::Shutdown);
            }

            match self.poll_once().await? {
                TaskOutcome::Cancelled => {
                    tracing::warn!(
                        event = "grid.agent.cancelled_restart",
                        agent_id = %self.id,
                        "task cancelled during processing, restarting"
                    );
                    return Ok(AgentExit::Restart);
                }
                outcome => {
                    tracing::debug!(
                        event = "grid.agent.loop",
                        agent_id = %self.id,
                        outcome = ?outcome,
                        "loop iteration done"
                    );
                }
            }
        }
    }

    /// One pass: receive, claim, execute with heartbeat.
    pub async fn poll_once(&self) -> Result<TaskOutcome> {
        let Some((msg, tier)) = self
            .queue
            .receive(self.cfg.long_poll, self.cfg.receive_visibility)
            .await?
        else {
            let pause = jitter(self.cfg.empty_queue_backoff);
            tracing::debug!(
                event = "grid.agent.queue_empty",
                agent_id = %self.id,
                backoff_ms = pause.as_millis() as u64,
                "no task in the queue, backing off"
            );
            tokio::time::sleep(pause).await;
            return Ok(TaskOutcome::Idle);
        };

        let envelope = match TaskEnvelope::from_body(&msg.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    event = "grid.agent.envelope_invalid",
                    agent_id = %self.id,
                    message_id = %msg.message_id,
                    error = %err,
                    "invalid task envelope, dropping message"
                );
                self.queue.ack(&msg.handle, Some(tier)).await?;
                return Ok(TaskOutcome::Idle);
            }
        };
        let task_id = envelope.task_id.clone();
        session_of_task(&task_id)?;

        let mut ttl = TtlExpirationGenerator::new(
            self.cfg.ttl_refresh_interval_sec,
            self.cfg.ttl_expiration_offset_sec,
        )?;
        let expiry = ttl.generate_next(chrono::Utc::now().timestamp());

        match self.state.claim(&task_id, &self.id, &msg.handle, expiry).await {
            Ok(()) => {}
            Err(err) if err.is_condition() || err.is_throttled() => {
                if self.task_cancelled(&task_id).await? {
                    tracing::info!(
                        event = "grid.agent.claim_cancelled",
                        agent_id = %self.id,
                        task_id = %task_id,
                        "task already cancelled, dropping message"
                    );
                    self.queue.ack(&msg.handle, Some(tier)).await?;
                    return Ok(TaskOutcome::Idle);
                }
                // Raced with another agent or the reclaimer.
                tracing::info!(
                    event = "grid.agent.claim_lost",
                    agent_id = %self.id,
                    task_id = %task_id,
                    error = %err,
                    "claim lost, backing off"
                );
                tokio::time::sleep(jitter(self.cfg.claim_retry_backoff)).await;
                return Ok(TaskOutcome::Idle);
            }
            Err(err) => return Err(err),
        }

        // Own the message for the whole execution; the lease taken at
        // receive time only covers the claim window.
        self.queue
            .extend_lease(&msg.handle, self.cfg.task_visibility, Some(tier))
            .await?;

        tracing::info!(
            event = "grid.agent.task_acquired",
            agent_id = %self.id,
            task_id = %task_id,
            deliveries = msg.deliveries,
            "task acquired"
        );

        self.run_with_heartbeat(ttl, &msg, tier, &envelope).await
    }

    /// Executor and heartbeater as two cooperative activities on one
    /// scheduler. Whichever reaches a terminal verdict first decides the
    /// outcome; the done flag resolves the finalize/heartbeat race.
    async fn run_with_heartbeat(
        &self,
        ttl: TtlExpirationGenerator,
        msg: &QueueMessage,
        tier: usize,
        envelope: &TaskEnvelope,
    ) -> Result<TaskOutcome> {
        let done = Arc::new(AtomicBool::new(false));

        let exec = self.execute_and_commit(envelope, msg, tier, done.clone());
        tokio::pin!(exec);
        let heartbeat = self.heartbeat(&envelope.task_id, ttl, done.clone());
        tokio::pin!(heartbeat);

        tokio::select! {
            exec_out = &mut exec => exec_out,
            verdict = &mut heartbeat => match verdict? {
                HeartbeatVerdict::Completed => exec.await,
                HeartbeatVerdict::Cancelled => {
                    // Dropping the execution future aborts the worker; the
                    // message must not be seen by anyone else.
                    self.queue.ack(&msg.handle, Some(tier)).await?;
                    Ok(TaskOutcome::Cancelled)
                }
                HeartbeatVerdict::Lost => {
                    tracing::warn!(
                        event = "grid.agent.lease_lost",
                        agent_id = %self.id,
                        task_id = %envelope.task_id,
                        "lease reassigned mid-execution, abandoning task"
                    );
                    Ok(TaskOutcome::LeaseLost)
                }
            },
        }
    }

    async fn execute_and_commit(
        &self,
        envelope: &TaskEnvelope,
        msg: &QueueMessage,
        tier: usize,
        done: Arc<AtomicBool>,
    ) -> Result<TaskOutcome> {
        let task_id = envelope.task_id.as_str();

        let input = if self.cfg.payload_in_external_store {
            self.blobs.get_input(task_id).await?
        } else {
            envelope.task_definition.clone().into_bytes()
        };

        // The output (or error payload) must be durable before the state
        // transition that references it. A crash in between leaves a
        // harmless orphan that the next attempt overwrites.
        match self.worker.execute(task_id, &input).await {
            Ok(output) => {
                self.blobs.put_output(task_id, output).await?;
            }
            Err(failure) => {
                tracing::warn!(
                    event = "grid.agent.user_code_failed",
                    agent_id = %self.id,
                    task_id,
                    error = %failure.message,
                    "user code failed, storing error payload"
                );
                self.blobs.put_error(task_id, failure.error_payload).await?;
            }
        }

        let mut backoff = Backoff::new(
            self.cfg.throttle_backoff_base,
            self.cfg.throttle_backoff_cap,
            self.cfg.throttle_backoff_attempts,
        );
        loop {
            match self.state.finalize(task_id, &self.id).await {
                Ok(()) => break,
                Err(err) if err.is_throttled() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(err);
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_condition() => {
                    // The reclaimer already reassigned the task; the result
                    // is discarded and the message stays untouched.
                    done.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        event = "grid.agent.finalize_lost",
                        agent_id = %self.id,
                        task_id,
                        "could not set task to finished, result discarded"
                    );
                    return Ok(TaskOutcome::Discarded);
                }
                Err(err) => return Err(err),
            }
        }

        // No suspension point between the successful finalize and the flag,
        // so the heartbeater can never read a stale verdict.
        done.store(true, Ordering::SeqCst);
        self.queue.ack(&msg.handle, Some(tier)).await?;

        tracing::info!(
            event = "grid.agent.task_finished",
            agent_id = %self.id,
            task_id,
            "task finished"
        );
        Ok(TaskOutcome::Finished)
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        mut ttl: TtlExpirationGenerator,
        done: Arc<AtomicBool>,
    ) -> Result<HeartbeatVerdict> {
        let poll_secs = self.cfg.status_poll.as_secs().max(1) as i64;

        loop {
            if done.load(Ordering::SeqCst) {
                return Ok(HeartbeatVerdict::Completed);
            }

            let now = chrono::Utc::now().timestamp();
            if ttl.refresh_due(now, poll_secs) {
                match self.refresh_once(task_id, &mut ttl).await? {
                    Some(verdict) => return Ok(verdict),
                    None => {}
                }
            }

            tokio::time::sleep(self.cfg.status_poll).await;
        }
    }

    /// One TTL refresh with throttle retries. `None` means the lease was
    /// extended and the heartbeat continues.
    async fn refresh_once(
        &self,
        task_id: &str,
        ttl: &mut TtlExpirationGenerator,
    ) -> Result<Option<HeartbeatVerdict>> {
        let mut backoff = Backoff::new(
            self.cfg.throttle_backoff_base,
            self.cfg.throttle_backoff_cap,
            self.cfg.throttle_backoff_attempts,
        );

        loop {
            // A retried iteration regenerates the offset, which is what we
            // want: the lease is measured from now, not from the first try.
            let expiry = ttl.generate_next(chrono::Utc::now().timestamp());
            match self.state.refresh_ttl(task_id, &self.id, expiry).await {
                Ok(()) => return Ok(None),
                Err(err) if err.is_throttled() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(err);
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_condition() => {
                    let row = self.state.get(task_id, true).await?;
                    let state = row.as_ref().and_then(|r| r.logical_state());

                    if state == Some(TaskState::Cancelled) {
                        return Ok(Some(HeartbeatVerdict::Cancelled));
                    }
                    // Our own finalize may have landed between the refresh
                    // and this read.
                    if state == Some(TaskState::Finished)
                        && row.is_some_and(|r| r.task_owner == self.id)
                    {
                        return Ok(Some(HeartbeatVerdict::Completed));
                    }
                    return Ok(Some(HeartbeatVerdict::Lost));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn task_cancelled(&self, task_id: &str) -> Result<bool> {
        let row = self.state.get(task_id, true).await?;
        Ok(row
            .and_then(|r| r.logical_state())
            .is_some_and(|state| state == TaskState::Cancelled))
    }
}
