//! Batch ingestion: materialize task rows, then expose them on the queue.
//!
//! Rows land in the state table first so a message can never reference a task
//! the table does not know. Queue sends are atomic per message, never per
//! batch; partial failures come back in the response and the still-pending
//! rows are safe to resubmit (the conditional claim makes resubmission
//! idempotent) or to pick up by a later orphan sweep.

use grid_core::{
    backoff::Backoff,
    blob::BlobStore,
    metrics::EventsCounter,
    model::{TaskEnvelope, TaskRow},
    priority::PriorityQueue,
    Error, QueueSend, Result, StateStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// State-table writes are chunked at this many rows per batch call.
const MAX_STATE_WRITE_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub partitions: u32,
    pub payload_in_external_store: bool,
    /// Queue batch ceiling; the dispatch primitive caps batch sends at ten.
    pub queue_batch_ceiling: usize,
    pub write_backoff_base: Duration,
    pub write_backoff_cap: Duration,
    pub write_backoff_attempts: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            partitions: 32,
            payload_in_external_store: false,
            queue_batch_ceiling: 10,
            write_backoff_base: Duration::from_millis(50),
            write_backoff_cap: Duration::from_secs(5),
            write_backoff_attempts: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub session_id: String,
    #[serde(default)]
    pub context: Option<SubmitContext>,
    #[serde(default)]
    pub scheduler_data: Option<SchedulerData>,
    pub tasks_list: TasksList,
}

#[derive(Debug, Deserialize)]
pub struct SubmitContext {
    pub tasks_priority: usize,
}

#[derive(Debug, Deserialize)]
pub struct SchedulerData {
    pub task_timeout_sec: i64,
    pub retry_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct TasksList {
    pub tasks: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub session_id: String,
    pub task_ids: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Submitter {
    state: Arc<dyn StateStore>,
    queue: Arc<PriorityQueue>,
    blobs: BlobStore,
    cfg: SubmitterConfig,
}

impl Submitter {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<PriorityQueue>,
        blobs: BlobStore,
        cfg: SubmitterConfig,
    ) -> Self {
        Self {
            state,
            queue,
            blobs,
            cfg,
        }
    }

    /// Request-shape validation, separated so the HTTP layer can reject with
    /// 400 before any side effect.
    pub fn validate(&self, req: &SubmitRequest) -> std::result::Result<usize, String> {
        if req.session_id.is_empty() {
            return Err("session_id must not be empty".to_string());
        }
        if req.session_id.contains('_') {
            return Err("session_id must not contain underscores".to_string());
        }
        if req.tasks_list.tasks.is_empty() {
            return Err("tasks_list.tasks must not be empty".to_string());
        }
        let priority = req.context.as_ref().map(|c| c.tasks_priority).unwrap_or(0);
        if priority >= self.queue.tiers() {
            return Err(format!(
                "tasks_priority {priority} out of range, queue has {} tiers",
                self.queue.tiers()
            ));
        }
        Ok(priority)
    }

    pub async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse> {
        let priority = self.validate(req).map_err(Error::msg)?;
        let session_id = req.session_id.as_str();

        if self.state.session_has_rows(session_id).await? {
            return Err(Error::condition(format!(
                "session [{session_id}] already has rows, duplicate submission"
            )));
        }

        if let Some(scheduler) = &req.scheduler_data {
            tracing::debug!(
                event = "grid.submit.scheduler_data",
                session_id,
                task_timeout_sec = scheduler.task_timeout_sec,
                retry_count = scheduler.retry_count,
                "scheduler data accepted"
            );
        }

        let counter = EventsCounter::new();
        let now_ms = chrono::Utc::now().timestamp_millis();

        if self.cfg.payload_in_external_store {
            let envelope = serde_json::to_vec(&req.tasks_list.tasks)
                .map_err(|err| Error::msg(format!("encode session payload: {err}")))?;
            self.blobs.put_payload(session_id, envelope).await?;
        }

        let mut rows = Vec::with_capacity(req.tasks_list.tasks.len());
        for (index, payload) in req.tasks_list.tasks.iter().enumerate() {
            let inline = payload.to_string();
            let task_definition = if self.cfg.payload_in_external_store {
                let task_id = grid_core::model::task_id_for(session_id, index);
                let size = inline.len();
                self.blobs.put_input(&task_id, inline.into_bytes()).await?;
                format!("passed_via_external_storage_{size}_bytes")
            } else {
                inline
            };

            rows.push(TaskRow::new_pending(
                session_id,
                index,
                priority,
                self.cfg.partitions,
                task_definition,
                now_ms,
            ));
        }

        self.write_rows_with_backoff(&rows, &counter).await?;

        let enqueued_ms = chrono::Utc::now().timestamp_millis();
        let mut task_ids = Vec::with_capacity(rows.len());
        let mut failed = Vec::new();

        let entries: Vec<QueueSend> = rows
            .iter()
            .map(|row| {
                task_ids.push(row.task_id.clone());
                Ok(QueueSend {
                    id: row.task_id.clone(),
                    body: TaskEnvelope::from_row(row, enqueued_ms).to_body()?,
                })
            })
            .collect::<Result<_>>()?;

        for chunk in entries.chunks(self.cfg.queue_batch_ceiling.max(1)) {
            let report = self.queue.send(chunk, priority).await?;
            for failure in report.failed {
                tracing::warn!(
                    event = "grid.submit.enqueue_failed",
                    task_id = %failure.id,
                    reason = %failure.reason,
                    "task row written but not enqueued"
                );
                failed.push(failure.id);
            }
        }

        counter.increment("count_submitted_tasks", rows.len() as i64);
        tracing::info!(
            event = "grid.submit.accepted",
            session_id,
            tasks = rows.len(),
            priority,
            enqueue_failures = failed.len(),
            batch_backoffs = counter.get("count_batch_write_backoffs"),
            "submission accepted"
        );

        Ok(SubmitResponse {
            session_id: session_id.to_string(),
            task_ids,
            failed,
        })
    }

    /// Bounded subdivide-and-retry loop for throttled batch writes. A
    /// throttled chunk is split in half after a jittered exponential sleep;
    /// single rows are retried whole. Exhausting the attempt budget surfaces
    /// the throttle to the caller.
    async fn write_rows_with_backoff(
        &self,
        rows: &[TaskRow],
        counter: &EventsCounter,
    ) -> Result<()> {
        let mut work: VecDeque<Vec<TaskRow>> = rows
            .chunks(MAX_STATE_WRITE_BATCH)
            .map(|chunk| chunk.to_vec())
            .collect();
        let mut backoff = Backoff::new(
            self.cfg.write_backoff_base,
            self.cfg.write_backoff_cap,
            self.cfg.write_backoff_attempts,
        );

        while let Some(chunk) = work.pop_front() {
            match self.state.put_batch(&chunk).await {
                Ok(()) => {}
                Err(err) if err.is_throttled() => {
                    counter.increment("count_batch_write_backoffs", 1);
                    let Some(delay) = backoff.next_delay() else {
                        return Err(err);
                    };
                    tracing::warn!(
                        event = "grid.submit.batch_throttled",
                        chunk = chunk.len(),
                        delay_ms = delay.as_millis() as u64,
                        "state table throttled, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    if chunk.len() > 1 {
                        let mid = chunk.len() / 2;
                        let (left, right) = chunk.split_at(mid);
                        work.push_front(right.to_vec());
                        work.push_front(left.to_vec());
                    } else {
                        work.push_front(chunk);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
