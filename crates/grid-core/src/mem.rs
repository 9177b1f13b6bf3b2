//! In-memory backends.
//!
//! Deterministic doubles for the state table, the task queue, and the object
//! store, with the same conditional semantics as the durable backends. They
//! back the scenario tests and the local single-process mode; the state
//! store additionally supports deterministic throttle injection so
//! backpressure paths are testable.

use crate::{
    backoff::ThrottleWindow,
    model::{
        session_of_task, state_partition, stored_state, stored_state_for_session, TaskState,
        TASK_OWNER_NONE,
    },
    Error, ObjectStore, QueueMessage, QueueSend, Result, SendReport, StateStore, TaskQueue,
    TaskRow,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects
            .lock()
            .expect("object store poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("object store poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no object at key [{key}]")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .expect("object store poisoned")
            .contains_key(key))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemMessage {
    message_id: String,
    body: String,
    visible_at: Instant,
    deliveries: i32,
}

#[derive(Debug)]
pub struct MemQueue {
    name: String,
    messages: Mutex<Vec<MemMessage>>,
}

impl MemQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    fn try_receive(&self, visibility: Duration) -> Option<QueueMessage> {
        let now = Instant::now();
        let mut messages = self.messages.lock().expect("queue poisoned");
        let msg = messages.iter_mut().find(|m| m.visible_at <= now)?;
        msg.visible_at = now + visibility;
        msg.deliveries += 1;
        Some(QueueMessage {
            handle: msg.message_id.clone(),
            message_id: msg.message_id.clone(),
            body: msg.body.clone(),
            deliveries: msg.deliveries,
        })
    }
}

#[async_trait]
impl TaskQueue for MemQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, entries: &[QueueSend]) -> Result<SendReport> {
        let mut report = SendReport::default();
        let mut messages = self.messages.lock().expect("queue poisoned");
        for entry in entries {
            messages.push(MemMessage {
                message_id: Uuid::new_v4().to_string(),
                body: entry.body.clone(),
                visible_at: Instant::now(),
                deliveries: 0,
            });
            report.sent.push(entry.id.clone());
        }
        Ok(report)
    }

    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(msg) = self.try_receive(visibility) {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ack(&self, handle: &str) -> Result<()> {
        let mut messages = self.messages.lock().expect("queue poisoned");
        let before = messages.len();
        messages.retain(|m| m.message_id != handle);
        if messages.len() == before {
            return Err(Error::not_found(format!(
                "no message for handle [{handle}] in queue [{}]",
                self.name
            )));
        }
        Ok(())
    }

    async fn extend_lease(&self, handle: &str, visibility: Duration) -> Result<()> {
        let mut messages = self.messages.lock().expect("queue poisoned");
        let msg = messages
            .iter_mut()
            .find(|m| m.message_id == handle)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no message for handle [{handle}] in queue [{}]",
                    self.name
                ))
            })?;
        msg.visible_at = Instant::now() + visibility;
        Ok(())
    }

    async fn depth(&self) -> Result<i64> {
        Ok(self.messages.lock().expect("queue poisoned").len() as i64)
    }
}

// ---------------------------------------------------------------------------
// State table
// ---------------------------------------------------------------------------

pub struct MemStateStore {
    partitions: u32,
    rows: Mutex<HashMap<String, TaskRow>>,
    batch_calls: AtomicU64,
    /// When non-zero, every Nth `put_batch` call fails `Throttled` before
    /// writing anything. Deterministic backpressure for tests.
    throttle_every: AtomicU64,
    throttle_window: Option<Arc<ThrottleWindow>>,
}

impl MemStateStore {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            rows: Mutex::new(HashMap::new()),
            batch_calls: AtomicU64::new(0),
            throttle_every: AtomicU64::new(0),
            throttle_window: None,
        }
    }

    pub fn with_throttle_window(partitions: u32, window: Arc<ThrottleWindow>) -> Self {
        Self {
            throttle_window: Some(window),
            ..Self::new(partitions)
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Makes every `n`th batch write fail `Throttled`. Zero disables.
    pub fn throttle_every_nth_batch(&self, n: u64) {
        self.throttle_every.store(n, Ordering::SeqCst);
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().expect("state store poisoned").len()
    }

    fn stored_for_task(&self, task_id: &str, state: TaskState) -> Result<String> {
        let session = session_of_task(task_id)?;
        Ok(stored_state_for_session(state, session, self.partitions))
    }

    fn record_throttle(&self) {
        if let Some(window) = &self.throttle_window {
            window.record();
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn put_batch(&self, rows: &[TaskRow]) -> Result<()> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.throttle_every.load(Ordering::SeqCst);
        if every != 0 && call % every == 0 {
            self.record_throttle();
            return Err(Error::throttled(format!(
                "state table throttled batch write #{call}"
            )));
        }

        let mut table = self.rows.lock().expect("state store poisoned");
        for row in rows {
            table.insert(row.task_id.clone(), row.clone());
        }
        Ok(())
    }

    async fn claim(&self, task_id: &str, owner: &str, handle: &str, expiry: i64) -> Result<()> {
        let pending = self.stored_for_task(task_id, TaskState::Pending)?;
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;

        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table.get_mut(task_id).ok_or_else(|| {
            Error::condition(format!("claim of [{task_id}]: no such row"))
        })?;
        if row.task_status != pending || row.task_owner != TASK_OWNER_NONE {
            return Err(Error::condition(format!(
                "could not acquire [{task_id}] for status [{pending}]: status [{}] owner [{}]",
                row.task_status, row.task_owner
            )));
        }
        row.task_owner = owner.to_string();
        row.task_status = processing;
        row.heartbeat_expiration_timestamp = expiry;
        row.queue_handle = handle.to_string();
        Ok(())
    }

    async fn refresh_ttl(&self, task_id: &str, owner: &str, new_expiry: i64) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;

        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table.get_mut(task_id).ok_or_else(|| {
            Error::condition(format!("ttl refresh of [{task_id}]: no such row"))
        })?;
        if row.task_status != processing || row.task_owner != owner {
            return Err(Error::condition(format!(
                "lease of [{task_id}] is no longer held by [{owner}]: status [{}] owner [{}]",
                row.task_status, row.task_owner
            )));
        }
        row.heartbeat_expiration_timestamp = new_expiry;
        Ok(())
    }

    async fn finalize(&self, task_id: &str, owner: &str) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;
        let finished = self.stored_for_task(task_id, TaskState::Finished)?;

        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table.get_mut(task_id).ok_or_else(|| {
            Error::condition(format!("finalize of [{task_id}]: no such row"))
        })?;
        if row.task_status != processing || row.task_owner != owner {
            return Err(Error::condition(format!(
                "could not finish [{task_id}] as [{owner}]: status [{}] owner [{}]",
                row.task_status, row.task_owner
            )));
        }
        row.task_status = finished;
        row.task_completion_timestamp_ms = Self::now_ms();
        Ok(())
    }

    async fn retry(&self, task_id: &str, new_retry_count: u32) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;
        let pending = self.stored_for_task(task_id, TaskState::Pending)?;

        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table.get_mut(task_id).ok_or_else(|| {
            Error::condition(format!("retry of [{task_id}]: no such row"))
        })?;
        if row.task_status != processing {
            return Err(Error::condition(format!(
                "[{task_id}] is no longer in [{processing}]: status [{}]",
                row.task_status
            )));
        }
        row.task_owner = TASK_OWNER_NONE.to_string();
        row.task_status = pending;
        row.retries = new_retry_count;
        Ok(())
    }

    async fn fail(&self, task_id: &str) -> Result<()> {
        let failed = self.stored_for_task(task_id, TaskState::Failed)?;
        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found(format!("fail of [{task_id}]: no such row")))?;
        row.task_status = failed;
        row.task_owner = TASK_OWNER_NONE.to_string();
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let cancelled = self.stored_for_task(task_id, TaskState::Cancelled)?;
        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found(format!("cancel of [{task_id}]: no such row")))?;
        row.task_status = cancelled;
        row.task_owner = TASK_OWNER_NONE.to_string();
        Ok(())
    }

    async fn mark_inconsistent(&self, task_id: &str) -> Result<()> {
        let inconsistent = self.stored_for_task(task_id, TaskState::Inconsistent)?;
        let mut table = self.rows.lock().expect("state store poisoned");
        let row = table.get_mut(task_id).ok_or_else(|| {
            Error::not_found(format!("mark inconsistent of [{task_id}]: no such row"))
        })?;
        row.task_status = inconsistent;
        row.task_owner = TASK_OWNER_NONE.to_string();
        Ok(())
    }

    async fn get(&self, task_id: &str, _consistent: bool) -> Result<Option<TaskRow>> {
        Ok(self
            .rows
            .lock()
            .expect("state store poisoned")
            .get(task_id)
            .cloned())
    }

    async fn query_by_session(
        &self,
        session_id: &str,
        logical_state: TaskState,
    ) -> Result<Vec<TaskRow>> {
        let wanted = stored_state_for_session(logical_state, session_id, self.partitions);
        let table = self.rows.lock().expect("state store poisoned");
        let mut rows: Vec<TaskRow> = table
            .values()
            .filter(|row| row.session_id == session_id && row.task_status == wanted)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(rows)
    }

    async fn query_expired(&self, partition: u32, now: i64, limit: i64) -> Result<Vec<TaskRow>> {
        let wanted = stored_state(TaskState::Processing, partition);
        let table = self.rows.lock().expect("state store poisoned");
        let mut rows: Vec<TaskRow> = table
            .values()
            .filter(|row| {
                row.task_status == wanted && row.heartbeat_expiration_timestamp < now
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.heartbeat_expiration_timestamp);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn session_has_rows(&self, session_id: &str) -> Result<bool> {
        let table = self.rows.lock().expect("state store poisoned");
        Ok(table.values().any(|row| row.session_id == session_id))
    }
}
