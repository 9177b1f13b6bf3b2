//! Task row model, logical states, and the partitioned stored-state codec.
//!
//! The stored `task_status` string concatenates the logical state with a
//! session-derived partition (`processing-7`), which shards the expiry index
//! into independent scan streams so one hot session cannot serialize
//! reclamation across all sessions.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Sentinel owner for rows no agent is leasing.
pub const TASK_OWNER_NONE: &str = "NONE";

/// Sentinel queue handle for rows not yet claimed.
pub const QUEUE_HANDLE_NONE: &str = "NONE";

/// Logical lifecycle states. `Retrying` is transient only — it is never the
/// stored value on the happy path; the row goes directly processing →
/// pending. `Inconsistent` is a terminal diagnostic for rows the reclaimer
/// could reset but whose queue message could not be re-exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Finished,
    Failed,
    Cancelled,
    Retrying,
    Inconsistent,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Retrying => "retrying",
            TaskState::Inconsistent => "inconsistent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "processing" => Some(TaskState::Processing),
            "finished" => Some(TaskState::Finished),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            "retrying" => Some(TaskState::Retrying),
            "inconsistent" => Some(TaskState::Inconsistent),
            _ => None,
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Cancelled | TaskState::Inconsistent
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition of a session in `[0, partitions)`.
pub fn state_partition(session_id: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(partitions.max(1))) as u32
}

/// Stored `task_status` value: `<logical_state>-<partition>`.
pub fn stored_state(state: TaskState, partition: u32) -> String {
    format!("{}-{partition}", state.as_str())
}

pub fn stored_state_for_session(state: TaskState, session_id: &str, partitions: u32) -> String {
    stored_state(state, state_partition(session_id, partitions))
}

pub fn parse_stored_state(stored: &str) -> Option<(TaskState, u32)> {
    let (state, partition) = stored.rsplit_once('-')?;
    Some((TaskState::parse(state)?, partition.parse().ok()?))
}

/// Task ids are `<session_id>_<index>`; session ids therefore must not
/// contain underscores (the submitter rejects them).
pub fn task_id_for(session_id: &str, index: usize) -> String {
    format!("{session_id}_{index}")
}

pub fn session_of_task(task_id: &str) -> Result<&str> {
    task_id
        .split_once('_')
        .map(|(session, _)| session)
        .ok_or_else(|| Error::msg(format!("malformed task id: {task_id}")))
}

/// The authoritative per-task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub session_id: String,
    pub parent_session_id: String,

    /// Stored composite `<logical_state>-<partition>`.
    pub task_status: String,

    /// `NONE` or the agent identity currently leasing the task.
    pub task_owner: String,

    /// Queue ack token held by the current owner (`NONE` until claimed).
    pub queue_handle: String,

    /// Epoch seconds after which the lease is invalid. Meaningful only while
    /// in `processing`.
    pub heartbeat_expiration_timestamp: i64,

    pub retries: u32,
    pub task_priority: usize,

    pub submission_timestamp_ms: i64,
    pub task_completion_timestamp_ms: i64,

    /// Opaque payload: inline bytes, or a marker when the payload lives in
    /// the blob store under `<task_id>-input`.
    pub task_definition: String,
}

impl TaskRow {
    /// Fresh `pending` row as materialized by the submitter.
    pub fn new_pending(
        session_id: &str,
        index: usize,
        priority: usize,
        partitions: u32,
        task_definition: String,
        now_ms: i64,
    ) -> Self {
        Self {
            task_id: task_id_for(session_id, index),
            session_id: session_id.to_string(),
            parent_session_id: session_id.to_string(),
            task_status: stored_state_for_session(TaskState::Pending, session_id, partitions),
            task_owner: TASK_OWNER_NONE.to_string(),
            queue_handle: QUEUE_HANDLE_NONE.to_string(),
            heartbeat_expiration_timestamp: 0,
            retries: 0,
            task_priority: priority,
            submission_timestamp_ms: now_ms,
            task_completion_timestamp_ms: 0,
            task_definition,
        }
    }

    pub fn logical_state(&self) -> Option<TaskState> {
        parse_stored_state(&self.task_status).map(|(state, _)| state)
    }

    pub fn partition(&self) -> Option<u32> {
        parse_stored_state(&self.task_status).map(|(_, partition)| partition)
    }
}

/// Queue message body: the task reference plus submission timing telemetry.
/// The definition rides along so an agent can start without a row read when
/// payloads are inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub session_id: String,
    pub task_priority: usize,
    pub task_definition: String,
    pub submission_timestamp_ms: i64,
    pub enqueued_timestamp_ms: i64,
}

impl TaskEnvelope {
    pub fn from_row(row: &TaskRow, enqueued_timestamp_ms: i64) -> Self {
        Self {
            task_id: row.task_id.clone(),
            session_id: row.session_id.clone(),
            task_priority: row.task_priority,
            task_definition: row.task_definition.clone(),
            submission_timestamp_ms: row.submission_timestamp_ms,
            enqueued_timestamp_ms,
        }
    }

    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| Error::msg(format!("encode task envelope: {err}")))
    }

    pub fn from_body(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|err| Error::msg(format!("decode task envelope: {err}")))
    }
}
