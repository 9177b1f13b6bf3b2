//! Session reads and cooperative cancellation.
//!
//! Results are a union of three indexed reads; output bodies stay in the
//! blob store and the `_OUTPUT` arrays carry sentinels the client library
//! resolves on demand. Cancel flips pending and processing rows to
//! `cancelled` without touching the queue: the owning agent discovers the
//! cancellation at its next heartbeat, or the lease expires and the
//! reclaimer acks the message.

use grid_core::{Result, StateStore, TaskState};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// Sentinel for output references; real bytes live at `<task_id>-output`.
pub const READ_FROM_DATAPLANE: &str = "read_from_dataplane";

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub finished: Vec<String>,
    #[serde(rename = "finished_OUTPUT")]
    pub finished_output: Vec<String>,
    pub cancelled: Vec<String>,
    #[serde(rename = "cancelled_OUTPUT")]
    pub cancelled_output: Vec<String>,
    pub failed: Vec<String>,
    #[serde(rename = "failed_OUTPUT")]
    pub failed_output: Vec<String>,
    pub metadata: ResultsMetadata,
}

#[derive(Debug, Serialize)]
pub struct ResultsMetadata {
    pub tasks_in_response: usize,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CancelCounts {
    pub cancelled_pending: usize,
    pub cancelled_processing: usize,
    pub total_cancelled_tasks: usize,
}

#[derive(Clone)]
pub struct QueryApi {
    state: Arc<dyn StateStore>,
}

impl QueryApi {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    pub async fn results(&self, session_id: &str) -> Result<ResultsResponse> {
        let finished = self.task_ids_in_state(session_id, TaskState::Finished).await?;
        let cancelled = self.task_ids_in_state(session_id, TaskState::Cancelled).await?;
        let failed = self.task_ids_in_state(session_id, TaskState::Failed).await?;

        let tasks_in_response = finished.len() + cancelled.len() + failed.len();
        Ok(ResultsResponse {
            finished_output: sentinel_for(&finished),
            cancelled_output: sentinel_for(&cancelled),
            failed_output: sentinel_for(&failed),
            finished,
            cancelled,
            failed,
            metadata: ResultsMetadata { tasks_in_response },
        })
    }

    /// Cancels every pending and processing task of each session. Idempotent:
    /// already-terminal rows are not in either enumeration, so a second call
    /// reports zero counts.
    pub async fn cancel(&self, session_ids: &[String]) -> Result<BTreeMap<String, CancelCounts>> {
        let mut response = BTreeMap::new();
        for session_id in session_ids {
            let counts = self.cancel_session(session_id).await?;
            tracing::info!(
                event = "grid.cancel.session",
                session_id = %session_id,
                cancelled_pending = counts.cancelled_pending,
                cancelled_processing = counts.cancelled_processing,
                "session cancelled"
            );
            response.insert(session_id.clone(), counts);
        }
        Ok(response)
    }

    async fn cancel_session(&self, session_id: &str) -> Result<CancelCounts> {
        let mut counts = CancelCounts::default();
        for (state, slot) in [
            (TaskState::Pending, 0usize),
            (TaskState::Processing, 1usize),
        ] {
            let rows = self.state.query_by_session(session_id, state).await?;
            for row in &rows {
                self.state.cancel(&row.task_id).await?;
            }
            match slot {
                0 => counts.cancelled_pending = rows.len(),
                _ => counts.cancelled_processing = rows.len(),
            }
        }
        counts.total_cancelled_tasks = counts.cancelled_pending + counts.cancelled_processing;
        Ok(counts)
    }

    async fn task_ids_in_state(&self, session_id: &str, state: TaskState) -> Result<Vec<String>> {
        let rows = self.state.query_by_session(session_id, state).await?;
        Ok(rows.into_iter().map(|row| row.task_id).collect())
    }
}

fn sentinel_for(task_ids: &[String]) -> Vec<String> {
    task_ids.iter().map(|_| READ_FROM_DATAPLANE.to_string()).collect()
}
