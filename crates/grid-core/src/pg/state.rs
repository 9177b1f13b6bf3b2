use crate::{
    backoff::ThrottleWindow,
    model::{
        session_of_task, stored_state, stored_state_for_session, TaskState, TASK_OWNER_NONE,
    },
    Error, Result, StateStore, TaskRow,
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;

/// State table over `grid.tasks`.
///
/// Postgres reads are strongly consistent, so the `consistent` flag of
/// `get` is accepted and ignored. Throttling does not naturally occur here
/// the way it does on a provisioned row store; connection-pool exhaustion is
/// surfaced as `Throttled` so callers keep the same backoff discipline.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
    partitions: u32,
    throttle_window: Option<Arc<ThrottleWindow>>,
}

impl PgStateStore {
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions,
            throttle_window: None,
        }
    }

    pub fn with_throttle_window(
        pool: PgPool,
        partitions: u32,
        window: Arc<ThrottleWindow>,
    ) -> Self {
        Self {
            pool,
            partitions,
            throttle_window: Some(window),
        }
    }

    fn stored_for_task(&self, task_id: &str, state: TaskState) -> Result<String> {
        let session = session_of_task(task_id)?;
        Ok(stored_state_for_session(state, session, self.partitions))
    }

    fn map_err(&self, err: sqlx::Error, what: &str) -> Error {
        if matches!(err, sqlx::Error::PoolTimedOut) {
            if let Some(window) = &self.throttle_window {
                window.record();
            }
            return Error::throttled(format!("{what}: state db pool timed out"));
        }
        Error::from(anyhow::Error::from(err).context(what.to_string()))
    }

    async fn set_terminal(&self, task_id: &str, state: TaskState) -> Result<()> {
        let stored = self.stored_for_task(task_id, state)?;
        let updated = sqlx::query(
            r#"
            UPDATE grid.tasks
            SET task_status = $2,
                task_owner = $3,
                updated_at = now()
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(&stored)
        .bind(TASK_OWNER_NONE)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "set terminal state"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "no row for task [{task_id}] while setting [{stored}]"
            )));
        }
        Ok(())
    }
}

fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<TaskRow> {
    let retries: i32 = row.try_get("retries").context("retries")?;
    let task_priority: i32 = row.try_get("task_priority").context("task_priority")?;
    Ok(TaskRow {
        task_id: row.try_get("task_id").context("task_id")?,
        session_id: row.try_get("session_id").context("session_id")?,
        parent_session_id: row
            .try_get("parent_session_id")
            .context("parent_session_id")?,
        task_status: row.try_get("task_status").context("task_status")?,
        task_owner: row.try_get("task_owner").context("task_owner")?,
        queue_handle: row.try_get("queue_handle").context("queue_handle")?,
        heartbeat_expiration_timestamp: row
            .try_get("heartbeat_expiration_timestamp")
            .context("heartbeat_expiration_timestamp")?,
        retries: retries.max(0) as u32,
        task_priority: task_priority.max(0) as usize,
        submission_timestamp_ms: row
            .try_get("submission_timestamp_ms")
            .context("submission_timestamp_ms")?,
        task_completion_timestamp_ms: row
            .try_get("task_completion_timestamp_ms")
            .context("task_completion_timestamp_ms")?,
        task_definition: row.try_get("task_definition").context("task_definition")?,
    })
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn put_batch(&self, rows: &[TaskRow]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.map_err(e, "begin batch write"))?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO grid.tasks (
                  task_id, session_id, parent_session_id, task_status, task_owner,
                  queue_handle, heartbeat_expiration_timestamp, retries, task_priority,
                  submission_timestamp_ms, task_completion_timestamp_ms, task_definition
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (task_id) DO UPDATE SET
                  session_id = EXCLUDED.session_id,
                  parent_session_id = EXCLUDED.parent_session_id,
                  task_status = EXCLUDED.task_status,
                  task_owner = EXCLUDED.task_owner,
                  queue_handle = EXCLUDED.queue_handle,
                  heartbeat_expiration_timestamp = EXCLUDED.heartbeat_expiration_timestamp,
                  retries = EXCLUDED.retries,
                  task_priority = EXCLUDED.task_priority,
                  submission_timestamp_ms = EXCLUDED.submission_timestamp_ms,
                  task_completion_timestamp_ms = EXCLUDED.task_completion_timestamp_ms,
                  task_definition = EXCLUDED.task_definition,
                  updated_at = now()
                "#,
            )
            .bind(&row.task_id)
            .bind(&row.session_id)
            .bind(&row.parent_session_id)
            .bind(&row.task_status)
            .bind(&row.task_owner)
            .bind(&row.queue_handle)
            .bind(row.heartbeat_expiration_timestamp)
            .bind(row.retries.min(i32::MAX as u32) as i32)
            .bind(row.task_priority.min(i32::MAX as usize) as i32)
            .bind(row.submission_timestamp_ms)
            .bind(row.task_completion_timestamp_ms)
            .bind(&row.task_definition)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.map_err(e, "batch write row"))?;
        }

        tx.commit()
            .await
            .map_err(|e| self.map_err(e, "commit batch write"))?;
        Ok(())
    }

    async fn claim(&self, task_id: &str, owner: &str, handle: &str, expiry: i64) -> Result<()> {
        let pending = self.stored_for_task(task_id, TaskState::Pending)?;
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;

        let updated = sqlx::query(
            r#"
            UPDATE grid.tasks
            SET task_owner = $2,
                task_status = $3,
                heartbeat_expiration_timestamp = $4,
                queue_handle = $5,
                updated_at = now()
            WHERE task_id = $1
              AND task_status = $6
              AND task_owner = $7
            "#,
        )
        .bind(task_id)
        .bind(owner)
        .bind(&processing)
        .bind(expiry)
        .bind(handle)
        .bind(&pending)
        .bind(TASK_OWNER_NONE)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "claim task"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::condition(format!(
                "could not acquire [{task_id}] for status [{pending}], someone else already \
                 locked it?"
            )));
        }
        Ok(())
    }

    async fn refresh_ttl(&self, task_id: &str, owner: &str, new_expiry: i64) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;

        let updated = sqlx::query(
            r#"
            UPDATE grid.tasks
            SET heartbeat_expiration_timestamp = $2,
                updated_at = now()
            WHERE task_id = $1
              AND task_status = $3
              AND task_owner = $4
            "#,
        )
        .bind(task_id)
        .bind(new_expiry)
        .bind(&processing)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "refresh ttl"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::condition(format!(
                "could not refresh ttl on [{task_id}] as [{owner}], was the lease reassigned?"
            )));
        }
        Ok(())
    }

    async fn finalize(&self, task_id: &str, owner: &str) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;
        let finished = self.stored_for_task(task_id, TaskState::Finished)?;

        let updated = sqlx::query(
            r#"
            UPDATE grid.tasks
            SET task_status = $2,
                task_completion_timestamp_ms = $3,
                updated_at = now()
            WHERE task_id = $1
              AND task_status = $4
              AND task_owner = $5
            "#,
        )
        .bind(task_id)
        .bind(&finished)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(&processing)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "finalize task"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::condition(format!(
                "could not set [{task_id}] to finished as [{owner}]"
            )));
        }
        Ok(())
    }

    async fn retry(&self, task_id: &str, new_retry_count: u32) -> Result<()> {
        let processing = self.stored_for_task(task_id, TaskState::Processing)?;
        let pending = self.stored_for_task(task_id, TaskState::Pending)?;

        let updated = sqlx::query(
            r#"
            UPDATE grid.tasks
            SET task_owner = $2,
                task_status = $3,
                retries = $4,
                updated_at = now()
            WHERE task_id = $1
              AND task_status = $5
            "#,
        )
        .bind(task_id)
        .bind(TASK_OWNER_NONE)
        .bind(&pending)
        .bind(new_retry_count.min(i32::MAX as u32) as i32)
        .bind(&processing)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "retry task"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::condition(format!(
                "[{task_id}] is no longer in [{processing}]"
            )));
        }
        Ok(())
    }

    async fn fail(&self, task_id: &str) -> Result<()> {
        self.set_terminal(task_id, TaskState::Failed).await
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        self.set_terminal(task_id, TaskState::Cancelled).await
    }

    async fn mark_inconsistent(&self, task_id: &str) -> Result<()> {
        self.set_terminal(task_id, TaskState::Inconsistent).await
    }

    async fn get(&self, task_id: &str, _consistent: bool) -> Result<Option<TaskRow>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, session_id, parent_session_id, task_status, task_owner,
                   queue_handle, heartbeat_expiration_timestamp, retries, task_priority,
                   submission_timestamp_ms, task_completion_timestamp_ms, task_definition
            FROM grid.tasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "get task"))?;

        row.as_ref().map(row_from_pg).transpose()
    }

    async fn query_by_session(
        &self,
        session_id: &str,
        logical_state: TaskState,
    ) -> Result<Vec<TaskRow>> {
        let wanted = stored_state_for_session(logical_state, session_id, self.partitions);
        let rows = sqlx::query(
            r#"
            SELECT task_id, session_id, parent_session_id, task_status, task_owner,
                   queue_handle, heartbeat_expiration_timestamp, retries, task_priority,
                   submission_timestamp_ms, task_completion_timestamp_ms, task_definition
            FROM grid.tasks
            WHERE session_id = $1
              AND task_status = $2
            ORDER BY task_id
            "#,
        )
        .bind(session_id)
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "query session"))?;

        rows.iter().map(row_from_pg).collect()
    }

    async fn query_expired(&self, partition: u32, now: i64, limit: i64) -> Result<Vec<TaskRow>> {
        let wanted = stored_state(TaskState::Processing, partition);
        let rows = sqlx::query(
            r#"
            SELECT task_id, session_id, parent_session_id, task_status, task_owner,
                   queue_handle, heartbeat_expiration_timestamp, retries, task_priority,
                   submission_timestamp_ms, task_completion_timestamp_ms, task_definition
            FROM grid.tasks
            WHERE task_status = $1
              AND heartbeat_expiration_timestamp < $2
            ORDER BY heartbeat_expiration_timestamp
            LIMIT $3
            "#,
        )
        .bind(&wanted)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "query expired"))?;

        rows.iter().map(row_from_pg).collect()
    }

    async fn session_has_rows(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
            FROM grid.tasks
            WHERE session_id = $1
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.map_err(e, "check session rows"))?;

        Ok(row.is_some())
    }
}
