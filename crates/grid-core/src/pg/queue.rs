use crate::{Error, QueueMessage, QueueSend, Result, SendReport, TaskQueue};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Postgres-backed dispatch queue over `grid.queue_messages`.
///
/// `FOR UPDATE SKIP LOCKED` keeps concurrent receivers from leasing the same
/// message; invisibility is a timestamp the poll predicate excludes. Postgres
/// cannot block a receive, so the long poll is a bounded sleep loop.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    name: String,
}

const POLL_SLEEP: Duration = Duration::from_millis(50);

impl PgQueue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    async fn try_receive(&self, visibility: Duration) -> Result<Option<QueueMessage>> {
        let visibility_millis = duration_millis(visibility);
        let row = sqlx::query(
            r#"
            WITH picked AS (
              SELECT message_id
              FROM grid.queue_messages
              WHERE queue_name = $1
                AND available_at <= now()
                AND (invisible_until IS NULL OR invisible_until <= now())
              ORDER BY available_at, created_at
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE grid.queue_messages AS m
            SET invisible_until = now() + ($2::text || ' milliseconds')::interval,
                deliveries = deliveries + 1
            FROM picked
            WHERE m.message_id = picked.message_id
            RETURNING m.message_id, m.body, m.deliveries
            "#,
        )
        .bind(&self.name)
        .bind(visibility_millis)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("pgqueue receive from queue={}", self.name))
        .map_err(Error::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: Uuid = row.try_get("message_id").context("message_id")?;
        let message_id = message_id.to_string();
        Ok(Some(QueueMessage {
            handle: message_id.clone(),
            message_id,
            body: row.try_get("body").context("body")?,
            deliveries: row.try_get("deliveries").context("deliveries")?,
        }))
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, entries: &[QueueSend]) -> Result<SendReport> {
        let mut report = SendReport::default();
        for entry in entries {
            let message_id = Uuid::new_v4();
            let res = sqlx::query(
                r#"
                INSERT INTO grid.queue_messages (message_id, queue_name, body, available_at)
                VALUES ($1, $2, $3, now())
                "#,
            )
            .bind(message_id)
            .bind(&self.name)
            .bind(&entry.body)
            .execute(&self.pool)
            .await;

            match res {
                Ok(_) => report.sent.push(entry.id.clone()),
                Err(err) => report.failed.push(crate::SendFailure {
                    id: entry.id.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(msg) = self.try_receive(visibility).await? {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_SLEEP).await;
        }
    }

    async fn ack(&self, handle: &str) -> Result<()> {
        let message_id = parse_handle(handle)?;
        let deleted = sqlx::query(
            r#"
            DELETE FROM grid.queue_messages
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("pgqueue ack")
        .map_err(Error::from)?;

        if deleted.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "no message for handle [{handle}] in queue [{}]",
                self.name
            )));
        }
        Ok(())
    }

    async fn extend_lease(&self, handle: &str, visibility: Duration) -> Result<()> {
        let message_id = parse_handle(handle)?;
        let visibility_millis = duration_millis(visibility);
        let updated = sqlx::query(
            r#"
            UPDATE grid.queue_messages
            SET invisible_until = now() + ($2::text || ' milliseconds')::interval
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(visibility_millis)
        .execute(&self.pool)
        .await
        .context("pgqueue extend lease")
        .map_err(Error::from)?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "no message for handle [{handle}] in queue [{}]",
                self.name
            )));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*)
            FROM grid.queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .context("pgqueue depth")
        .map_err(Error::from)?;

        Ok(count)
    }
}

fn parse_handle(handle: &str) -> Result<Uuid> {
    Uuid::parse_str(handle)
        .context("parse queue handle as uuid")
        .map_err(Error::from)
}

fn duration_millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}
