//! Reclamation sweep for leases past expiry.
//!
//! Each invocation walks the state partitions from a random start offset so
//! no partition is starved under a backlog. Expired rows either go back to
//! `pending` with an incremented retry count (and their queue message made
//! immediately visible) or, at the retry ceiling, to `failed` with the
//! message acked. Pages are processed independently; a failure in one
//! partition never blocks progress on the others.

use grid_core::{
    backoff::ThrottleWindow,
    metrics::{EventsCounter, Metrics},
    priority::PriorityQueue,
    QueueSend, Result, StateStore, TaskQueue, TaskRow,
};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    pub partitions: u32,
    pub page_limit: i64,
    pub max_retries: u32,
    /// Observed write-throttle events over the window above which a whole
    /// cycle is skipped instead of adding load to a store under pressure.
    pub throttle_skip_threshold: usize,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            partitions: 32,
            page_limit: 200,
            max_retries: 5,
            throttle_skip_threshold: 1000,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub skipped_for_throttling: bool,
    pub expired: usize,
    pub retried: usize,
    pub failed: usize,
    pub inconsistent: usize,
}

pub struct Reclaimer {
    state: Arc<dyn StateStore>,
    queue: Arc<PriorityQueue>,
    dead_letter: Option<Arc<dyn TaskQueue>>,
    throttle: Arc<ThrottleWindow>,
    cfg: ReclaimerConfig,
}

impl Reclaimer {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<PriorityQueue>,
        dead_letter: Option<Arc<dyn TaskQueue>>,
        throttle: Arc<ThrottleWindow>,
        cfg: ReclaimerConfig,
    ) -> Self {
        Self {
            state,
            queue,
            dead_letter,
            throttle,
            cfg,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let counter = EventsCounter::new();
        let mut report = SweepReport::default();

        let throttle_events = self.throttle.count();
        if throttle_events > self.cfg.throttle_skip_threshold {
            tracing::warn!(
                event = "grid.reclaim.skip_throttled",
                throttle_events,
                threshold = self.cfg.throttle_skip_threshold,
                "state table under throttling, skipping this cycle"
            );
            counter.increment("counter_skip_check_under_throttling", 1);
            report.skipped_for_throttling = true;
            return Ok(report);
        }

        let now = chrono::Utc::now().timestamp();
        let start = rand::thread_rng().gen_range(0..self.cfg.partitions.max(1));

        for step in 0..self.cfg.partitions {
            let partition = (start + step) % self.cfg.partitions;
            let expired = match self
                .state
                .query_expired(partition, now, self.cfg.page_limit)
                .await
            {
                Ok(expired) => expired,
                Err(err) => {
                    // One bad partition must not stall the rest of the sweep.
                    tracing::warn!(
                        event = "grid.reclaim.partition_scan_failed",
                        partition,
                        error = %err,
                        "skipping partition"
                    );
                    continue;
                }
            };

            report.expired += expired.len();
            counter.increment("counter_expired_tasks", expired.len() as i64);

            for row in expired {
                if let Err(err) = self.reclaim_one(&row, &mut report, &counter).await {
                    tracing::warn!(
                        event = "grid.reclaim.task_failed",
                        task_id = %row.task_id,
                        error = %err,
                        "could not reclaim task, continuing"
                    );
                }
            }
        }

        tracing::info!(
            event = "grid.reclaim.sweep_done",
            expired = report.expired,
            retried = report.retried,
            failed = report.failed,
            inconsistent = report.inconsistent,
            "reclamation sweep complete"
        );
        Ok(report)
    }

    pub async fn sweep_with_metrics(&self, metrics: &dyn Metrics) -> Result<SweepReport> {
        metrics.timestamp("reclaim_sweep_start");
        let report = self.sweep().await?;
        metrics.record("counter_expired_tasks", report.expired as i64);
        metrics.record("counter_retried_tasks", report.retried as i64);
        metrics.record("counter_failed_tasks", report.failed as i64);
        metrics.timestamp("reclaim_sweep_done");
        Ok(report)
    }

    async fn reclaim_one(
        &self,
        expired: &TaskRow,
        report: &mut SweepReport,
        counter: &EventsCounter,
    ) -> Result<()> {
        // The expiry-index projection may be stale; re-read the row for the
        // current retries, handle, and priority.
        let Some(row) = self.state.get(&expired.task_id, true).await? else {
            return Ok(());
        };
        let task_id = row.task_id.as_str();
        let priority = row.task_priority;

        if row.retries >= self.cfg.max_retries {
            tracing::info!(
                event = "grid.reclaim.retries_exhausted",
                task_id,
                retries = row.retries,
                last_owner = %row.task_owner,
                "failing task"
            );
            if let Err(err) = self.queue.ack(&row.queue_handle, Some(priority)).await {
                // The message may already be gone; the row is authoritative.
                tracing::warn!(
                    event = "grid.reclaim.ack_failed",
                    task_id,
                    error = %err,
                    "could not remove queue message for failed task"
                );
            }
            self.state.fail(task_id).await?;
            counter.increment("counter_failed_tasks", 1);
            report.failed += 1;
            return Ok(());
        }

        match self.state.retry(task_id, row.retries + 1).await {
            Ok(()) => {}
            Err(err) if err.is_condition() => {
                // The agent finalized first; nothing to do.
                tracing::info!(
                    event = "grid.reclaim.lost_race",
                    task_id,
                    "task left processing before the reset"
                );
                return Ok(());
            }
            Err(err) if err.is_throttled() => {
                tracing::warn!(
                    event = "grid.reclaim.retry_throttled",
                    task_id,
                    "skipping task under throttling"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        counter.increment("counter_retried_tasks", 1);

        // The row is pending again; the message must re-appear at the head of
        // its subqueue or no agent will ever see the task.
        match self
            .queue
            .extend_lease(&row.queue_handle, Duration::ZERO, Some(priority))
            .await
        {
            Ok(()) => {
                report.retried += 1;
                tracing::info!(
                    event = "grid.reclaim.retried",
                    task_id,
                    retries = row.retries + 1,
                    "task requeued"
                );
                Ok(())
            }
            Err(err) => {
                counter.increment("counter_retried_tasks_vto_reset_fail", 1);
                self.quarantine(&row, err).await?;
                report.inconsistent += 1;
                Ok(())
            }
        }
    }

    /// The pending row has no visible queue message. Pull the message out of
    /// circulation if it still exists, dead-letter the row for operators,
    /// and mark the row so the session index shows the damage.
    async fn quarantine(&self, row: &TaskRow, cause: grid_core::Error) -> Result<()> {
        tracing::error!(
            event = "grid.reclaim.inconsistent",
            task_id = %row.task_id,
            error = %cause,
            "could not re-expose queue message for retried task"
        );

        if let Err(err) = self
            .queue
            .ack(&row.queue_handle, Some(row.task_priority))
            .await
        {
            tracing::warn!(
                event = "grid.reclaim.quarantine_ack_failed",
                task_id = %row.task_id,
                error = %err,
                "queue message left behind while quarantining"
            );
        }

        if let Some(dlq) = &self.dead_letter {
            let body = serde_json::to_string(row)
                .map_err(|err| grid_core::Error::msg(format!("encode dead-letter row: {err}")))?;
            let report = dlq
                .send(&[QueueSend {
                    id: row.task_id.clone(),
                    body,
                }])
                .await?;
            if !report.failed.is_empty() {
                tracing::warn!(
                    event = "grid.reclaim.dead_letter_failed",
                    task_id = %row.task_id,
                    "could not dead-letter quarantined task"
                );
            }
        }

        self.state.mark_inconsistent(&row.task_id).await
    }

    /// Periodic in-process loop, for deployments without an external
    /// scheduler. Each tick is one independent sweep.
    pub async fn run_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            if let Err(err) = self.sweep().await {
                tracing::warn!(
                    event = "grid.reclaim.sweep_error",
                    error = %err,
                    "reclamation sweep error"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }
}
