//! Builds the concrete service graph from config.
//!
//! Every process (control plane, agent, reclaimer) wires the same explicit
//! dependency objects; nothing is reachable through globals. Tests substitute
//! the in-memory doubles for the same traits.

use crate::config::GridConfig;
use anyhow::Context;
use grid_agent::AgentConfig;
use grid_control::{reclaim::ReclaimerConfig, submit::SubmitterConfig};
use grid_core::{
    backoff::ThrottleWindow,
    blob::BlobStore,
    http_store::HttpObjectStore,
    pg::{PgQueue, PgStateStore},
    priority::PriorityQueue,
    StateStore, TaskQueue,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};

pub struct GridServices {
    pub state: Arc<dyn StateStore>,
    pub queue: Arc<PriorityQueue>,
    pub dead_letter: Arc<dyn TaskQueue>,
    pub blobs: BlobStore,
    pub throttle: Arc<ThrottleWindow>,
}

pub async fn connect(cfg: &GridConfig) -> anyhow::Result<GridServices> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    let throttle = Arc::new(ThrottleWindow::new(Duration::from_secs(60)));
    let state: Arc<dyn StateStore> = Arc::new(PgStateStore::with_throttle_window(
        pool.clone(),
        cfg.state_partitions,
        throttle.clone(),
    ));

    let queue = match cfg.task_queue_service.as_str() {
        "single" => Arc::new(PriorityQueue::single(Arc::new(PgQueue::new(
            pool.clone(),
            tier_queue_name(&cfg.tasks_queue_name, 0),
        )))),
        "priority" => {
            let tiers: Vec<Arc<dyn TaskQueue>> = (0..cfg.priorities.max(1))
                .map(|tier| {
                    Arc::new(PgQueue::new(
                        pool.clone(),
                        tier_queue_name(&cfg.tasks_queue_name, tier),
                    )) as Arc<dyn TaskQueue>
                })
                .collect();
            Arc::new(PriorityQueue::new(tiers).map_err(anyhow::Error::from)?)
        }
        other => anyhow::bail!("unknown task_queue_service [{other}], expected single|priority"),
    };

    let dead_letter: Arc<dyn TaskQueue> = Arc::new(PgQueue::new(
        pool,
        format!("{}_dlq", cfg.tasks_queue_name),
    ));

    let store = HttpObjectStore::new(&cfg.object_store_endpoint, &cfg.object_store_bucket)
        .map_err(anyhow::Error::from)
        .context("init object store")?;
    let blobs = BlobStore::new(Arc::new(store));

    Ok(GridServices {
        state,
        queue,
        dead_letter,
        blobs,
        throttle,
    })
}

/// Priority tiers are independent queues named `<base>__<priority>`.
pub fn tier_queue_name(base: &str, tier: usize) -> String {
    format!("{base}__{tier}")
}

pub fn submitter_config(cfg: &GridConfig) -> SubmitterConfig {
    SubmitterConfig {
        partitions: cfg.state_partitions,
        payload_in_external_store: cfg.payload_in_external_store,
        ..SubmitterConfig::default()
    }
}

pub fn reclaimer_config(cfg: &GridConfig) -> ReclaimerConfig {
    ReclaimerConfig {
        partitions: cfg.state_partitions,
        page_limit: cfg.reclaimer_page_limit,
        max_retries: cfg.max_retries,
        throttle_skip_threshold: cfg.throttle_backoff_skip_threshold,
    }
}

pub fn agent_config(cfg: &GridConfig) -> AgentConfig {
    AgentConfig {
        empty_queue_backoff: cfg.empty_queue_backoff(),
        task_visibility: cfg.agent_visibility(),
        ttl_refresh_interval_sec: cfg.ttl_refresh_interval_sec,
        ttl_expiration_offset_sec: cfg.ttl_expiration_offset_sec,
        payload_in_external_store: cfg.payload_in_external_store,
        ..AgentConfig::default()
    }
}
