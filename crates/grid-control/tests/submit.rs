use grid_control::submit::{SubmitContext, SubmitRequest, Submitter, SubmitterConfig, TasksList};
use grid_core::{
    blob::BlobStore,
    mem::{MemObjectStore, MemQueue, MemStateStore},
    model::TaskEnvelope,
    priority::PriorityQueue,
    StateStore, TaskState,
};
use std::{sync::Arc, time::Duration};

struct Fixture {
    state: Arc<MemStateStore>,
    queue: Arc<PriorityQueue>,
    store: Arc<MemObjectStore>,
    submitter: Submitter,
}

fn fixture(tiers: usize, cfg: SubmitterConfig) -> Fixture {
    let state = Arc::new(MemStateStore::new(cfg.partitions));
    let queues = (0..tiers)
        .map(|tier| Arc::new(MemQueue::new(format!("grid_tasks__{tier}"))) as Arc<_>)
        .collect();
    let queue = Arc::new(PriorityQueue::new(queues).unwrap());
    let store = Arc::new(MemObjectStore::new());
    let submitter = Submitter::new(
        state.clone(),
        queue.clone(),
        BlobStore::new(store.clone()),
        cfg,
    );
    Fixture {
        state,
        queue,
        store,
        submitter,
    }
}

fn request(session_id: &str, tasks: usize, priority: Option<usize>) -> SubmitRequest {
    SubmitRequest {
        session_id: session_id.to_string(),
        context: priority.map(|tasks_priority| SubmitContext { tasks_priority }),
        scheduler_data: None,
        tasks_list: TasksList {
            tasks: (0..tasks)
                .map(|i| serde_json::json!({ "worker_arguments": [i.to_string(), "1", "2"] }))
                .collect(),
        },
    }
}

#[tokio::test]
async fn happy_path_materializes_rows_then_enqueues() -> anyhow::Result<()> {
    let fx = fixture(1, SubmitterConfig::default());

    let response = fx.submitter.submit(&request("s1", 3, None)).await?;
    assert_eq!(response.session_id, "s1");
    assert_eq!(response.task_ids, vec!["s1_0", "s1_1", "s1_2"]);
    assert!(response.failed.is_empty());

    assert_eq!(fx.state.row_count(), 3);
    let pending = fx.state.query_by_session("s1", TaskState::Pending).await?;
    assert_eq!(pending.len(), 3);
    for row in &pending {
        assert_eq!(row.task_owner, "NONE");
        assert_eq!(row.retries, 0);
        assert!(row.submission_timestamp_ms > 0);
    }

    assert_eq!(fx.queue.depth(None).await?, 3);
    let (msg, tier) = fx
        .queue
        .receive(Duration::ZERO, Duration::from_secs(30))
        .await?
        .expect("message enqueued");
    assert_eq!(tier, 0);
    let envelope = TaskEnvelope::from_body(&msg.body)?;
    assert_eq!(envelope.session_id, "s1");
    assert!(envelope.task_definition.contains("worker_arguments"));
    assert!(envelope.enqueued_timestamp_ms >= envelope.submission_timestamp_ms);
    Ok(())
}

#[tokio::test]
async fn duplicate_session_is_a_conflict() -> anyhow::Result<()> {
    let fx = fixture(1, SubmitterConfig::default());

    fx.submitter.submit(&request("s1", 1, None)).await?;
    let second = fx.submitter.submit(&request("s1", 1, None)).await;
    assert!(second.unwrap_err().is_condition());

    // The failed resubmission must not have enqueued anything new.
    assert_eq!(fx.queue.depth(None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn validation_rejects_malformed_requests() {
    let fx = fixture(2, SubmitterConfig::default());

    assert!(fx.submitter.validate(&request("", 1, None)).is_err());
    assert!(fx.submitter.validate(&request("has_underscore", 1, None)).is_err());
    assert!(fx.submitter.validate(&request("s1", 0, None)).is_err());
    assert!(fx.submitter.validate(&request("s1", 1, Some(2))).is_err());
    assert_eq!(fx.submitter.validate(&request("s1", 1, Some(1))), Ok(1));
    assert_eq!(fx.submitter.validate(&request("s1", 1, None)), Ok(0));
}

#[tokio::test]
async fn priority_selects_the_queue_tier() -> anyhow::Result<()> {
    let fx = fixture(2, SubmitterConfig::default());

    fx.submitter.submit(&request("low", 2, Some(0))).await?;
    fx.submitter.submit(&request("high", 1, Some(1))).await?;

    assert_eq!(fx.queue.depth(Some(0)).await?, 2);
    assert_eq!(fx.queue.depth(Some(1)).await?, 1);

    let (msg, tier) = fx
        .queue
        .receive(Duration::ZERO, Duration::from_secs(30))
        .await?
        .expect("message enqueued");
    assert_eq!(tier, 1);
    assert!(msg.body.contains("high_0"));
    Ok(())
}

#[tokio::test]
async fn throttled_batch_writes_back_off_until_all_rows_land() -> anyhow::Result<()> {
    let cfg = SubmitterConfig {
        write_backoff_base: Duration::from_millis(1),
        write_backoff_cap: Duration::from_millis(5),
        write_backoff_attempts: 64,
        ..SubmitterConfig::default()
    };
    let fx = fixture(1, cfg);

    // Roughly a third of the batch writes fail with backpressure.
    fx.state.throttle_every_nth_batch(3);

    let response = fx.submitter.submit(&request("big", 1000, None)).await?;
    assert_eq!(response.task_ids.len(), 1000);
    assert!(response.failed.is_empty());

    // Every row exists exactly once and every message was enqueued.
    assert_eq!(fx.state.row_count(), 1000);
    assert_eq!(fx.queue.depth(None).await?, 1000);

    let ids: std::collections::HashSet<&String> = response.task_ids.iter().collect();
    assert_eq!(ids.len(), 1000, "duplicate task ids in response");
    Ok(())
}

#[tokio::test]
async fn exhausted_backoff_surfaces_the_throttle() -> anyhow::Result<()> {
    let cfg = SubmitterConfig {
        write_backoff_base: Duration::from_millis(1),
        write_backoff_cap: Duration::from_millis(2),
        write_backoff_attempts: 2,
        ..SubmitterConfig::default()
    };
    let fx = fixture(1, cfg);
    fx.state.throttle_every_nth_batch(1);

    let err = fx.submitter.submit(&request("s1", 4, None)).await.unwrap_err();
    assert!(err.is_throttled());
    Ok(())
}

#[tokio::test]
async fn payload_indirection_writes_input_and_session_envelope() -> anyhow::Result<()> {
    let cfg = SubmitterConfig {
        payload_in_external_store: true,
        ..SubmitterConfig::default()
    };
    let fx = fixture(1, cfg);

    fx.submitter.submit(&request("s1", 2, None)).await?;

    let blobs = BlobStore::new(fx.store.clone());
    let input = blobs.get_input("s1_0").await?;
    assert!(String::from_utf8(input)?.contains("worker_arguments"));
    assert!(blobs.get_input("s1_1").await.is_ok());

    let payload = blobs.get_payload_utf8("s1").await?;
    let decoded: Vec<serde_json::Value> = serde_json::from_str(&payload)?;
    assert_eq!(decoded.len(), 2);

    // Rows carry the indirection marker, not the payload bytes.
    let rows = fx.state.query_by_session("s1", TaskState::Pending).await?;
    assert!(rows
        .iter()
        .all(|row| row.task_definition.starts_with("passed_via_external_storage_")));
    Ok(())
}
