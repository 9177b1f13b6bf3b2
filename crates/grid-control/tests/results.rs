use grid_control::results::{QueryApi, READ_FROM_DATAPLANE};
use grid_core::{
    mem::MemStateStore,
    model::TaskRow,
    StateStore, TaskState,
};
use std::sync::Arc;

const PARTITIONS: u32 = 32;

async fn seed_session(state: &MemStateStore, session: &str, tasks: usize) -> anyhow::Result<()> {
    let rows: Vec<TaskRow> = (0..tasks)
        .map(|i| TaskRow::new_pending(session, i, 0, PARTITIONS, "work".into(), 1))
        .collect();
    state.put_batch(&rows).await?;
    Ok(())
}

#[tokio::test]
async fn results_union_three_states_with_sentinels() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    seed_session(&state, "s1", 4).await?;

    state.claim("s1_0", "agent-a", "h0", 100).await?;
    state.finalize("s1_0", "agent-a").await?;
    state.claim("s1_1", "agent-a", "h1", 100).await?;
    state.fail("s1_1").await?;
    state.cancel("s1_2").await?;
    // s1_3 stays pending and must not appear.

    let api = QueryApi::new(state.clone());
    let response = api.results("s1").await?;

    assert_eq!(response.finished, vec!["s1_0"]);
    assert_eq!(response.failed, vec!["s1_1"]);
    assert_eq!(response.cancelled, vec!["s1_2"]);
    assert_eq!(response.finished_output, vec![READ_FROM_DATAPLANE]);
    assert_eq!(response.failed_output, vec![READ_FROM_DATAPLANE]);
    assert_eq!(response.cancelled_output, vec![READ_FROM_DATAPLANE]);
    assert_eq!(response.metadata.tasks_in_response, 3);

    let json = serde_json::to_value(&response)?;
    assert!(json.get("finished_OUTPUT").is_some(), "wire field name");
    Ok(())
}

#[tokio::test]
async fn results_for_unknown_session_are_empty() -> anyhow::Result<()> {
    let api = QueryApi::new(Arc::new(MemStateStore::new(PARTITIONS)));
    let response = api.results("nope").await?;
    assert!(response.finished.is_empty());
    assert!(response.cancelled.is_empty());
    assert!(response.failed.is_empty());
    assert_eq!(response.metadata.tasks_in_response, 0);
    Ok(())
}

#[tokio::test]
async fn cancel_counts_pending_and_processing_separately() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    seed_session(&state, "s1", 3).await?;
    state.claim("s1_0", "agent-a", "h0", 100).await?;

    let api = QueryApi::new(state.clone());
    let response = api.cancel(&["s1".to_string()]).await?;
    let counts = response.get("s1").expect("session in response");

    assert_eq!(counts.cancelled_processing, 1);
    assert_eq!(counts.cancelled_pending, 2);
    assert_eq!(counts.total_cancelled_tasks, 3);

    for task in ["s1_0", "s1_1", "s1_2"] {
        let row = state.get(task, true).await?.expect("row exists");
        assert_eq!(row.logical_state(), Some(TaskState::Cancelled));
        assert_eq!(row.task_owner, "NONE");
    }
    Ok(())
}

#[tokio::test]
async fn cancel_is_idempotent() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    seed_session(&state, "s1", 2).await?;

    let api = QueryApi::new(state.clone());
    let first = api.cancel(&["s1".to_string()]).await?;
    assert_eq!(first.get("s1").unwrap().total_cancelled_tasks, 2);

    let second = api.cancel(&["s1".to_string()]).await?;
    let counts = second.get("s1").unwrap();
    assert_eq!(counts.cancelled_pending, 0);
    assert_eq!(counts.cancelled_processing, 0);
    assert_eq!(counts.total_cancelled_tasks, 0);
    Ok(())
}

#[tokio::test]
async fn cancel_does_not_touch_terminal_rows() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    seed_session(&state, "s1", 2).await?;
    state.claim("s1_0", "agent-a", "h0", 100).await?;
    state.finalize("s1_0", "agent-a").await?;

    let api = QueryApi::new(state.clone());
    let response = api.cancel(&["s1".to_string()]).await?;
    assert_eq!(response.get("s1").unwrap().total_cancelled_tasks, 1);

    let finished = state.get("s1_0", true).await?.expect("row exists");
    assert_eq!(finished.logical_state(), Some(TaskState::Finished));
    Ok(())
}

#[tokio::test]
async fn cancel_covers_multiple_sessions() -> anyhow::Result<()> {
    let state = Arc::new(MemStateStore::new(PARTITIONS));
    seed_session(&state, "s1", 1).await?;
    seed_session(&state, "s2", 2).await?;

    let api = QueryApi::new(state);
    let response = api
        .cancel(&["s1".to_string(), "s2".to_string(), "absent".to_string()])
        .await?;

    assert_eq!(response.get("s1").unwrap().total_cancelled_tasks, 1);
    assert_eq!(response.get("s2").unwrap().total_cancelled_tasks, 2);
    assert_eq!(response.get("absent").unwrap().total_cancelled_tasks, 0);
    Ok(())
}
