//! Mock compute worker for local runs and load tests.
//!
//! Input is a JSON object: `{"sleep_ms": 100}` burns wall time,
//! `{"fail": true}` exercises the user-failure path, and anything else is
//! echoed back as the result.

use async_trait::async_trait;
use grid_agent::{Worker, WorkerFailure};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockComputeWorker;

#[derive(Debug, Deserialize, Default)]
struct MockArguments {
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[async_trait]
impl Worker for MockComputeWorker {
    async fn execute(
        &self,
        task_id: &str,
        input: &[u8],
    ) -> std::result::Result<Vec<u8>, WorkerFailure> {
        let args: MockArguments = serde_json::from_slice(input).unwrap_or_default();

        if args.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.sleep_ms)).await;
        }

        if args.fail {
            return Err(WorkerFailure {
                message: format!("mock failure requested for {task_id}"),
                error_payload: input.to_vec(),
            });
        }

        match args.result {
            Some(result) => Ok(result.to_string().into_bytes()),
            None => Ok(input.to_vec()),
        }
    }
}
