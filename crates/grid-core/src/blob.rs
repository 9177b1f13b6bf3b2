//! Task-keyed blob layout over an [`ObjectStore`].
//!
//! Key = `<task_id><suffix>` with suffix in {-input, -output, -error,
//! -payload}, optionally under a namespacing prefix. Content is opaque; the
//! UTF-8 accessors exist for text payloads only.

use crate::{Error, ObjectStore, Result};
use std::sync::Arc;

pub const INPUT_SUFFIX: &str = "-input";
pub const OUTPUT_SUFFIX: &str = "-output";
pub const ERROR_SUFFIX: &str = "-error";
pub const PAYLOAD_SUFFIX: &str = "-payload";

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: None,
        }
    }

    pub fn with_prefix(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: Some(prefix.into()),
        }
    }

    fn key(&self, id: &str, suffix: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{id}{suffix}", prefix.trim_end_matches('/')),
            None => format!("{id}{suffix}"),
        }
    }

    pub async fn put_input(&self, task_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_bytes(&self.key(task_id, INPUT_SUFFIX), bytes).await
    }

    pub async fn get_input(&self, task_id: &str) -> Result<Vec<u8>> {
        self.store.get_bytes(&self.key(task_id, INPUT_SUFFIX)).await
    }

    pub async fn put_output(&self, task_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_bytes(&self.key(task_id, OUTPUT_SUFFIX), bytes).await
    }

    pub async fn get_output(&self, task_id: &str) -> Result<Vec<u8>> {
        self.store.get_bytes(&self.key(task_id, OUTPUT_SUFFIX)).await
    }

    pub async fn output_exists(&self, task_id: &str) -> Result<bool> {
        self.store.exists(&self.key(task_id, OUTPUT_SUFFIX)).await
    }

    pub async fn put_error(&self, task_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_bytes(&self.key(task_id, ERROR_SUFFIX), bytes).await
    }

    pub async fn get_error(&self, task_id: &str) -> Result<Vec<u8>> {
        self.store.get_bytes(&self.key(task_id, ERROR_SUFFIX)).await
    }

    /// Whole-batch submission envelope, keyed by session id.
    pub async fn put_payload(&self, session_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_bytes(&self.key(session_id, PAYLOAD_SUFFIX), bytes).await
    }

    pub async fn get_payload(&self, session_id: &str) -> Result<Vec<u8>> {
        self.store.get_bytes(&self.key(session_id, PAYLOAD_SUFFIX)).await
    }

    pub async fn get_output_utf8(&self, task_id: &str) -> Result<String> {
        let bytes = self.get_output(task_id).await?;
        String::from_utf8(bytes)
            .map_err(|err| Error::msg(format!("output of {task_id} is not utf-8: {err}")))
    }

    pub async fn get_payload_utf8(&self, session_id: &str) -> Result<String> {
        let bytes = self.get_payload(session_id).await?;
        String::from_utf8(bytes)
            .map_err(|err| Error::msg(format!("payload of {session_id} is not utf-8: {err}")))
    }
}
