//! Shared core abstractions for the compute grid.
//!
//! This crate defines the contracts shared by the control plane, the agents,
//! and the reclaimer: the authoritative state table, the leased task queue,
//! and the opaque blob store. Everything else in the workspace talks to these
//! traits; concrete backends (in-memory, Postgres, HTTP object store, and the
//! optional AWS adapters) live here too so that every process wires the same
//! implementations.
//!
//! # API notes
//! `grid-core` is an internal crate (`publish = false`). Its public API uses a
//! few third-party types (`chrono::DateTime<Utc>`, `serde_json::Value`) as
//! part of the grid contract.

use async_trait::async_trait;
use std::{fmt, time::Duration};

pub mod backoff;
pub mod blob;
pub mod mem;
pub mod metrics;
pub mod model;
pub mod pg;
pub mod priority;
pub mod ttl;

pub mod http_store;

#[cfg(feature = "aws")]
pub mod aws;

pub use model::{TaskRow, TaskState};

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by every grid collaborator.
///
/// Callers branch on the kind, never on the message:
/// - `Throttled` is transient backpressure, retried with jittered backoff;
/// - `Condition` means a conditional predicate lost a race and must never be
///   retried at the same layer;
/// - `NotFound` is a read of a key that was never written;
/// - `Fatal` is everything unexpected and is bubbled up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Throttled,
    Condition,
    NotFound,
    Fatal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Throttled,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn condition(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Condition,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn with_kind(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == ErrorKind::Throttled
    }

    pub fn is_condition(&self) -> bool {
        self.kind == ErrorKind::Condition
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            inner: value,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            inner: anyhow::Error::from(value),
        }
    }
}

/// One message leased from a task queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque token used to ack or change the visibility of the message.
    ///
    /// - MemQueue/PgQueue: UUID string
    /// - SQS: ReceiptHandle
    pub handle: String,

    /// Provider message id (for tracing).
    pub message_id: String,

    /// Raw JSON body as enqueued by the submitter.
    pub body: String,

    pub deliveries: i32,
}

/// One entry of a batch send. `id` correlates per-message outcomes in the
/// report; the submitter uses the task id.
#[derive(Debug, Clone)]
pub struct QueueSend {
    pub id: String,
    pub body: String,
}

/// Per-message outcome of a batch send. Sends are atomic per message, never
/// per batch; callers must tolerate partial success.
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    pub sent: Vec<String>,
    pub failed: Vec<SendFailure>,
}

#[derive(Debug, Clone)]
pub struct SendFailure {
    pub id: String,
    pub reason: String,
}

/// A single dispatch queue with per-message invisibility leasing.
///
/// The priority tier in [`priority::PriorityQueue`] is an ordered list of
/// these; everything above the tier speaks to that wrapper instead.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, entries: &[QueueSend]) -> Result<SendReport>;

    /// Long-polls one message and leases it for `visibility`. Returns `None`
    /// when the queue stayed empty for the whole wait.
    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<QueueMessage>>;

    /// Permanently removes the message.
    async fn ack(&self, handle: &str) -> Result<()>;

    /// Sets the remaining invisibility. Zero makes the message immediately
    /// visible again.
    async fn extend_lease(&self, handle: &str, visibility: Duration) -> Result<()>;

    /// Approximate depth, for metrics and autoscaling.
    async fn depth(&self) -> Result<i64>;
}

/// The authoritative per-task row store.
///
/// Every mutation is a single conditional update on the one row that changes;
/// there are no cross-row transactions. The conditional predicates are the
/// linearization points that decide ownership under contention.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Unconditional batch upsert, used by the submitter. Fails with
    /// `Throttled` on backpressure; the caller subdivides and retries.
    async fn put_batch(&self, rows: &[TaskRow]) -> Result<()>;

    /// Takes ownership of a pending task. Conditioned on
    /// `status == pending-P && owner == NONE`.
    async fn claim(&self, task_id: &str, owner: &str, handle: &str, expiry: i64) -> Result<()>;

    /// Extends the lease of an owned task. Conditioned on
    /// `status == processing-P && owner == owner`.
    async fn refresh_ttl(&self, task_id: &str, owner: &str, new_expiry: i64) -> Result<()>;

    /// Moves an owned task to `finished` and stamps the completion time.
    /// Conditioned on `status == processing-P && owner == owner`.
    async fn finalize(&self, task_id: &str, owner: &str) -> Result<()>;

    /// Puts an expired task back to `pending` with the new retry count and no
    /// owner. Conditioned on `status == processing-P` only: the reclaimer has
    /// already observed expiry and may race a slow agent, in which case the
    /// agent's finalize wins and this returns `Condition`.
    async fn retry(&self, task_id: &str, new_retry_count: u32) -> Result<()>;

    /// Unconditional terminal set to `failed`, owner cleared.
    async fn fail(&self, task_id: &str) -> Result<()>;

    /// Unconditional terminal set to `cancelled`, owner cleared.
    async fn cancel(&self, task_id: &str) -> Result<()>;

    /// Unconditional diagnostic terminal set, for rows whose queue message
    /// could not be re-exposed. Observable through the session index.
    async fn mark_inconsistent(&self, task_id: &str) -> Result<()>;

    async fn get(&self, task_id: &str, consistent: bool) -> Result<Option<TaskRow>>;

    /// All rows of a session currently in `logical_state` (internally
    /// paginated).
    async fn query_by_session(
        &self,
        session_id: &str,
        logical_state: TaskState,
    ) -> Result<Vec<TaskRow>>;

    /// Rows in `processing-partition` whose lease expired before `now`
    /// (epoch seconds), at most `limit` of them.
    async fn query_expired(&self, partition: u32, now: i64, limit: i64) -> Result<Vec<TaskRow>>;

    /// Duplicate-submission guard: whether any row exists for the session.
    async fn session_has_rows(&self, session_id: &str) -> Result<bool>;
}

/// Opaque byte storage keyed by task id + role suffix.
///
/// The namespace (bucket) is fixed at construction; writes are last-writer-
/// wins and must be durable before the state transition referencing them
/// returns. [`blob::BlobStore`] layers the key scheme on top.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fails with `NotFound` for keys that were never written.
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

    async fn exists(&self, key: &str) -> Result<bool>;
}
