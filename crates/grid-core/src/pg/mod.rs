//! Postgres-backed durable state table and task queue.
//!
//! Schema lives in `harness/migrations/state`. Conditional state transitions
//! are single `UPDATE ... WHERE <predicate>` statements; zero rows affected
//! is the `Condition` outcome.

mod queue;
mod state;

pub use queue::PgQueue;
pub use state::PgStateStore;
