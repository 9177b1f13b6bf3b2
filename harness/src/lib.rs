//! Operational harness for the grid: configuration, wiring, migrations, and
//! the mock compute worker. The `grid-harness` binary exposes these as
//! subcommands; the end-to-end invariant tests drive the same modules
//! in-process.

pub mod config;
pub mod migrate;
pub mod wiring;
pub mod worker;
