use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::GridConfig;

pub async fn run(cfg: &GridConfig) -> anyhow::Result<()> {
    let state_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    sqlx::migrate!("./migrations/state")
        .run(&state_pool)
        .await
        .context("migrate state db")?;

    tracing::info!("migrations complete");
    Ok(())
}
