use anyhow::Context;
use clap::{Parser, Subcommand};
use grid_agent::{Agent, AgentExit};
use grid_control::{
    reclaim::Reclaimer,
    results::QueryApi,
    submit::{SubmitContext, SubmitRequest, Submitter, TasksList},
    ControlPlane, ControlServer,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod migrate;
mod wiring;
mod worker;

#[derive(Parser, Debug)]
#[command(name = "grid-harness")]
#[command(about = "Compute grid harness: control plane, agents, reclamation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations for the state database.
    Migrate,

    /// Run the control-plane HTTP server with the in-process reclaimer loop.
    Control,

    /// Run one agent with the mock compute worker.
    Agent,

    /// Run one reclamation sweep and print the report.
    Reclaim,

    /// Submit a batch of mock tasks (manual testing ergonomics).
    Submit {
        /// Session id; generated when omitted.
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value_t = 1)]
        count: usize,

        #[arg(long, default_value_t = 0)]
        priority: usize,

        /// Per-task busy time for the mock worker.
        #[arg(long, default_value_t = 100)]
        sleep_ms: u64,
    },

    /// Print the terminal-state rolls of a session.
    Results {
        #[arg(long)]
        session: String,
    },

    /// Cancel every pending and processing task of the given sessions.
    Cancel {
        #[arg(long, required = true)]
        session: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::GridConfig::from_env().context("load grid config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Control => run_control(&cfg).await,
        Command::Agent => run_agent(&cfg).await,
        Command::Reclaim => run_reclaim(&cfg).await,
        Command::Submit {
            session,
            count,
            priority,
            sleep_ms,
        } => run_submit(&cfg, session, count, priority, sleep_ms).await,
        Command::Results { session } => run_results(&cfg, &session).await,
        Command::Cancel { session } => run_cancel(&cfg, session).await,
    }
}

async fn run_control(cfg: &config::GridConfig) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;

    let plane = ControlPlane {
        submitter: Submitter::new(
            services.state.clone(),
            services.queue.clone(),
            services.blobs.clone(),
            wiring::submitter_config(cfg),
        ),
        query: QueryApi::new(services.state.clone()),
        reclaimer: Arc::new(Reclaimer::new(
            services.state,
            services.queue,
            Some(services.dead_letter),
            services.throttle,
            wiring::reclaimer_config(cfg),
        )),
    };

    let bind = cfg.control_bind.parse().context("parse control bind")?;
    let server = ControlServer::start(plane, bind, true, cfg.reclaimer_poll()).await?;
    tracing::info!(
        event = "grid.harness.control_started",
        addr = %server.addr,
        "control plane listening"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    server.shutdown().await
}

async fn run_agent(cfg: &config::GridConfig) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;

    let agent_id = if cfg.agent_id.is_empty() {
        format!("grid-agent-{}", Uuid::new_v4())
    } else {
        cfg.agent_id.clone()
    };

    let agent = Agent::new(
        agent_id,
        services.state,
        services.queue,
        services.blobs,
        Arc::new(worker::MockComputeWorker),
        wiring::agent_config(cfg),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match agent.run(shutdown_rx).await.map_err(anyhow::Error::from)? {
        AgentExit::Shutdown => Ok(()),
        AgentExit::Restart => {
            // The running task was cancelled; the cleanest recovery is a
            // fresh process, which the orchestrator provides.
            tracing::warn!(
                event = "grid.harness.agent_restart",
                "agent exiting for restart after cancellation"
            );
            Ok(())
        }
    }
}

async fn run_reclaim(cfg: &config::GridConfig) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;
    let reclaimer = Reclaimer::new(
        services.state,
        services.queue,
        Some(services.dead_letter),
        services.throttle,
        wiring::reclaimer_config(cfg),
    );

    let report = reclaimer
        .sweep_with_metrics(&grid_core::metrics::LogMetrics)
        .await
        .map_err(anyhow::Error::from)?;
    println!(
        "expired={} retried={} failed={} inconsistent={} skipped_for_throttling={}",
        report.expired,
        report.retried,
        report.failed,
        report.inconsistent,
        report.skipped_for_throttling
    );
    Ok(())
}

async fn run_submit(
    cfg: &config::GridConfig,
    session: Option<String>,
    count: usize,
    priority: usize,
    sleep_ms: u64,
) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;
    let submitter = Submitter::new(
        services.state,
        services.queue,
        services.blobs,
        wiring::submitter_config(cfg),
    );

    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
    let request = SubmitRequest {
        session_id,
        context: Some(SubmitContext {
            tasks_priority: priority,
        }),
        scheduler_data: None,
        tasks_list: TasksList {
            tasks: (0..count)
                .map(|_| serde_json::json!({ "sleep_ms": sleep_ms }))
                .collect(),
        },
    };

    let response = submitter.submit(&request).await.map_err(anyhow::Error::from)?;
    println!(
        "session={} submitted={} failed={}",
        response.session_id,
        response.task_ids.len(),
        response.failed.len()
    );
    Ok(())
}

async fn run_results(cfg: &config::GridConfig, session: &str) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;
    let query = QueryApi::new(services.state);
    let response = query.results(session).await.map_err(anyhow::Error::from)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_cancel(cfg: &config::GridConfig, sessions: Vec<String>) -> anyhow::Result<()> {
    let services = wiring::connect(cfg).await?;
    let query = QueryApi::new(services.state);
    let response = query.cancel(&sessions).await.map_err(anyhow::Error::from)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
