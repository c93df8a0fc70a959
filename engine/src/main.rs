use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use leadflow_engine::jobs::{JobConfig, WorkflowResumer};
use leadflow_engine::{EngineConfig, WorkflowEngine, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    let repo = storage::connect(&config.storage)
        .await
        .context("failed to open workflow storage")?;

    let engine = WorkflowEngine::new(&config, repo);
    engine.recover().await?;

    let resumer = WorkflowResumer::new(engine.scheduler().clone(), JobConfig::from(&config)).await?;
    resumer.start().await?;

    info!(
        workflows = engine.list_workflows(None).len(),
        triggers = engine.triggers().list().len(),
        "Lead workflow engine running"
    );

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    resumer.shutdown().await?;

    Ok(())
}
