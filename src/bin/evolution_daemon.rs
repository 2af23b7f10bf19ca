//! Evolution scheduler daemon
//!
//! Runs the idle-time evolution loop until SIGINT/SIGTERM. Configure via
//! environment: `AGENCY_ROOT` for the state tree, `AGENCY_EXECUTOR` for the
//! external agent CLI (default `openclaw`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agency_os::config::CoreConfig;
use agency_os::evolution::EvolutionScheduler;
use agency_os::exec::CommandExecutor;
use agency_os::memory::MemoryManager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = CoreConfig::from_env();
    let executor_program =
        std::env::var("AGENCY_EXECUTOR").unwrap_or_else(|_| "openclaw".to_string());

    info!(root = %config.blackboard_root.display(), "starting evolution daemon");

    let memory = Arc::new(MemoryManager::new("evolution-daemon", &config).await?);
    let scheduler = Arc::new(
        EvolutionScheduler::new(
            config.evolution_queue_dir(),
            Arc::new(CommandExecutor::new(executor_program)),
        )?
        .with_memory(memory)
        .with_check_interval(Duration::from_secs(config.check_interval_secs))
        .with_idle_threshold(Duration::from_secs(config.idle_threshold_secs))
        .with_exec_timeout(config.exec_timeout()),
    );

    scheduler.run_daemon().await
}
