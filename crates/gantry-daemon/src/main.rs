//! gantry daemon
//!
//! Control plane process: queues sessions, answers runner polls and manages
//! local model instances.

use anyhow::{Context, Result};
use clap::Parser;
use gantry_api::create_router;
use gantry_core::{DaemonConfig, LoggingConfig};
use gantry_runtime::{ProcessRuntime, ProcessRuntimeConfig, Runtime};
use gantry_scheduler::{
    Controller, MemoryAllocator, ModelInstancePool, PoolConfig, RunnerInstanceFactory,
    SessionQueue,
};
use gantry_store::{FileStore, MemoryStore, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gantry daemon - session queue and model instance scheduler
#[derive(Parser, Debug)]
#[command(name = "gantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum number of local model instances
    #[arg(long)]
    max_instances: Option<u32>,

    /// Only serve remote runners; never start local instances
    #[arg(long)]
    no_local_instances: bool,
}

impl Args {
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(max) = self.max_instances {
            config.scheduler.max_instances = max;
        }
        if self.no_local_instances {
            config.scheduler.local_instances = false;
        }
        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {}", config.level))?;

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    if config.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("failed to set subscriber")
}

fn build_pool(config: &DaemonConfig) -> Option<Arc<ModelInstancePool>> {
    if !config.scheduler.local_instances {
        return None;
    }

    let runtime: Arc<dyn Runtime> =
        Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::from(&config.runtime)));
    let factory = Arc::new(RunnerInstanceFactory::new(
        runtime,
        config.scheduler.stale_timeout(),
    ));
    let allocator = MemoryAllocator::new(
        config.scheduler.total_memory,
        config.scheduler.max_instances,
        config.runtime.worker_base_port,
    );
    Some(Arc::new(ModelInstancePool::new(
        factory,
        allocator,
        PoolConfig::from(&config.scheduler),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting gantry daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn Store> = match &config.storage.sessions_path {
        Some(path) => {
            info!(path = %path.display(), "Using file session store");
            Arc::new(FileStore::open(path.clone()).await?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let pool = build_pool(&config);
    let controller = Arc::new(Controller::new(
        store,
        Arc::new(SessionQueue::new()),
        pool.clone(),
        config.scheduler.runner_ttl(),
    ));
    controller.restore_queue().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if pool.is_some() {
        info!(
            max_instances = config.scheduler.max_instances,
            runner = %config.runtime.runner_binary.display(),
            "Local model instances enabled"
        );
    }
    // Also expires silent runners when there is no local pool.
    let reconcile = controller
        .clone()
        .spawn_reconcile_loop(config.scheduler.reconcile_interval(), shutdown_rx);

    let router = create_router(controller.clone(), config.api.cors_enabled);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server error")?;

    reconcile.await.context("reconcile loop panicked")?;
    controller.shutdown().await;

    info!("gantry daemon stopped");
    Ok(())
}
