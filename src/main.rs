use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backend_plugin_host::config::{self, HostConfig};
use backend_plugin_host::instrumentation::PluginMetrics;
use backend_plugin_host::lifecycle::{DefaultFactoryProvider, HostEnv, Registry, Supervisor};
use backend_plugin_host::logging;

#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Runs and supervises out-of-process backend plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start every configured plugin and keep it running (default)
    Run,
    /// Validate the configuration
    Check {
        /// Also start and stop each plugin once
        #[arg(long)]
        start: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(if args.debug { "debug" } else { "info" }, args.json_logs);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .await
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => config::load_from_env_or_file()
            .await
            .context("failed to load configuration")?,
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check { start } => check(config, start).await,
    }
}

fn build_registry(config: &HostConfig) -> anyhow::Result<(Registry, Arc<PluginMetrics>)> {
    let metrics = Arc::new(PluginMetrics::new().context("failed to create plugin metrics")?);
    let provider = DefaultFactoryProvider::new(
        config.handshake.to_handshake(),
        config.supervisor.stop_grace(),
        metrics.clone(),
    );
    let env = HostEnv {
        host_version: config.host_version.clone(),
        license_edition: config.license_edition.clone(),
    };
    let registry = Registry::new(
        Supervisor::new(config.supervisor.tick()),
        Arc::new(provider),
        Arc::new(env),
    );
    Ok((registry, metrics))
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    let (registry, metrics) = build_registry(&config)?;

    for descriptor in config.plugins {
        let id = descriptor.id.clone();
        if let Err(e) = registry.register(descriptor).await {
            error!(plugin_id = %id, error = %e, "Failed to register plugin");
        }
    }
    info!(count = registry.len().await, "Plugin host running");

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    let status = registry.run(token).await?;
    info!(status = ?status, "Plugin host stopped");

    match metrics.encode_text() {
        Ok(text) => tracing::debug!(metrics = %text, "Final plugin metrics"),
        Err(e) => warn!(error = %e, "Failed to encode plugin metrics"),
    }
    Ok(())
}

async fn check(config: HostConfig, start: bool) -> anyhow::Result<()> {
    println!("Configuration OK: {} plugin(s)", config.plugins.len());
    for plugin in &config.plugins {
        println!(
            "  {} -> {} ({})",
            plugin.id,
            plugin.executable.display(),
            if plugin.managed { "managed" } else { "unmanaged" }
        );
    }

    if !start {
        return Ok(());
    }

    let (registry, _metrics) = build_registry(&config)?;
    let mut failures = 0;
    for descriptor in config.plugins {
        let id = descriptor.id.clone();
        let managed = descriptor.managed;
        let started = match registry.register(descriptor).await {
            Ok(()) if !managed => registry.start_plugin(&id).await,
            other => other,
        };
        match started {
            Ok(()) => println!("  ✓ {id} started"),
            Err(e) => {
                failures += 1;
                println!("  ✗ {id}: {e}");
            }
        }
    }
    registry.shutdown().await;

    if failures > 0 {
        anyhow::bail!("{failures} plugin(s) failed to start");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
