//! mcphub: MCP backend hub.
//!
//! Subcommands:
//! - `mcphub run`: start every enabled backend, keep state snapshots, serve the bridge
//! - `mcphub bridge`: serve only the stdio-over-WebSocket bridge
//! - `mcphub check`: validate a configuration document
//! - `mcphub migrate`: move a configuration document to another schema version

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_hub::config::{repair, CURRENT_SCHEMA_VERSION};
use mcp_hub::hot_reload::load_for_apply;
use mcp_hub::{
    load_document, run_hot_reload, serve_bridge, write_document, BackendRegistry, HubSettings,
    Migrator, StateStore, StorePaths, TracingNotifier,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const SETTINGS_FILE: &str = "mcphub.toml";

/// mcphub: run MCP backends behind one hub and bridge process stdio over WebSocket.
#[derive(Parser)]
#[command(name = "mcphub", version, about)]
struct Cli {
    /// Path to mcphub.toml [default: ./mcphub.toml or <config dir>/mcphub/mcphub.toml]
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all enabled backends and the bridge, reloading on config changes
    Run,
    /// Serve only the stdio-over-WebSocket bridge
    Bridge {
        /// Bind address (overrides settings)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides settings)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate a configuration document and report repairs and migration gaps
    Check {
        /// Configuration document [default: from settings]
        config: Option<PathBuf>,
    },
    /// Migrate a configuration document between schema versions
    Migrate {
        /// Configuration document [default: from settings]
        config: Option<PathBuf>,
        /// Target schema version [default: current]
        #[arg(long)]
        to: Option<String>,
        /// Write the migrated document back instead of printing it
        #[arg(long, conflicts_with = "to")]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; stdout is kept for command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = resolve_settings(cli.settings).await?;
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down mcphub...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Run => run(settings, cancel).await,
        Commands::Bridge { host, port } => {
            let mut bridge = settings.bridge;
            if let Some(host) = host {
                bridge.host = host;
            }
            if let Some(port) = port {
                bridge.port = port;
            }
            serve_bridge(&bridge, cancel)
                .await
                .context("bridge server failed")
        }
        Commands::Check { config } => check(&config.unwrap_or(settings.config)).await,
        Commands::Migrate { config, to, write } => {
            migrate(&config.unwrap_or(settings.config), to, write).await
        }
    }
}

/// Start the registry, hot-reload and the bridge; on cancel, stop every
/// backend and flush snapshots before returning.
async fn run(settings: HubSettings, cancel: CancellationToken) -> Result<()> {
    let document = load_for_apply(&settings.config)
        .await
        .with_context(|| format!("cannot start with {}", settings.config.display()))?;

    let store = StateStore::load(
        StorePaths::from_settings(&settings),
        settings.save_interval(),
        Arc::new(TracingNotifier),
    )
    .await;
    let registry = Arc::new(
        BackendRegistry::from_document(store, &document)
            .await
            .context("failed to start backends")?,
    );
    tracing::info!(
        backends = document.enabled_backends().len(),
        config = %settings.config.display(),
        "mcphub started"
    );

    if settings.hot_reload {
        tokio::spawn(run_hot_reload(
            settings.config.clone(),
            Arc::clone(&registry),
            cancel.child_token(),
        ));
    }

    let bridge_result = serve_bridge(&settings.bridge, cancel.clone()).await;
    if bridge_result.is_err() {
        cancel.cancel();
    }
    cancel.cancelled().await;

    registry.shutdown().await;
    tracing::info!("mcphub stopped");
    bridge_result.context("bridge server failed")
}

async fn check(path: &Path) -> Result<()> {
    let loaded = load_document(path)
        .await
        .with_context(|| format!("failed to load {}", path.display()))?;

    let report = serde_json::json!({
        "path": path.display().to_string(),
        "valid": loaded.report.valid,
        "errors": loaded.report.errors,
        "warnings": loaded.report.warnings,
        "repairs": loaded.changes,
        "migration": {
            "from": loaded.migration.from,
            "to": loaded.migration.to,
            "applied": loaded.migration.applied,
            "gaps": loaded.migration.gaps,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !loaded.migration.is_complete() {
        anyhow::bail!(
            "no migration path from {} to {}",
            loaded.migration.from,
            loaded.migration.to
        );
    }
    if !loaded.report.valid {
        anyhow::bail!("{} is invalid", path.display());
    }
    Ok(())
}

async fn migrate(path: &Path, to: Option<String>, write: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let target = to.as_deref().unwrap_or(CURRENT_SCHEMA_VERSION);
    let outcome = Migrator::default().migrate(raw, target)?;
    for version in &outcome.applied {
        tracing::info!(version = %version, "applied migration");
    }
    for gap in &outcome.gaps {
        tracing::warn!(version = %gap.version, reason = %gap.reason, "migration gap");
    }
    if !outcome.is_complete() {
        anyhow::bail!("no migration path from {} to {}", outcome.from, outcome.to);
    }

    if write {
        let repaired = repair(outcome.document)?;
        write_document(path, &repaired.document).await?;
        eprintln!(
            "migrated {} from {} to {}",
            path.display(),
            outcome.from,
            outcome.reached
        );
    } else {
        println!("{}", serde_json::to_string_pretty(&outcome.document)?);
    }
    Ok(())
}

/// Resolve settings: explicit flag → ./mcphub.toml → <config dir>/mcphub/mcphub.toml → defaults.
async fn resolve_settings(explicit: Option<PathBuf>) -> Result<HubSettings> {
    if let Some(path) = explicit {
        return HubSettings::load(&path)
            .await
            .with_context(|| format!("failed to load settings {}", path.display()));
    }

    let local = Path::new(SETTINGS_FILE);
    if local.exists() {
        return Ok(HubSettings::load(local).await?);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("mcphub").join(SETTINGS_FILE);
        if user.exists() {
            return Ok(HubSettings::load(&user).await?);
        }
    }

    tracing::debug!("no {} found, using defaults", SETTINGS_FILE);
    Ok(HubSettings::default())
}
