//! safeprag-sync - Local scheduling and sync service for Safeprag
//!
//! Owns the device's pest-control data (clients, schedules, service orders,
//! devices, products), enforces the booking and visit rules, and keeps the
//! data in step with the hosted backend through an outbox.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod api;
mod clients;
mod config;
mod context;
mod devices;
mod error;
mod events;
mod files;
mod models;
mod orders;
mod registry;
mod remote;
mod scheduling;
mod store;
mod sync;

use config::Config;
use context::Context;
use events::EventBus;
use store::SqliteStore;

/// Timeout for file downloads when no backend timeout is configured
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "safeprag-sync")]
#[command(about = "Local scheduling and sync service for the Safeprag field app")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for list/revoke operations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Push queued changes and pull the backend's data once
    Sync {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Export every collection to a JSON file
    Backup {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Restore collections from a JSON backup
    Restore {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("safeprag_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = load_config(config.as_deref())?;

            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            list,
            revoke,
            config,
        } => manage_tokens(name, list, revoke, config),

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: safeprag-sync token --name my-tablet");
            println!("  2. Add the [remote] section to enable backend sync");
            println!(
                "  3. Start the service: safeprag-sync serve --config {}",
                path.display()
            );

            Ok(())
        }

        Commands::Sync { config } => {
            let cfg = load_config(config.as_deref())?;
            let ctx = open_context(&cfg)?;
            let Some(bridge) = build_bridge(&cfg, &ctx)? else {
                println!("No [remote] section configured (or sync disabled); nothing to do.");
                return Ok(());
            };

            let report = bridge.refresh().await?;
            println!(
                "Pushed {} change(s), {} retrying, {} failed; pulled {} record(s) from {} collection(s).",
                report.push.delivered,
                report.push.retried,
                report.push.failed,
                report.pull.records,
                report.pull.collections
            );
            Ok(())
        }

        Commands::Backup { output, config } => {
            let cfg = load_config(config.as_deref())?;
            let ctx = open_context(&cfg)?;
            let backup = store::export_backup(ctx.store.as_ref())?;
            let content = serde_json::to_string_pretty(&backup).context("Failed to encode backup")?;
            std::fs::write(&output, content).context("Failed to write backup file")?;
            println!("Backup written to {}", output.display());
            Ok(())
        }

        Commands::Restore { input, config } => {
            let cfg = load_config(config.as_deref())?;
            let ctx = open_context(&cfg)?;
            let content = std::fs::read_to_string(&input).context("Failed to read backup file")?;
            let backup: serde_json::Value =
                serde_json::from_str(&content).context("Backup is not valid JSON")?;
            let restored = store::restore_backup(ctx.store.as_ref(), &backup)?;
            println!("Restored {} collection(s) from {}", restored, input.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn open_context(config: &Config) -> Result<Context> {
    let store = SqliteStore::open(&config.database.path).context("Failed to open database")?;
    Ok(Context::new(Arc::new(store), EventBus::default()))
}

fn build_bridge(config: &Config, ctx: &Context) -> Result<Option<Arc<sync::SyncBridge>>> {
    let Some(remote) = config.remote.as_ref().filter(|_| config.sync_active()) else {
        return Ok(None);
    };
    let client = remote::RestClient::new(&remote.url, &remote.api_key, remote.timeout())
        .context("Failed to set up the backend client")?;
    Ok(Some(Arc::new(sync::SyncBridge::new(
        ctx.clone(),
        Arc::new(client),
        config.sync.clone(),
    ))))
}

async fn run_server(config: Config) -> Result<()> {
    let ctx = open_context(&config)?;
    tokio::spawn(events::log_events(ctx.events.subscribe()));

    let missed = scheduling::Scheduler::new(ctx.clone()).reconcile_missed()?;
    if !missed.is_empty() {
        tracing::info!(count = missed.len(), "Cancelled visits missed while offline");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = build_bridge(&config, &ctx)?;
    let sync_task = bridge.clone().map(|bridge| {
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    });
    if sync_task.is_none() {
        tracing::info!("Backend sync disabled; changes stay queued in the outbox");
    }

    let download_timeout = config
        .remote
        .as_ref()
        .map(|r| r.timeout())
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
    let downloads = files::Downloads::new(config.downloads.dir.clone(), ctx.clone(), download_timeout)?;

    let state = api::AppState::new(ctx, config.clone(), downloads, bridge);
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!("safeprag-sync listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(task) = sync_task {
        let _ = task.await;
    }
    tracing::info!("safeprag-sync stopped");
    Ok(())
}

fn manage_tokens(
    name: Option<String>,
    list: bool,
    revoke: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let config_path = match config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let existing = if config_path.exists() {
        Some(Config::load_from(&config_path)?)
    } else {
        None
    };

    if list || revoke.is_some() {
        let Some(mut cfg) = existing else {
            println!("No config file found at {}", config_path.display());
            println!("Run 'safeprag-sync init' to create one.");
            return Ok(());
        };

        if let Some(label) = revoke {
            if cfg.revoke_token(&label) {
                cfg.save_to(&config_path)?;
                println!("Revoked token '{label}'.");
            } else {
                println!("Token '{label}' not found.");
            }
            return Ok(());
        }

        if cfg.tokens.is_empty() {
            println!("No tokens configured.");
            println!("Generate one with: safeprag-sync token --name <device-name>");
            return Ok(());
        }
        println!("Configured tokens:\n");
        for token in &cfg.tokens {
            let preview: String = token.token_hash.chars().take(20).collect();
            let ellipsis = if token.token_hash.chars().count() > 20 { "..." } else { "" };
            println!("  {} - {preview}{ellipsis}", token.name);
        }
        return Ok(());
    }

    let token = generate_token();
    let label = name.unwrap_or_else(|| "default".to_string());
    let token_hash = config::hash_token(&token)?;

    match existing {
        Some(mut cfg) => {
            if !cfg.add_token(&label, token_hash) {
                println!("Token '{label}' already exists. Use --revoke first to replace it.");
                return Ok(());
            }
            cfg.save_to(&config_path)?;
            println!("Generated API token for '{label}' (saved to {})\n", config_path.display());
        }
        None => {
            println!("Generated API token for '{label}'.");
            println!("Add this to the service's config.toml:\n");
            println!("  [[tokens]]");
            println!("  name = \"{label}\"");
            println!("  token_hash = \"{token_hash}\"\n");
        }
    }

    println!("Token: {token}\n");
    println!("Configure the Safeprag app with:");
    println!("   Sync service: http://YOUR_DEVICE_IP:3040");
    println!("   Authorization: Bearer {token}");
    println!();
    println!("Save this token now - it cannot be retrieved later!");

    Ok(())
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("sps_{}", token_body)
}
