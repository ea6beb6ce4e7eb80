//! Cachet CLI: inspect and repair shared session state and output cache.

mod render;

use anyhow::{Context, Result};
use cachet_config::{CachetConfig, CliOverrides};
use cachet_output::OutputCache;
use cachet_session::{LockToken, SessionStore};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cachet", version, about = "Inspect shared session state and output cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Application name used as key prefix (overrides CACHET_APPLICATION_NAME)
    #[arg(long, global = true)]
    app: Option<String>,

    /// Store endpoint, e.g. redis://127.0.0.1:6379 (overrides CACHET_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Session codec name (overrides CACHET_CODEC)
    #[arg(long, global = true)]
    codec: Option<String>,

    /// Config file to read instead of ~/.cachet/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show a session's lock holder, timeout and items without locking it
    Inspect { session_id: String },

    /// Release a session's lock if its holder has kept it too long
    Reap {
        session_id: String,
        /// Locks older than this are considered abandoned
        #[arg(long, default_value_t = 120)]
        max_age_secs: u64,
    },

    /// Reset a session's idle expiry
    Expire {
        session_id: String,
        #[arg(long)]
        timeout_secs: u32,
    },

    /// Output cache operations
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print a cached entry
    Get { key: String },
    /// Remove a cached entry
    Remove { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = CachetConfig::load(CliOverrides {
        application_name: cli.app,
        endpoint: cli.endpoint,
        codec: cli.codec,
        config_file: cli.config,
    })
    .context("Failed to load configuration")?;
    tracing::debug!(
        "Using application '{}' on {}",
        config.application_name,
        config.endpoints.join(",")
    );

    match cli.command {
        Command::Inspect { session_id } => inspect(&config, &session_id).await,
        Command::Reap {
            session_id,
            max_age_secs,
        } => reap(&config, &session_id, Duration::from_secs(max_age_secs)).await,
        Command::Expire {
            session_id,
            timeout_secs,
        } => expire(&config, &session_id, timeout_secs).await,
        Command::Cache(command) => cache(&config, command).await,
    }
}

async fn connect_sessions(config: &CachetConfig) -> Result<SessionStore> {
    SessionStore::connect(config)
        .await
        .context("Failed to connect to the session store")
}

async fn inspect(config: &CachetConfig, session_id: &str) -> Result<()> {
    let store = connect_sessions(config).await?;
    let keys = store.namespacer().keys(session_id);
    let peek = store
        .coordinator()
        .try_peek_without_lock(&keys)
        .await
        .with_context(|| format!("Failed to read session '{session_id}'"))?;

    println!("session:  {session_id}");
    println!("data key: {}", keys.data);
    match &peek.holder {
        Some(holder) => println!(
            "lock:     {holder} (held {})",
            render::age(store.coordinator().lock_age(holder))
        ),
        None => println!("lock:     free"),
    }
    match peek.session_timeout {
        Some(secs) => println!("timeout:  {secs}s"),
        None => println!("timeout:  unknown"),
    }

    if !peek.is_free {
        println!("items:    (hidden while locked)");
        return Ok(());
    }
    let Some(data) = peek.data else {
        println!("items:    (no record)");
        return Ok(());
    };
    match store.codec().decode(&data) {
        Ok(Some(state)) => {
            println!("items:    {}", state.len());
            for line in render::state_lines(&state) {
                println!("  {line}");
            }
        }
        Ok(None) => println!("items:    (null)"),
        Err(e) => println!("items:    undecodable with {}: {e}", store.codec().name()),
    }
    Ok(())
}

async fn reap(config: &CachetConfig, session_id: &str, max_age: Duration) -> Result<()> {
    let store = connect_sessions(config).await?;
    let reaped: Option<LockToken> = store
        .release_abandoned_lock(session_id, max_age)
        .await
        .with_context(|| format!("Failed to reap lock on '{session_id}'"))?;
    match reaped {
        Some(token) => println!("Released lock {token} on '{session_id}'"),
        None => println!("No abandoned lock on '{session_id}'"),
    }
    Ok(())
}

async fn expire(config: &CachetConfig, session_id: &str, timeout_secs: u32) -> Result<()> {
    let store = connect_sessions(config).await?;
    let found = store
        .reset_item_timeout(session_id, timeout_secs)
        .await
        .with_context(|| format!("Failed to reset timeout of '{session_id}'"))?;
    if found {
        println!(
            "Session '{session_id}' now expires after {}s idle",
            timeout_secs.max(1)
        );
    } else {
        println!("No session '{session_id}'");
    }
    Ok(())
}

async fn cache(config: &CachetConfig, command: CacheCommand) -> Result<()> {
    let cache = OutputCache::connect(config).context("Failed to set up the output cache")?;
    match command {
        CacheCommand::Get { key } => {
            let entry = cache
                .get(&key)
                .await
                .with_context(|| format!("Failed to read cache entry '{key}'"))?;
            match entry {
                Some(entry) => {
                    for line in render::entry_lines(&entry) {
                        println!("{line}");
                    }
                }
                None => println!("No cache entry '{key}'"),
            }
        }
        CacheCommand::Remove { key } => {
            cache
                .remove(&key)
                .await
                .with_context(|| format!("Failed to remove cache entry '{key}'"))?;
            println!("Removed cache entry '{key}'");
        }
    }
    Ok(())
}
