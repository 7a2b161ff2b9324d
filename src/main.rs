//! Futures Copy-Trading Engine
//!
//! Mirrors a master Binance USDⓈ-M futures account's fills onto follower
//! accounts, scaled per follower, within the exchange's rate budget.

mod api;
mod config;
mod db;
mod engine;
mod models;
mod trading;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{AppConfig, DEFAULT_DATABASE_URL};
use crate::db::Database;
use crate::engine::Engine;

/// Futures copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "futures-copier")]
#[command(about = "Replicate a master futures account's fills onto follower accounts", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "copier.toml")]
    config: PathBuf,

    /// Database URL, overrides the config file
    #[arg(short, long, env = "COPIER_DATABASE_URL")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start copying until Ctrl+C
    Run {
        /// Log orders instead of submitting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the loaded configuration with secrets masked
    Config,

    /// Show the last engine session and outcome counts
    Status,

    /// List recent replica orders
    Trades {
        /// Maximum number of rows
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Only this follower
        #[arg(short, long)]
        follower: Option<String>,
    },

    /// Summarize recent activity
    Stats {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { dry_run } => {
            let mut config = AppConfig::load(&cli.config)?;
            if let Some(url) = &cli.database {
                config.database_url = url.clone();
            }

            info!(
                config = %cli.config.display(),
                dry_run = dry_run,
                followers = config.followers.len(),
                "Starting futures copier"
            );

            let mut engine = Engine::from_config(&config, dry_run).await?;
            let control = engine.control();

            println!("\n=== Futures Copy-Trading Engine ===");
            println!("Followers: {}", config.followers.len());
            println!("Mode: {}", if dry_run { "DRY RUN (no real orders)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Engine error");
            }

            println!("\n{}", control.get_status());
        }

        Commands::Config => {
            let config = AppConfig::load(&cli.config)?;
            println!("\n{}", config.redacted());
        }

        Commands::Status => {
            let db = Database::new(&database_url(&cli.config, cli.database.as_deref())).await?;

            let Some(state) = db.get_engine_state().await? else {
                println!("No engine session found. Run 'futures-copier run' to start.");
                return Ok(());
            };
            let counts = db.get_status_counts().await?;

            println!("\n=== Engine Status ===");
            println!("Running:          {}", if state.is_running { "Yes" } else { "No" });
            println!("Mode:             {}", if state.dry_run { "Dry run" } else { "Live" });
            println!("Followers:        {}", state.followers);
            println!("Started:          {}", state.started_at);
            println!("Updated:          {}", state.updated_at);
            if let Some(stopped) = &state.stopped_at {
                println!("Stopped:          {}", stopped);
            }
            println!("Events Received:  {}", state.events_received);
            println!(
                "Last Event:       {}",
                state.last_event_at.as_deref().unwrap_or("Never")
            );

            println!("\n=== Replica Outcomes ===");
            if counts.is_empty() {
                println!("  (none)");
            }
            for (status, count) in &counts {
                println!("  {:<12} {}", status, count);
            }
        }

        Commands::Trades { limit, follower } => {
            let db = Database::new(&database_url(&cli.config, cli.database.as_deref())).await?;
            let rows = db.get_recent_replicas(limit, follower.as_deref()).await?;

            if rows.is_empty() {
                println!("No replica orders recorded.");
                return Ok(());
            }

            println!(
                "\n{:<24} {:<12} {:<20} {:<10} {:<5} {:<6} {:>12} {:>12} {:<10} {:>3} {:<14} {}",
                "TIME", "FOLLOWER", "EVENT", "SYMBOL", "SIDE", "TYPE", "QTY", "PRICE", "STATUS",
                "TRY", "ORDER ID", "REASON"
            );
            println!("{}", "-".repeat(150));

            for r in rows {
                println!(
                    "{:<24} {:<12} {:<20} {:<10} {:<5} {:<6} {:>12} {:>12} {:<10} {:>3} {:<14} {}",
                    truncate(&r.created_at, 24),
                    truncate(&r.follower_id, 12),
                    truncate(&r.source_event_id, 20),
                    r.symbol,
                    r.side,
                    r.order_type,
                    r.quantity,
                    r.price,
                    r.status,
                    r.attempts,
                    truncate(r.exchange_order_id.as_deref().unwrap_or("-"), 14),
                    r.reason.as_deref().map(|s| truncate(s, 40)).unwrap_or_default()
                );
            }
        }

        Commands::Stats { hours } => {
            let db = Database::new(&database_url(&cli.config, cli.database.as_deref())).await?;
            let stats = db.get_trade_stats(hours).await?;

            println!("\n=== Activity (last {}h) ===", hours);
            println!("Master Fills:     {}", stats.master_events);
            println!("Master Volume:    ${:.2}", stats.master_volume);
            println!("Replica Volume:   ${:.2}", stats.replica_volume);

            println!("\n--- Replicas by Status ---");
            for (status, count) in &stats.replicas_by_status {
                println!("  {:<12} {}", status, count);
            }

            println!("\nSymbols:   {}", join_or_none(&stats.symbols));
            println!("Followers: {}", join_or_none(&stats.followers));
        }
    }

    Ok(())
}

/// Database for the read-only commands: flag, then config file, then default.
fn database_url(config_path: &Path, flag: Option<&str>) -> String {
    if let Some(url) = flag {
        return url.to_string();
    }
    std::fs::read_to_string(config_path)
        .ok()
        .and_then(|raw| AppConfig::from_toml(&raw).ok())
        .map(|c| c.database_url)
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("1700000000000-123456", 10), "1700000...");
    }

    #[test]
    fn test_database_url_precedence() {
        let missing = Path::new("/nonexistent/copier.toml");
        assert_eq!(database_url(missing, Some("sqlite::memory:")), "sqlite::memory:");
        assert_eq!(database_url(missing, None), DEFAULT_DATABASE_URL);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["futures-copier", "trades", "--limit", "5", "-f", "a"]).unwrap();
        match cli.command {
            Commands::Trades { limit, follower } => {
                assert_eq!(limit, 5);
                assert_eq!(follower.as_deref(), Some("a"));
            }
            _ => panic!("expected trades"),
        }
    }
}
