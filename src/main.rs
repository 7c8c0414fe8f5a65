use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use recordsafe::safety::OperationLog;
use recordsafe::{util, BackupEngine, Config, SnapshotKind, StatusArea};

#[derive(Parser)]
#[command(name = "recordsafe")]
#[command(about = "Inspect agents, snapshots and operation history of the record-store safety layer")]
struct Cli {
    /// Data directory (default: ~/.recordsafe)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Agents, lock and backup summary
    Status,
    /// Live agents in the shared status area
    Agents,
    /// Snapshot catalog, newest first
    Backups,
    /// Check that a snapshot reads back intact
    Verify { id: String },
    /// Remove snapshots older than the given age (0 removes all)
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Recent operations
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only failed, rolled back or rejected operations
        #[arg(long)]
        failures: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    util::init_data_dir(cli.data_dir.clone());

    // Initialize logging to file (~/.recordsafe/logs/recordsafe.log)
    fs::create_dir_all(util::logs_dir())?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(util::log_file_path())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let config = Config::load();
    let backups = BackupEngine::new(util::backups_dir(), config.backup.clone());

    match cli.command {
        Command::Status => status(&config, &backups).await,
        Command::Agents => agents(&config).await,
        Command::Backups => list_backups(&backups).await,
        Command::Verify { id } => verify(&backups, &id).await,
        Command::Cleanup { days } => {
            let report = match days {
                Some(days) => backups.cleanup_old_backups(days).await?,
                None => backups.apply_retention_policy().await?,
            };
            println!("Removed {} snapshot(s)", report.cleaned.len());
            for id in report.cleaned {
                println!("  {}", id);
            }
            Ok(())
        }
        Command::History { limit, failures } => history(&config, limit, failures).await,
    }
}

async fn status(config: &Config, backups: &BackupEngine) -> Result<()> {
    let area = StatusArea::new(util::shared_dir());
    let now = Utc::now();

    let agents = area
        .live_agents(now, config.coordinator.liveness_threshold)
        .await
        .context("reading status area")?;
    println!("Active agents: {}", agents.len());

    match area.read_lock().await? {
        Some(lock) if !lock.is_expired(now) => println!(
            "Global lock:   held by {} ({}) until {}",
            lock.holder, lock.label, lock.expires_at
        ),
        Some(lock) => println!("Global lock:   stale (held by {})", lock.holder),
        None => println!("Global lock:   free"),
    }

    let catalog = backups.get_backup_catalog().await?;
    println!("Snapshots:     {}", catalog.len());
    for kind in SnapshotKind::ALL {
        if let Some(latest) = backups.latest(kind).await? {
            println!(
                "{:<15}{} ({})",
                format!("Last {}:", kind),
                latest.id,
                latest.timestamp
            );
        }
    }
    Ok(())
}

async fn agents(config: &Config) -> Result<()> {
    let area = StatusArea::new(util::shared_dir());
    let agents = area
        .live_agents(Utc::now(), config.coordinator.liveness_threshold)
        .await?;
    if agents.is_empty() {
        println!("No active agents");
        return Ok(());
    }
    for agent in agents {
        println!(
            "{:<32} {:<9} {} (heartbeat {})",
            agent.agent_id,
            agent.state.as_str(),
            agent.message,
            agent.last_heartbeat
        );
    }
    Ok(())
}

async fn list_backups(backups: &BackupEngine) -> Result<()> {
    let catalog = backups.get_backup_catalog().await?;
    if catalog.is_empty() {
        println!("No snapshots");
        return Ok(());
    }
    for entry in catalog {
        println!(
            "{:<48} {:<11} {} {:>6} records {:>10} bytes",
            entry.id,
            entry.kind.as_str(),
            entry.timestamp,
            entry.record_count,
            entry.size_bytes
        );
    }
    Ok(())
}

async fn verify(backups: &BackupEngine, id: &str) -> Result<()> {
    if backups.verify_backup(id).await {
        println!("{}: ok", id);
        Ok(())
    } else {
        anyhow::bail!("{}: verification failed", id)
    }
}

async fn history(config: &Config, limit: usize, failures: bool) -> Result<()> {
    let log = OperationLog::new(util::operation_log_path(), config.safety.max_log_entries);
    let entries: Vec<_> = log
        .recent(config.safety.max_log_entries)
        .await
        .into_iter()
        .filter(|entry| !failures || entry.status.is_failure())
        .take(limit)
        .collect();
    if entries.is_empty() {
        println!("No operations recorded");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} {:<24} {:<22} {:>10}{}",
            entry.timestamp,
            entry.name,
            entry.status.as_str(),
            format!("{:.1?}", entry.duration()),
            entry
                .error
                .map(|e| format!("  {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
