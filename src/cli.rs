use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::SystemEvent;
use crate::error::Result;
use crate::persistence::WriteAheadLog;
use crate::services::EventHandler;

#[derive(Parser)]
#[command(name = "ploy-sentinel")]
#[command(author = "Ploy Team")]
#[command(version = "0.1.0")]
#[command(about = "Degradation and recovery control plane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane until Ctrl-C
    Run {
        /// Directory holding default.toml and <SENTINEL_ENV>.toml
        #[arg(short, long, default_value = "config")]
        config_dir: PathBuf,
        /// How often to try advancing an active recovery run (ms)
        #[arg(long, default_value = "1000")]
        recovery_poll_ms: u64,
        /// How often to flush the write buffer when a database is configured (ms)
        #[arg(long, default_value = "5000")]
        flush_interval_ms: u64,
    },
    /// Replay a write-buffer WAL offline and print what it holds
    InspectWal {
        /// WAL file
        #[arg(short, long)]
        path: PathBuf,
        /// Print every deduplicated entry
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Bus subscriber writing every event to the log
pub struct AuditLogHandler;

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn name(&self) -> &str {
        "audit_log"
    }

    async fn handle(&self, event: &SystemEvent) -> Result<()> {
        info!(
            event_type = %event.event_type(),
            source = %event.source(),
            severity = %event.severity(),
            reason_code = %event.reason_code(),
            details = %serde_json::Value::Object(event.details().clone()),
            "event"
        );
        Ok(())
    }
}

/// Load a WAL without side effects and print a summary
pub fn inspect_wal(path: &Path, verbose: bool) -> anyhow::Result<()> {
    let replay = WriteAheadLog::load_path(path)
        .with_context(|| format!("failed to replay WAL {}", path.display()))?;

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    let mut bytes = 0usize;
    for entry in &replay.entries {
        *by_type.entry(entry.resource_type()).or_default() += 1;
        bytes += entry
            .serialized_size()
            .with_context(|| format!("failed to size entry {}", entry.idempotent_key()))?;
    }

    println!("WAL: {}", path.display());
    println!("  records read:     {}", replay.records);
    println!("  unique entries:   {}", replay.entries.len());
    println!("  superseded:       {}", replay.duplicates());
    println!("  malformed lines:  {}", replay.skipped);
    println!("  payload bytes:    {}", bytes);

    if !by_type.is_empty() {
        println!("  by resource type:");
        for (resource_type, count) in &by_type {
            println!("    {:<20} {}", resource_type, count);
        }
    }

    if verbose {
        for entry in &replay.entries {
            println!(
                "  {} {} {}",
                entry.timestamp().to_rfc3339(),
                entry.idempotent_key(),
                serde_json::Value::Object(entry.data().clone())
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_wal() {
        let cli = Cli::parse_from(["ploy-sentinel", "inspect-wal", "--path", "/tmp/buffer.wal"]);
        match cli.command {
            Commands::InspectWal { path, verbose } => {
                assert_eq!(path, PathBuf::from("/tmp/buffer.wal"));
                assert!(!verbose);
            }
            _ => panic!("expected inspect-wal"),
        }
    }

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::parse_from(["ploy-sentinel", "run"]);
        match cli.command {
            Commands::Run {
                config_dir,
                recovery_poll_ms,
                ..
            } => {
                assert_eq!(config_dir, PathBuf::from("config"));
                assert_eq!(recovery_poll_ms, 1000);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_inspect_missing_wal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_wal(&dir.path().join("none.wal"), true).is_ok());
    }

    #[test]
    fn test_inspect_unreadable_wal_names_path() {
        // A directory where the WAL file should be cannot be read line by line
        let dir = tempfile::tempdir().unwrap();
        let err = inspect_wal(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains(&dir.path().display().to_string()));

        let err: crate::error::SentinelError = err.into();
        assert!(matches!(err, crate::error::SentinelError::Other(_)));
    }
}
