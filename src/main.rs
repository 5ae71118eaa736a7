use clap::Parser;
use ploy_sentinel::cli::{self, AuditLogHandler, Cli, Commands};
use ploy_sentinel::config::AppConfig;
use ploy_sentinel::coordination::WatchGate;
use ploy_sentinel::domain::{ComponentSource, ReasonCode, SystemEvent};
use ploy_sentinel::error::Result;
use ploy_sentinel::logging::{init_logging, init_logging_simple};
use ploy_sentinel::persistence::{BufferSink, PostgresSink};
use ploy_sentinel::runtime::Sentinel;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            config_dir,
            recovery_poll_ms,
            flush_interval_ms,
        } => {
            run(config_dir, *recovery_poll_ms, *flush_interval_ms).await?;
        }
        Commands::InspectWal { path, verbose } => {
            init_logging_simple();
            cli::inspect_wal(path, *verbose)?;
        }
    }

    Ok(())
}

async fn run(config_dir: &Path, recovery_poll_ms: u64, flush_interval_ms: u64) -> Result<()> {
    let config = AppConfig::load_from(config_dir)?;
    init_logging(&config.logging);

    let sink = match &config.database.url {
        Some(url) => {
            let sink = PostgresSink::connect(url, config.database.max_connections).await?;
            sink.ensure_schema().await?;
            Some(sink)
        }
        None => {
            warn!("No database.url configured, buffered writes will not be flushed");
            None
        }
    };

    let gate = Arc::new(WatchGate::new(config.state.initial_mode));
    let sentinel = Sentinel::build_with_breaker_checks(config, gate.clone())?;
    sentinel.bus().subscribe(Arc::new(AuditLogHandler));
    sentinel.start().await;

    sentinel
        .submit(&SystemEvent::health(
            ComponentSource::System,
            ReasonCode::ColdStart,
        ))
        .await;
    info!(mode = %gate.current().mode, "Sentinel running, Ctrl-C to stop");

    let mut recovery_tick = interval(Duration::from_millis(recovery_poll_ms.max(1)));
    recovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flush_tick = interval(Duration::from_millis(flush_interval_ms.max(1)));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = recovery_tick.tick() => {
                if let Some((run_id, advanced)) = sentinel.drive_recovery().await {
                    if advanced {
                        info!(%run_id, stage = ?sentinel.recovery().current_stage().await, "Recovery progressed");
                    }
                }
            }
            _ = flush_tick.tick() => {
                if let Some(sink) = &sink {
                    flush(&sentinel, sink).await;
                }
            }
        }
    }

    sentinel.shutdown().await;
    if let Some(sink) = &sink {
        flush(&sentinel, sink).await;
    }

    info!(mode = %sentinel.state().mode().await, "Shutdown complete");
    Ok(())
}

async fn flush(sentinel: &Sentinel, sink: &dyn BufferSink) {
    match sentinel.flush_buffer(sink).await {
        Ok(0) => {}
        Ok(flushed) => info!(flushed, "Buffered writes flushed"),
        Err(e) => error!("Buffer flush failed, entries retained: {}", e),
    }
}
