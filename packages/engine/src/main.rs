// packages/engine/src/main.rs
//! Botyard
//!
//! Hosts chat bots from their source repositories. Operator commands arrive
//! on stdin as `<principal_id> <command text>` lines; replies are printed to
//! stdout and logs go to stderr.

use anyhow::{Context, Result};
use botyard_engine::commands::{CommandHandler, Reply};
use botyard_engine::observability::{init_metrics, init_tracing};
use botyard_engine::runtime::worker_pool::WorkerPool;
use botyard_engine::utils::config::EngineConfig;
use botyard_engine::{Engine, OwnerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight commands
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it decides the log format
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(config.observability.log_format)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting Botyard v{}", env!("CARGO_PKG_VERSION"));
    info!(
        scope = ?config.scope,
        workspace_dir = %config.workspace_dir.display(),
        state_file = %config.state_file.display(),
        "Configuration loaded"
    );
    for warning in config.console_warnings() {
        warn!("{}", warning);
    }

    let reconcile_every = config.runtime.reconcile_interval_secs;
    let pool = WorkerPool::new(config.runtime.max_concurrent_operations);

    let engine = Arc::new(Engine::open(config).await.context("failed to open engine")?);
    let handler = Arc::new(CommandHandler::new(Arc::clone(&engine)));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
        }
    });

    if reconcile_every > 0 {
        tokio::spawn(reconcile_loop(
            Arc::clone(&engine),
            Duration::from_secs(reconcile_every),
            shutdown.clone(),
        ));
    }

    // Replies are printed by one task so concurrent commands don't interleave
    let (tx, mut rx) = mpsc::unbounded_channel::<(OwnerId, Reply)>();
    let printer = tokio::spawn(async move {
        while let Some((principal, reply)) = rx.recv().await {
            let marker = if reply.success { "ok" } else { "error" };
            println!("[{}] {}: {}", principal, marker, reply.message);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let (principal, text) = match parse_line(&line) {
            Some(parsed) => parsed,
            None => {
                if !line.trim().is_empty() {
                    warn!(line = %line, "Expected '<principal_id> <command>'");
                }
                continue;
            }
        };

        let task = pool.submit({
            let handler = Arc::clone(&handler);
            async move { handler.handle(principal, &text).await }
        });
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = match task.await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("Command task failed: {}", e);
                    Reply::fail("Internal error while running the command.")
                }
            };
            let _ = tx.send((principal, reply));
        });
    }

    // The printer ends once every in-flight command has replied
    drop(tx);
    shutdown.cancel();
    if tokio::time::timeout(DRAIN_TIMEOUT, printer).await.is_err() {
        warn!(
            busy = pool.stats().busy_slots,
            "Gave up waiting for in-flight commands"
        );
    }

    info!("Botyard stopped; workloads keep running and are reconciled on next start");
    Ok(())
}

/// Split `<principal_id> <command text>`
fn parse_line(line: &str) -> Option<(OwnerId, String)> {
    let (id, text) = line.trim().split_once(char::is_whitespace)?;
    let principal = id.parse().ok()?;
    Some((principal, text.trim().to_string()))
}

async fn reconcile_loop(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // first tick fires immediately; startup already reconciled
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = engine.reconcile().await {
                    warn!("Reconcile failed: {}", e);
                }
            }
        }
    }
}
