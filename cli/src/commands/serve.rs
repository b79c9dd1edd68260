// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Long-running cortex process
//!
//! Boots the runtime, starts background consolidation and logs cortex
//! events until Ctrl-C or SIGTERM. A tripped halt latch or a dead worker
//! ends the process with an error.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

use aegis_cortex::application::runtime::CortexRuntime;
use aegis_cortex::domain::config::CortexConfigManifest;
use aegis_cortex::domain::events::CortexEvent;
use aegis_cortex::infrastructure::event_bus::EventBusError;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Expose Prometheus metrics on this address (e.g. 127.0.0.1:9464)
    #[arg(long, env = "CORTEX_METRICS_ADDR", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

pub async fn run(manifest: &CortexConfigManifest, args: ServeArgs) -> Result<()> {
    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics listening on {}", addr);
    }

    let runtime = CortexRuntime::bootstrap(manifest).await?;
    let mut events = runtime.events().subscribe();
    runtime.start_worker();

    println!(
        "{}",
        format!(
            "✓ Cortex running on {} (dimension {})",
            runtime.spec().storage.database_path.display(),
            runtime.spec().embedding.dimension
        )
        .green()
    );
    println!("{}", "Press Ctrl-C to stop".dimmed());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(EventBusError::Lagged(n)) => warn!("Event log skipped {} events", n),
                Err(EventBusError::Closed) => break Err(anyhow!("Cortex event bus closed")),
                Err(EventBusError::Empty) => {}
            },
            _ = health.tick() => {
                if runtime.is_halted() {
                    let reason = runtime.components().knowledge.halt().reason().unwrap_or_default();
                    break Err(anyhow!("Cortex halted: {}", reason));
                }
                if runtime.worker_finished() {
                    break Err(anyhow!("Consolidation worker stopped unexpectedly"));
                }
            }
        }
    };

    runtime.shutdown().await;
    if result.is_ok() {
        println!("{}", "✓ Cortex stopped".green());
    }
    result
}

fn log_event(event: &CortexEvent) {
    let pattern_id = event.pattern_id().map(|id| id.to_string());
    match event {
        CortexEvent::PatternStored { .. } | CortexEvent::PatternOutcomeRecorded { .. } => {
            debug!(event = event.event_type(), pattern_id = ?pattern_id, "Cortex event");
        }
        _ => info!(event = event.event_type(), pattern_id = ?pattern_id, "Cortex event"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
