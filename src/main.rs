//! turnsync server
//!
//! Serves the Skirmish reference game over WebSocket, or plays an
//! in-process demo match when `TURNSYNC_DEMO=1`.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnsync::{
    VERSION,
    demo::{run_demo_match, DemoConfig, Skirmish},
    network::server::{GameServer, ServerConfig},
    sync::batcher::{BatcherConfig, DEFAULT_MAX_BATCH_SIZE},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("turnsync v{}", VERSION);
    let config = ServerConfig::from_env();

    if config.demo {
        return demo(&config);
    }

    let server = GameServer::new(Skirmish, config);
    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
        }
    }
    Ok(())
}

/// Play one match in-process and print what happened.
fn demo(config: &ServerConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Match ===");

    let demo_config = DemoConfig {
        batching: BatcherConfig::with_window(config.batch_window_ms, DEFAULT_MAX_BATCH_SIZE),
        ..DemoConfig::default()
    };
    let report = run_demo_match(&demo_config).context("demo match failed")?;

    info!("=== Match Results ===");
    info!("Version {} after {} turns", report.version, report.turns);
    info!(
        "Submitted {}, refused locally {}, confirmed {}, rolled back {}",
        report.submitted, report.rejected_locally, report.confirmations, report.rollbacks
    );
    for (player, rendered) in &report.rendered {
        info!("Player {} saw {} effects", hex::encode(&player.as_bytes()[..4]), rendered);
    }
    match &report.winners {
        Some(winners) => info!("Winners: {:?}", winners),
        None => info!("Turn limit reached"),
    }
    info!("CONVERGED: every client matches the server");
    Ok(())
}
