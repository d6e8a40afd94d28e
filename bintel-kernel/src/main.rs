/**
 * BINTEL KERNEL - Point d'entrée du service de télémétrie
 *
 * RÔLE : charge la config, construit les adaptateurs du backing store,
 * démarre le moteur puis sert l'API de lecture jusqu'à Ctrl-C.
 */

use anyhow::Context;
use bintel_kernel::backing::{ChangeFeed, MemoryTable, MqttChangeFeed, RestTable, TelemetryTable};
use bintel_kernel::config::{load_config, BackingMode, KernelConfig};
use bintel_kernel::fleet::seed_fleet;
use bintel_kernel::http::{build_router, AppState};
use bintel_kernel::TelemetryEngine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type Backing = (Arc<dyn TelemetryTable>, Arc<dyn ChangeFeed>);

fn build_backing(cfg: &KernelConfig) -> anyhow::Result<Backing> {
    match cfg.backing.mode {
        BackingMode::Rest => {
            let rest = cfg.backing.rest.as_ref().context("backing.rest.url is required in rest mode")?;
            let key = std::env::var("BINTEL_STORE_KEY").ok().filter(|k| !k.is_empty());
            if key.is_none() {
                warn!("BINTEL_STORE_KEY not set, querying the table anonymously");
            }
            let table = RestTable::new(&rest.url, &cfg.backing.table, key).context("building REST client")?;
            let feed = MqttChangeFeed::new(cfg.backing.mqtt.clone(), cfg.backing.table.clone());
            info!(endpoint = table.endpoint(), broker = %cfg.backing.mqtt.host, "using REST table + MQTT change feed");
            let backing: Backing = (Arc::new(table), Arc::new(feed));
            Ok(backing)
        }
        BackingMode::Memory => {
            info!("using in-memory telemetry table");
            let table = Arc::new(MemoryTable::new());
            let backing: Backing = (table.clone(), table);
            Ok(backing)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bintel_kernel=info")))
        .init();

    let cfg = load_config().await;
    let (table, feed) = build_backing(&cfg)?;

    let devices = if cfg.fleet.devices.is_empty() { seed_fleet() } else { cfg.fleet.devices.clone() };
    let engine = Arc::new(
        TelemetryEngine::new(cfg.engine.clone(), devices, table, feed).context("invalid engine configuration")?,
    );
    engine.subscribe(|update| {
        debug!(device_id = update.device_id, fill = update.fill_level, source = ?update.source, "fleet update");
    });
    engine.start();

    let api_key = std::env::var("BINTEL_API_KEY").ok();
    if api_key.as_deref().map_or(true, str::is_empty) {
        warn!("BINTEL_API_KEY not set, only /health will answer");
    }
    let app = build_router(AppState { engine: engine.clone(), api_key });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed, running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    engine.stop();
    info!("bye");
    Ok(())
}
