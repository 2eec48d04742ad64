mod config;
mod gateway;
mod handshake;
mod mqtt;
mod scheduler;
mod storage;
mod telemetry;
mod watchdog;

use anyhow::{bail, Context, Result};
use irrigation_link::{LinkPort, SystemClock};
use std::{env, time::Duration};
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::Gateway;
use mqtt::MqttBroker;
use storage::ServerAddressStore;
use watchdog::Watchdog;

/// Iterations between status lines.
const REPORT_EVERY: u64 = 60;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "gateway.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Broker address ──────────────────────────────────────────────
    let host = broker_host(&cfg)?;

    // ── Link ────────────────────────────────────────────────────────
    let port = open_link(&cfg)?;

    // ── MQTT ────────────────────────────────────────────────────────
    let broker = MqttBroker::spawn(&cfg.mqtt, &host, cfg.loop_interval());

    // ── Watchdog ────────────────────────────────────────────────────
    let watchdog = Watchdog::spawn(cfg.watchdog_timeout(), watchdog::reset)?;

    let mut gw = Gateway::new(&cfg, port, broker, SystemClock, watchdog);
    gw.boot();

    let mut ticker = tokio::time::interval(cfg.loop_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut iteration: u64 = 0;
    loop {
        ticker.tick().await;
        let stats = gw.iterate().await;
        tracing::trace!(
            control = stats.control_messages,
            lines = stats.lines,
            readings = stats.readings,
            auto_off = stats.auto_off,
            sent = stats.lines_sent,
            "tick"
        );

        iteration += 1;
        if iteration % REPORT_EVERY == 0 {
            gw.report();
        }
    }
}

/// Configured host, else the address provisioned into storage. A configured
/// host that differs from the stored one is written back so the next boot
/// finds it even without the config.
fn broker_host(cfg: &Config) -> Result<String> {
    let mut store = match &cfg.storage.path {
        Some(path) => Some(ServerAddressStore::open(path, cfg.storage.server_addr_offset)?),
        None => None,
    };

    let stored = match store.as_mut() {
        Some(s) => s.read().context("failed to read stored server address")?,
        None => None,
    };

    let host = config::resolve_broker_host(cfg.mqtt.host.as_deref(), stored.as_deref())
        .context("gateway is not provisioned")?;

    if let (Some(store), Some(configured)) = (store.as_mut(), cfg.mqtt.host.as_deref()) {
        let stored_host = stored.as_deref().and_then(config::host_from_address);
        if stored_host.as_deref() != Some(configured) {
            store
                .write(configured)
                .context("failed to persist server address")?;
            tracing::info!(host = configured, "server address stored");
        }
    }

    tracing::info!(%host, "broker host resolved");
    Ok(host)
}

fn open_link(cfg: &Config) -> Result<Box<dyn LinkPort>> {
    if let Some(device) = &cfg.link.device {
        return open_serial(device, cfg.link.baud);
    }
    if let Some(addr) = &cfg.link.tcp {
        let link = irrigation_link::TcpLink::connect(addr, Duration::from_secs(5))
            .with_context(|| format!("failed to connect link to {addr}"))?;
        tracing::info!(%addr, "link connected over tcp");
        return Ok(Box::new(link));
    }
    bail!("no link configured: set link.device (or LINK_DEVICE) or link.tcp (or LINK_TCP)")
}

#[cfg(feature = "serial")]
fn open_serial(device: &str, baud: u32) -> Result<Box<dyn LinkPort>> {
    let link = irrigation_link::SerialLink::open(device, baud)
        .with_context(|| format!("failed to open serial link {device}"))?;
    tracing::info!(device, baud, "link opened");
    Ok(Box::new(link))
}

#[cfg(not(feature = "serial"))]
fn open_serial(device: &str, _baud: u32) -> Result<Box<dyn LinkPort>> {
    bail!("link.device '{device}' needs the `serial` feature; rebuild with --features serial")
}
