use anyhow::{Context, Result};
use irrigation_link::{LinkPort, SystemClock, TcpLink, DEFAULT_READ_WINDOW};
use std::{env, net::TcpListener, time::Duration};
use tracing_subscriber::EnvFilter;

use irrigation_node::{PumpRelay, SensorNode, DEFAULT_LOOP_INTERVAL, DEFAULT_SAMPLE_INTERVAL};

#[cfg(not(feature = "sim"))]
compile_error!("the sensor node has no hardware sensor drivers yet; enable the `sim` feature");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let sample_every = env::var("SAMPLE_EVERY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SAMPLE_INTERVAL);

    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let relay_gpio: u8 = env::var("RELAY_GPIO")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);

    // ── Relay ───────────────────────────────────────────────────────
    let relay = open_relay(relay_gpio, active_low)?;

    // ── Sensors ─────────────────────────────────────────────────────
    let scenario = irrigation_node::sim::Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_default(),
    );
    let sensors = irrigation_node::sim::FieldSim::new(scenario, 600.0);
    tracing::info!(%scenario, "simulated sensors");

    // ── Link ────────────────────────────────────────────────────────
    let port = open_link()?;

    let mut node = SensorNode::new(
        port,
        SystemClock,
        relay,
        sensors,
        sample_every,
        DEFAULT_READ_WINDOW,
    );
    node.boot();
    tracing::info!(sample_every_ms = sample_every.as_millis() as u64, "sensor node running");

    let mut ticker = tokio::time::interval(DEFAULT_LOOP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let tick = node.iterate();
        if node.link_closed() {
            node.boot();
            anyhow::bail!("gateway closed the link; pump switched off");
        }
        if let Some(frame) = tick.frame {
            tracing::info!(
                t = frame.temperature,
                h = frame.humidity,
                soil = frame.soil_raw,
                pct = frame.soil_percent,
                "reading sent"
            );
        }
    }
}

#[cfg(feature = "gpio")]
fn open_relay(gpio_pin: u8, active_low: bool) -> Result<Box<dyn PumpRelay>> {
    let relay = irrigation_node::GpioRelay::new(gpio_pin, active_low)
        .with_context(|| format!("failed to open relay on gpio {gpio_pin}"))?;
    Ok(Box::new(relay))
}

#[cfg(not(feature = "gpio"))]
fn open_relay(gpio_pin: u8, active_low: bool) -> Result<Box<dyn PumpRelay>> {
    tracing::info!(gpio_pin, "relay gpio not wired (built without `gpio`)");
    Ok(Box::new(irrigation_node::MockRelay::new(active_low)?))
}

/// `LINK_DEVICE` opens a serial port (feature `serial`); otherwise wait for
/// the gateway on `LINK_LISTEN` (default `127.0.0.1:7878`).
fn open_link() -> Result<Box<dyn LinkPort>> {
    if let Ok(device) = env::var("LINK_DEVICE") {
        return open_serial(&device);
    }

    let addr = env::var("LINK_LISTEN").unwrap_or_else(|_| "127.0.0.1:7878".to_string());
    let listener =
        TcpListener::bind(&addr).with_context(|| format!("failed to listen on {addr}"))?;
    tracing::info!(%addr, "waiting for gateway link");
    let link = TcpLink::accept(&listener).context("failed to accept gateway link")?;
    Ok(Box::new(link))
}

#[cfg(feature = "serial")]
fn open_serial(device: &str) -> Result<Box<dyn LinkPort>> {
    let link = irrigation_link::SerialLink::open(device, irrigation_link::LINK_BAUD)
        .with_context(|| format!("failed to open serial link {device}"))?;
    tracing::info!(device, "link opened");
    Ok(Box::new(link))
}

#[cfg(not(feature = "serial"))]
fn open_serial(device: &str) -> Result<Box<dyn LinkPort>> {
    anyhow::bail!("LINK_DEVICE '{device}' needs the `serial` feature; rebuild with --features serial")
}
