//! Broker side of the gateway: control-message parsing and a thin adapter
//! over the rumqttc event loop that fits the single-threaded main loop.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::MqttSettings;

/// Capacity of the rumqttc request channel.
const REQUEST_CAP: usize = 20;

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpSwitch {
    On,
    Off,
}

/// Remote pump command, as published on the control topic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ControlMessage {
    pub(crate) pump: PumpSwitch,
    /// Irrigation time in hours. Only meaningful with `PumpSwitch::On`.
    pub(crate) duration_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawControl {
    pump: String,
    #[serde(default)]
    duration: Option<f64>,
}

/// Parse a `{"pump":"ON"|"OFF","duration":hours}` payload. The switch value
/// is case-insensitive and trimmed.
pub(crate) fn parse_control(payload: &[u8]) -> Result<ControlMessage, String> {
    let raw: RawControl =
        serde_json::from_slice(payload).map_err(|e| format!("bad control json: {e}"))?;

    let pump = match raw.pump.trim().to_uppercase().as_str() {
        "ON" => PumpSwitch::On,
        "OFF" => PumpSwitch::Off,
        other => return Err(format!("unknown pump command '{other}'")),
    };

    Ok(ControlMessage {
        pump,
        duration_hours: raw.duration,
    })
}

// ---------------------------------------------------------------------------
// Broker abstraction
// ---------------------------------------------------------------------------

/// A message received on a subscribed topic.
#[derive(Debug, Clone)]
pub(crate) struct Inbound {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
}

/// What the main loop needs from a publish/subscribe transport.
pub(crate) trait Broker {
    fn is_connected(&self) -> bool;

    /// Spend at most `budget` collecting whatever arrived on subscribed
    /// topics since the last call.
    async fn service(&mut self, budget: Duration) -> Vec<Inbound>;

    /// Queue one message without waiting for delivery.
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// rumqttc adapter
// ---------------------------------------------------------------------------

/// Broker adapter. The rumqttc event loop runs in its own task for the whole
/// life of the gateway, so a slow connect keeps making progress between
/// ticks; the main loop only picks up what that task has queued.
pub(crate) struct MqttBroker {
    client: AsyncClient,
    inbound: mpsc::Receiver<Inbound>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MqttBroker {
    /// Start the event-loop task. Must be called inside the tokio runtime.
    /// After a connection error the next attempt waits `retry_delay`.
    pub(crate) fn spawn(settings: &MqttSettings, host: &str, retry_delay: Duration) -> Self {
        let mut opts = MqttOptions::new(settings.client_id.clone(), host, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keep_alive_s));

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAP);
        let (tx, inbound) = mpsc::channel(REQUEST_CAP);
        let connected = Arc::new(AtomicBool::new(false));
        info!(host, port = settings.port, "mqtt configured");

        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            settings.control_topic.clone(),
            tx,
            Arc::clone(&connected),
            retry_delay,
        ));

        Self {
            client,
            inbound,
            connected,
            task,
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll the event loop forever: track the connection, re-subscribe on every
/// ConnAck, forward publishes to the main loop.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    control_topic: String,
    tx: mpsc::Sender<Inbound>,
    connected: Arc<AtomicBool>,
    retry_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Release);
                // Clean session: every (re)connect needs a fresh subscription.
                match client.try_subscribe(control_topic.clone(), QoS::AtLeastOnce) {
                    Ok(()) => info!(topic = %control_topic, "mqtt connected, subscribed"),
                    Err(e) => warn!(topic = %control_topic, "mqtt subscribe failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Inbound {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        warn!(topic = %msg.topic, "control queue full, message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                connected.store(false, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!("mqtt connection lost: {e}");
                } else {
                    debug!("mqtt connect failed: {e}");
                }
                if tx.is_closed() {
                    return;
                }
                sleep(retry_delay).await;
            }
        }
    }
}

impl Broker for MqttBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Hand the event-loop task up to `budget` of runtime, returning early
    /// once a control message is waiting, then collect everything queued.
    async fn service(&mut self, budget: Duration) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        if let Ok(Some(first)) = timeout(budget, self.inbound.recv()).await {
            inbound.push(first);
        }
        while let Ok(msg) = self.inbound.try_recv() {
            inbound.push(msg);
        }
        inbound
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
