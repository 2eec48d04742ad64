//! Reading frames → broker telemetry. Best-effort: a frame that cannot be
//! published right now is dropped, never queued.

use irrigation_link::SensorFrame;
use serde::Serialize;
use tracing::{debug, warn};

use crate::mqtt::Broker;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct TelemetryPayload {
    pub(crate) t: f32,
    pub(crate) h_air: f32,
    pub(crate) h_soil: u16,
    pub(crate) h_soil_pourcentage: u8,
    #[serde(rename = "deviceId")]
    pub(crate) device_id: String,
}

impl TelemetryPayload {
    pub(crate) fn from_frame(frame: &SensorFrame, device_id: &str) -> Self {
        Self {
            t: frame.temperature,
            h_air: frame.humidity,
            h_soil: frame.soil_raw,
            h_soil_pourcentage: frame.soil_percent,
            device_id: device_id.to_string(),
        }
    }
}

pub(crate) struct TelemetryRelay {
    topic: String,
    device_id: String,
    published: u64,
    dropped: u64,
}

impl TelemetryRelay {
    pub(crate) fn new(topic: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            device_id: device_id.into(),
            published: 0,
            dropped: 0,
        }
    }

    pub(crate) fn published(&self) -> u64 {
        self.published
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Publish one frame. Returns whether it was handed to the broker.
    pub(crate) fn relay<B: Broker>(&mut self, frame: &SensorFrame, broker: &mut B) -> bool {
        if !broker.is_connected() {
            self.dropped += 1;
            debug!(dropped = self.dropped, "broker offline, dropping reading");
            return false;
        }

        let payload = TelemetryPayload::from_frame(frame, &self.device_id);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                self.dropped += 1;
                warn!("telemetry encode failed: {e}");
                return false;
            }
        };

        match broker.publish(&self.topic, bytes) {
            Ok(()) => {
                self.published += 1;
                debug!(
                    topic = %self.topic,
                    t = payload.t,
                    h_air = payload.h_air,
                    h_soil = payload.h_soil,
                    pct = payload.h_soil_pourcentage,
                    "published reading"
                );
                true
            }
            Err(e) => {
                self.dropped += 1;
                warn!("{e:#}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
