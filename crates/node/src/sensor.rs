//! Periodic sampling. Once enabled by `START_READING`, emits one reading
//! frame per sample interval, whatever the command traffic is doing.

use irrigation_link::{Outbox, SensorFrame, SOIL_RAW_MAX};
use std::time::{Duration, Instant};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(6000);

/// Substituted when the air sensor returns garbage.
pub const FALLBACK_TEMPERATURE: f32 = 30.0;
pub const FALLBACK_HUMIDITY: f32 = 40.0;

/// Diagnostic line sent when the fallback values are used.
pub const CLIMATE_FAULT_LINE: &str = "Failed to read from DHT sensor!";

/// Air temperature (°C) and relative humidity (%). NaN in either field
/// marks a failed read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f32,
    pub humidity: f32,
}

impl Climate {
    pub fn is_valid(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }
}

/// Whatever the node samples from: hardware drivers or the simulator.
pub trait SensorSource {
    /// Air temperature and humidity as sampled at `now`.
    fn read_climate(&mut self, now: Instant) -> Climate;

    /// Raw 10-bit soil probe value; higher is drier.
    fn read_soil_raw(&mut self) -> u16;

    /// Told whenever the pump relay changes, for sources that react to
    /// watering.
    fn pump_changed(&mut self, _on: bool) {}
}

/// Map a raw soil reading onto 0–100 % moisture: 1023 (dry) is 0 %, 0
/// (saturated) is 100 %. Integer arithmetic, truncating.
pub fn soil_percent(raw: u16) -> u8 {
    let raw = u32::from(raw.min(SOIL_RAW_MAX));
    let max = u32::from(SOIL_RAW_MAX);
    ((max - raw) * 100 / max) as u8
}

pub struct SensorLoop {
    enabled: bool,
    interval: Duration,
    last_sample: Option<Instant>,
    frames: u64,
}

impl SensorLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            enabled: false,
            interval,
            last_sample: None,
            frames: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Start sampling. The first frame goes out on the next tick.
    pub fn enable(&mut self) {
        if !self.enabled {
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "sampling enabled");
        }
        self.enabled = true;
    }

    /// Sample if enabled and due. The frame line is followed by two
    /// diagnostic lines (percentage, raw value) for anyone watching the
    /// serial console.
    pub fn tick<S: SensorSource + ?Sized>(
        &mut self,
        now: Instant,
        source: &mut S,
        outbox: &mut Outbox,
    ) -> Option<SensorFrame> {
        if !self.enabled {
            return None;
        }
        if let Some(last) = self.last_sample {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_sample = Some(now);

        let climate = source.read_climate(now);
        let climate = if climate.is_valid() {
            climate
        } else {
            tracing::warn!(?climate, "climate read failed, using fallback values");
            outbox.push(CLIMATE_FAULT_LINE);
            Climate {
                temperature: FALLBACK_TEMPERATURE,
                humidity: FALLBACK_HUMIDITY,
            }
        };

        let soil_raw = source.read_soil_raw().min(SOIL_RAW_MAX);
        let frame = SensorFrame {
            temperature: climate.temperature,
            humidity: climate.humidity,
            soil_raw,
            soil_percent: soil_percent(soil_raw),
        };

        outbox.push(frame.to_line());
        outbox.push(frame.soil_percent.to_string());
        outbox.push(frame.soil_raw.to_string());
        self.frames += 1;

        tracing::debug!(
            t = frame.temperature,
            h = frame.humidity,
            soil = frame.soil_raw,
            pct = frame.soil_percent,
            "sampled"
        );
        Some(frame)
    }
}

impl Default for SensorLoop {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use irrigation_link::{parse_frame, Clock, ManualClock};

    /// Fixed readings; `climate_ok = false` simulates a failed air read.
    pub(crate) struct FixedSensors {
        pub(crate) climate_ok: bool,
        pub(crate) soil_raw: u16,
        pub(crate) pump_on: bool,
    }

    impl Default for FixedSensors {
        fn default() -> Self {
            Self {
                climate_ok: true,
                soil_raw: 400,
                pump_on: false,
            }
        }
    }

    impl SensorSource for FixedSensors {
        fn read_climate(&mut self, _now: Instant) -> Climate {
            if self.climate_ok {
                Climate {
                    temperature: 22.5,
                    humidity: 55.0,
                }
            } else {
                Climate {
                    temperature: f32::NAN,
                    humidity: 55.0,
                }
            }
        }

        fn read_soil_raw(&mut self) -> u16 {
            self.soil_raw
        }

        fn pump_changed(&mut self, on: bool) {
            self.pump_on = on;
        }
    }

    // -- soil_percent ---------------------------------------------------------

    #[test]
    fn soil_percent_endpoints() {
        assert_eq!(soil_percent(1023), 0);
        assert_eq!(soil_percent(0), 100);
    }

    #[test]
    fn soil_percent_truncates() {
        // (1023 - 400) * 100 / 1023 = 60.9…
        assert_eq!(soil_percent(400), 60);
        assert_eq!(soil_percent(512), 49);
        assert_eq!(soil_percent(1022), 0);
        assert_eq!(soil_percent(1), 99);
    }

    #[test]
    fn soil_percent_is_monotonic_and_bounded() {
        let mut prev = soil_percent(0);
        for raw in 1..=SOIL_RAW_MAX {
            let pct = soil_percent(raw);
            assert!(pct <= 100);
            assert!(pct <= prev, "not monotonic at {raw}: {pct} > {prev}");
            prev = pct;
        }
    }

    #[test]
    fn soil_percent_clamps_out_of_range_raw() {
        assert_eq!(soil_percent(4095), 0);
    }

    // -- SensorLoop -----------------------------------------------------------

    #[test]
    fn disabled_loop_stays_quiet() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors::default();
        let mut lp = SensorLoop::default();

        for _ in 0..20 {
            clock.advance(Duration::from_secs(1));
            assert!(lp.tick(clock.now(), &mut sensors, &mut outbox).is_none());
        }
        assert!(outbox.is_empty());
    }

    #[test]
    fn first_frame_right_after_enable() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors::default();
        let mut lp = SensorLoop::default();

        lp.enable();
        let frame = lp.tick(clock.now(), &mut sensors, &mut outbox).unwrap();

        assert_eq!(frame.soil_raw, 400);
        assert_eq!(frame.soil_percent, 60);
        assert_eq!(outbox.lines().len(), 3);
        assert_eq!(parse_frame(&outbox.lines()[0]).unwrap(), frame);
        assert_eq!(outbox.lines()[1], "60");
        assert_eq!(outbox.lines()[2], "400");
    }

    #[test]
    fn one_frame_per_interval() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors::default();
        let mut lp = SensorLoop::default();
        lp.enable();

        // 60 s of 50 ms ticks.
        for _ in 0..1200 {
            lp.tick(clock.now(), &mut sensors, &mut outbox);
            clock.advance(Duration::from_millis(50));
        }
        // t = 0, 6, 12, … 54
        assert_eq!(lp.frames(), 10);
    }

    #[test]
    fn climate_failure_uses_fallback() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors {
            climate_ok: false,
            ..FixedSensors::default()
        };
        let mut lp = SensorLoop::default();
        lp.enable();

        let frame = lp.tick(clock.now(), &mut sensors, &mut outbox).unwrap();

        assert_eq!(frame.temperature, FALLBACK_TEMPERATURE);
        assert_eq!(frame.humidity, FALLBACK_HUMIDITY);
        assert_eq!(outbox.lines()[0], CLIMATE_FAULT_LINE);
        assert_eq!(parse_frame(&outbox.lines()[1]).unwrap(), frame);
    }

    #[test]
    fn out_of_range_soil_is_clamped() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors {
            soil_raw: 2000,
            ..FixedSensors::default()
        };
        let mut lp = SensorLoop::default();
        lp.enable();

        let frame = lp.tick(clock.now(), &mut sensors, &mut outbox).unwrap();
        assert_eq!(frame.soil_raw, SOIL_RAW_MAX);
        assert_eq!(frame.soil_percent, 0);
    }

    #[test]
    fn enable_twice_keeps_schedule() {
        let clock = ManualClock::new();
        let mut outbox = Outbox::new();
        let mut sensors = FixedSensors::default();
        let mut lp = SensorLoop::default();
        lp.enable();
        lp.tick(clock.now(), &mut sensors, &mut outbox);

        clock.advance(Duration::from_secs(1));
        lp.enable();
        assert!(lp.tick(clock.now(), &mut sensors, &mut outbox).is_none());
        assert!(lp.enabled());
    }
}
