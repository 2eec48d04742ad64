//! Stateful field simulator for running the sensor node without hardware.
//!
//! Models a 10-bit capacitive soil probe and a DHT-style air sensor:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC noise and occasional spikes
//! - Diurnal (day/night) cycle in temperature and humidity
//! - Closed-loop watering response (soil gets wetter while the pump runs)
//! - Occasional failed air reads, reported as NaN

use std::fmt;
use std::time::Instant;

use crate::sensor::{Climate, SensorSource};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. Warm day.
    Drying,
    /// Hovers near the centre with low noise.
    Stable,
    /// Noisy soil readings and frequent failed air reads.
    Flaky,
    /// Starts near saturation and dries slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drying => "drying",
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::Wet => "wet",
        })
    }
}

struct Profile {
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    /// 0.0 = wettest, 1.0 = driest.
    start_frac: f64,
    climate_fail_prob: f32,
}

impl Scenario {
    fn profile(self) -> Profile {
        match self {
            Self::Drying => Profile {
                drift: 1.5,
                walk_sigma: 6.0,
                mean_reversion: 0.02,
                noise_sigma: 4.0,
                spike_prob: 0.03,
                spike_sigma: 80.0,
                start_frac: 0.5,
                climate_fail_prob: 0.02,
            },
            Self::Stable => Profile {
                drift: 0.2,
                walk_sigma: 2.5,
                mean_reversion: 0.05,
                noise_sigma: 2.0,
                spike_prob: 0.005,
                spike_sigma: 40.0,
                start_frac: 0.5,
                climate_fail_prob: 0.0,
            },
            Self::Flaky => Profile {
                drift: 1.0,
                walk_sigma: 10.0,
                mean_reversion: 0.02,
                noise_sigma: 10.0,
                spike_prob: 0.10,
                spike_sigma: 120.0,
                start_frac: 0.5,
                climate_fail_prob: 0.25,
            },
            Self::Wet => Profile {
                drift: 0.3,
                walk_sigma: 3.0,
                mean_reversion: 0.02,
                noise_sigma: 3.0,
                spike_prob: 0.02,
                spike_sigma: 60.0,
                start_frac: 0.15,
                climate_fail_prob: 0.01,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Raw probe value in bone-dry soil.
const RAW_DRY: f64 = 900.0;
/// Raw probe value in saturated soil.
const RAW_WET: f64 = 300.0;
/// Raw units per sample the soil moves toward wet while watering.
const WET_RATE: f64 = -25.0;

pub struct FieldSim {
    rng: fastrand::Rng,
    profile: Profile,
    /// Current "true" soil moisture in raw units. Evolves each sample.
    soil_base: f64,
    center: f64,
    watering: bool,
    /// Time of the first climate read; the day cycle starts there.
    started: Option<Instant>,
    diurnal_period_s: f64,
}

impl FieldSim {
    /// `diurnal_period_s` is the day/night cycle length: 600 for fast
    /// iteration, 86400 for real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        Self::with_rng(scenario, diurnal_period_s, fastrand::Rng::new())
    }

    /// Deterministic simulator for tests.
    pub fn seeded(scenario: Scenario, diurnal_period_s: f64, seed: u64) -> Self {
        Self::with_rng(scenario, diurnal_period_s, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(scenario: Scenario, diurnal_period_s: f64, mut rng: fastrand::Rng) -> Self {
        let profile = scenario.profile();
        let range = RAW_DRY - RAW_WET;
        let jitter = gaussian(&mut rng, 0.0, range * 0.03);
        let soil_base = (RAW_WET + profile.start_frac * range + jitter).clamp(RAW_WET, RAW_DRY);

        Self {
            rng,
            profile,
            soil_base,
            center: (RAW_DRY + RAW_WET) / 2.0,
            watering: false,
            started: None,
            diurnal_period_s,
        }
    }

    /// Position in the day/night cycle at `now`, -1.0 (night) to 1.0
    /// (afternoon).
    fn diurnal(&mut self, now: Instant) -> f64 {
        let started = *self.started.get_or_insert(now);
        let t = now.saturating_duration_since(started).as_secs_f64();
        (2.0 * std::f64::consts::PI * t / self.diurnal_period_s).sin()
    }
}

impl SensorSource for FieldSim {
    fn read_climate(&mut self, now: Instant) -> Climate {
        let day = self.diurnal(now);
        if self.rng.f32() < self.profile.climate_fail_prob {
            return Climate {
                temperature: f32::NAN,
                humidity: f32::NAN,
            };
        }
        let temperature = gaussian(&mut self.rng, 24.0 + 5.0 * day, 0.3);
        let humidity = gaussian(&mut self.rng, 55.0 - 12.0 * day, 1.0).clamp(0.0, 100.0);

        // One decimal place, like the real sensor.
        Climate {
            temperature: ((temperature * 10.0).round() / 10.0) as f32,
            humidity: ((humidity * 10.0).round() / 10.0) as f32,
        }
    }

    fn read_soil_raw(&mut self) -> u16 {
        let p = &self.profile;

        let pull = p.mean_reversion * (self.center - self.soil_base);
        let walk = gaussian(&mut self.rng, 0.0, p.walk_sigma);
        let wet = if self.watering { WET_RATE } else { 0.0 };
        self.soil_base = (self.soil_base + p.drift + pull + walk + wet)
            .clamp(RAW_WET - 100.0, RAW_DRY + 100.0);

        let noise = gaussian(&mut self.rng, 0.0, p.noise_sigma);
        let spike = if self.rng.f32() < p.spike_prob {
            gaussian(&mut self.rng, 0.0, p.spike_sigma)
        } else {
            0.0
        };

        (self.soil_base + noise + spike).round().clamp(0.0, 1023.0) as u16
    }

    fn pump_changed(&mut self, on: bool) {
        self.watering = on;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
