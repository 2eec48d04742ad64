//! Pump relay. The `gpio` feature gates the real rppal driver; the mock
//! records the line level it would have driven.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Electrical level on the relay input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

/// Level that puts the relay in the requested state. Active-low boards
/// switch on when the input is pulled LOW.
pub fn level_for(on: bool, active_low: bool) -> PinLevel {
    match (on, active_low) {
        (true, true) | (false, false) => PinLevel::Low,
        (true, false) | (false, true) => PinLevel::High,
    }
}

pub trait PumpRelay {
    fn set(&mut self, on: bool);
    fn is_on(&self) -> bool;
}

impl<R: PumpRelay + ?Sized> PumpRelay for Box<R> {
    fn set(&mut self, on: bool) {
        (**self).set(on)
    }

    fn is_on(&self) -> bool {
        (**self).is_on()
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production: rppal on Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioRelay {
    pin: OutputPin,
    active_low: bool,
    on: bool,
}

#[cfg(feature = "gpio")]
impl GpioRelay {
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(gpio_pin)?.into_output();
        // Fail-safe: pump off from the first instruction after boot.
        drive(&mut pin, level_for(false, active_low));
        tracing::info!(gpio_pin, active_low, "pump relay initialised (off)");
        Ok(Self {
            pin,
            active_low,
            on: false,
        })
    }
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, level: PinLevel) {
    match level {
        PinLevel::Low => pin.set_low(),
        PinLevel::High => pin.set_high(),
    }
}

#[cfg(feature = "gpio")]
impl PumpRelay for GpioRelay {
    fn set(&mut self, on: bool) {
        drive(&mut self.pin, level_for(on, self.active_low));
        self.on = on;
        tracing::info!(pump = if on { "ON" } else { "OFF" }, "relay set");
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------

pub struct MockRelay {
    active_low: bool,
    level: PinLevel,
}

impl MockRelay {
    pub fn new(active_low: bool) -> Result<Self> {
        tracing::info!(active_low, "[mock-gpio] pump relay initialised (no hardware)");
        Ok(Self {
            active_low,
            level: level_for(false, active_low),
        })
    }

    /// Level the relay input would be held at.
    pub fn level(&self) -> PinLevel {
        self.level
    }
}

impl PumpRelay for MockRelay {
    fn set(&mut self, on: bool) {
        self.level = level_for(on, self.active_low);
        tracing::info!(
            pump = if on { "ON" } else { "OFF" },
            level = ?self.level,
            "[mock-gpio] relay set"
        );
    }

    fn is_on(&self) -> bool {
        self.level == level_for(true, self.active_low)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
