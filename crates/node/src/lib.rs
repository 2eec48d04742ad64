//! Sensor node: samples soil and air, drives the pump relay on command, and
//! talks to the gateway over the serial link.

pub mod dispatcher;
pub mod node;
pub mod relay;
pub mod sensor;
#[cfg(feature = "sim")]
pub mod sim;

pub use dispatcher::CommandDispatcher;
pub use node::{NodeTick, SensorNode, DEFAULT_LOOP_INTERVAL};
#[cfg(feature = "gpio")]
pub use relay::GpioRelay;
pub use relay::{MockRelay, PumpRelay};
pub use sensor::{soil_percent, Climate, SensorLoop, SensorSource, DEFAULT_SAMPLE_INTERVAL};
