//! Hardware collaborators consumed by the measurement core.
//!
//! The core never talks to a bus directly. It sees the sensor EEPROMs through
//! [`SensorBus`] (one shared multiplexer in front of identical EEPROMs), the
//! ADCs through [`VoltageSource`] and the presence-detect pins through
//! [`PresenceSource`].

pub mod frontend;

pub use frontend::SimulatedFrontEnd;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Device not responding")]
    NotResponding,

    #[error("Multiplexer port {0} does not exist")]
    NoSuchPort(u8),

    #[error("No multiplexer port selected")]
    NotSelected,

    #[error("Access outside device memory: offset {offset}, length {len}")]
    OutOfRange { offset: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Byte-addressable sensor EEPROM reached through a bus multiplexer.
///
/// Only one port may be selected at a time; callers must `release` before
/// another channel's store is touched.
pub trait SensorBus {
    fn select(&mut self, port: u8) -> Result<()>;
    fn release(&mut self) -> Result<()>;
    fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Source of raw detector voltage, one ADC per channel.
pub trait VoltageSource {
    fn read_voltage(&mut self, channel: u8) -> Result<f32>;
}

/// Level read of the presence-detect pin of a channel.
pub trait PresenceSource {
    fn is_present(&self, channel: u8) -> bool;
}
