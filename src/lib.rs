//! Core of a two-channel RF power meter: SCPI command engine, per-sensor
//! calibration stored on the sensor's EEPROM, averaging measurement channels
//! and hot-swap detection.
//!
//! Hardware access goes through the traits in [`devices`]; the binary drives
//! everything from a cooperative [`scheduler::Scheduler`] over the simulated
//! front end.

pub mod calibration;
pub mod channel;
pub mod config;
pub mod devices;
pub mod hotswap;
pub mod meter;
pub mod recorder;
pub mod scheduler;
pub mod scpi;
