//! One measurement channel: sample averaging, attenuator compensation and
//! unit conversion of the calibrated reading.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::calibration::SensorCalibration;

pub const MIN_AVERAGING: u32 = 1;
pub const MAX_AVERAGING: u32 = 256;
pub const DEFAULT_AVERAGING: u32 = 16;

/// Power measurement unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerUnit {
    #[default]
    DBm,
    DBW,
    MilliWatt,
    Watt,
}

impl PowerUnit {
    /// Mnemonic used on the command interface.
    pub fn mnemonic(self) -> &'static str {
        match self {
            PowerUnit::DBm => "DBM",
            PowerUnit::DBW => "DBW",
            PowerUnit::MilliWatt => "MW",
            PowerUnit::Watt => "W",
        }
    }

    pub fn convert_dbm(self, dbm: f32) -> f32 {
        match self {
            PowerUnit::DBm => dbm,
            PowerUnit::DBW => dbm - 30.0,
            PowerUnit::MilliWatt => 10f32.powf(dbm / 10.0),
            PowerUnit::Watt => 10f32.powf((dbm - 30.0) / 10.0),
        }
    }
}

impl fmt::Display for PowerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerUnit::DBm => "dBm",
            PowerUnit::DBW => "dBW",
            PowerUnit::MilliWatt => "mW",
            PowerUnit::Watt => "W",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown power unit '{0}'")]
pub struct UnknownUnit(pub String);

impl FromStr for PowerUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DBM" => Ok(PowerUnit::DBm),
            "DBW" => Ok(PowerUnit::DBW),
            "MW" => Ok(PowerUnit::MilliWatt),
            "W" => Ok(PowerUnit::Watt),
            _ => Err(UnknownUnit(s.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeasurementChannel {
    id: u8,
    averaging: u32,
    unit: PowerUnit,
    attenuator_db: f32,
    samples: VecDeque<f32>,
    last_power_dbm: Option<f32>,
    last_voltage: f32,
}

impl MeasurementChannel {
    pub fn new(id: u8, averaging: u32) -> Self {
        let averaging = averaging.clamp(MIN_AVERAGING, MAX_AVERAGING);
        MeasurementChannel {
            id,
            averaging,
            unit: PowerUnit::default(),
            attenuator_db: 0.0,
            samples: VecDeque::with_capacity(averaging as usize),
            last_power_dbm: None,
            last_voltage: 0.0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Adds a voltage sample and refreshes the reading from the running mean.
    ///
    /// Without a calibration the sample is still buffered but the reading
    /// becomes absent.
    pub fn read_power(
        &mut self,
        voltage: f32,
        calibration: Option<&SensorCalibration>,
    ) -> Option<f32> {
        self.last_voltage = voltage;
        self.samples.push_back(voltage);
        while self.samples.len() > self.averaging as usize {
            self.samples.pop_front();
        }

        self.last_power_dbm = calibration.map(|cal| cal.voltage_to_dbm(self.mean_voltage()));
        self.last_power_dbm
    }

    /// Mean of the buffered samples, 0 when the buffer is empty.
    pub fn mean_voltage(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    /// Latest reading in `unit` (the channel unit when `None`).
    ///
    /// The attenuator models loss ahead of the sensor, so including it adds
    /// its value to the measured dBm before conversion.
    pub fn get_power(&self, unit: Option<PowerUnit>, include_attenuator: bool) -> (Option<f32>, PowerUnit) {
        let unit = unit.unwrap_or(self.unit);
        let value = self.last_power_dbm.map(|dbm| {
            let corrected = if include_attenuator {
                dbm + self.attenuator_db
            } else {
                dbm
            };
            unit.convert_dbm(corrected)
        });
        (value, unit)
    }

    pub fn last_power_dbm(&self) -> Option<f32> {
        self.last_power_dbm
    }

    pub fn last_voltage(&self) -> f32 {
        self.last_voltage
    }

    pub fn averaging(&self) -> u32 {
        self.averaging
    }

    /// Sets the averaging depth, clamped to 1..=256, and restarts averaging.
    pub fn set_averaging(&mut self, depth: i64) {
        self.averaging = depth.clamp(i64::from(MIN_AVERAGING), i64::from(MAX_AVERAGING)) as u32;
        debug!("Channel {}: averaging depth {}", self.id, self.averaging);
        self.clear_averaging();
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn clear_averaging(&mut self) {
        self.samples.clear();
    }

    /// Drops buffered samples and the latest reading.
    pub fn clear_reading(&mut self) {
        self.samples.clear();
        self.last_power_dbm = None;
    }

    pub fn unit(&self) -> PowerUnit {
        self.unit
    }

    pub fn set_unit(&mut self, unit: PowerUnit) {
        self.unit = unit;
    }

    pub fn attenuator(&self) -> f32 {
        self.attenuator_db
    }

    pub fn set_attenuator(&mut self, value_db: f32) {
        self.attenuator_db = value_db;
    }

    /// Back to power-on settings: default averaging, dBm, no attenuator.
    pub fn reset(&mut self, averaging: u32) {
        self.set_averaging(i64::from(averaging));
        self.unit = PowerUnit::DBm;
        self.attenuator_db = 0.0;
    }
}
