//! Sensor calibration: the base linear response of a detector, its
//! per-frequency corrections, and their persistence in the sensor's EEPROM.

pub mod record;

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::devices::{self, DeviceError, SensorBus};
use record::{CalibrationRecord, RECORD_CAPACITY, RecordError};

/// Corrections closer than this to identity are not worth persisting.
const PERSIST_TOLERANCE: f32 = 1e-3;

/// Below this base slope the sensor response is considered degenerate.
const MIN_BASE_SLOPE: f32 = 1e-4;

pub const CHANNELS: [u8; 2] = [1, 2];

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    #[error("No sensor detected on channel {0}")]
    NoSensor(u8),

    #[error("{0} MHz is not a calibration frequency of this sensor")]
    UnknownFrequency(u16),

    #[error("Sensor store error: {0}")]
    Device(#[from] DeviceError),

    #[error("Calibration record error: {0}")]
    Record(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Offset/slope correction applied on top of the base response at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyCorrection {
    pub frequency_mhz: u16,
    pub offset_db: f32,
    pub slope: f32,
}

impl FrequencyCorrection {
    pub fn new(frequency_mhz: u16, offset_db: f32, slope: f32) -> Self {
        FrequencyCorrection {
            frequency_mhz,
            offset_db,
            slope,
        }
    }

    pub fn identity(frequency_mhz: u16) -> Self {
        Self::new(frequency_mhz, 0.0, 1.0)
    }

    pub fn is_identity(&self) -> bool {
        self.offset_db.abs() <= PERSIST_TOLERANCE && (self.slope - 1.0).abs() <= PERSIST_TOLERANCE
    }

    pub fn apply(&self, dbm: f32) -> f32 {
        dbm * self.slope + self.offset_db
    }
}

/// Factory data of a sensor module, written once when the module is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorIdentity {
    pub sensor_type: String,
    pub serial: String,
    /// Detector slope in V/dB.
    pub base_slope: f32,
    /// Detector intercept in dBm.
    pub base_intercept: f32,
    /// Calibration frequencies in MHz, in the order the sensor lists them.
    pub frequencies: Vec<u16>,
}

/// Live calibration state of one detected sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCalibration {
    identity: SensorIdentity,
    // Holds only materialized entries; absent frequencies read as identity.
    corrections: BTreeMap<u16, FrequencyCorrection>,
    current_frequency: u16,
}

impl SensorCalibration {
    pub fn new(identity: SensorIdentity) -> Self {
        let current_frequency = identity.frequencies.first().copied().unwrap_or(0);
        SensorCalibration {
            identity,
            corrections: BTreeMap::new(),
            current_frequency,
        }
    }

    pub fn from_record(record: CalibrationRecord) -> Self {
        let mut calibration = Self::new(record.identity);
        for correction in record.corrections {
            if calibration.is_calibration_frequency(correction.frequency_mhz) {
                calibration
                    .corrections
                    .insert(correction.frequency_mhz, correction);
            }
        }
        calibration
    }

    /// Record holding the identity and every correction that differs from identity.
    pub fn to_record(&self) -> CalibrationRecord {
        CalibrationRecord {
            identity: self.identity.clone(),
            corrections: self
                .corrections
                .values()
                .filter(|c| !c.is_identity())
                .copied()
                .collect(),
        }
    }

    pub fn identity(&self) -> &SensorIdentity {
        &self.identity
    }

    pub fn sensor_type(&self) -> &str {
        &self.identity.sensor_type
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    pub fn frequencies(&self) -> &[u16] {
        &self.identity.frequencies
    }

    pub fn current_frequency(&self) -> u16 {
        self.current_frequency
    }

    fn is_calibration_frequency(&self, freq: u16) -> bool {
        self.identity.frequencies.contains(&freq)
    }

    /// Selects the operating frequency, snapping to the nearest calibration
    /// frequency, and returns the frequency actually selected. Equidistant
    /// candidates resolve to the one listed first. A sensor without
    /// frequencies always reports 0.
    pub fn set_frequency(&mut self, freq_mhz: u32) -> u16 {
        let Some(&selected) = self
            .identity
            .frequencies
            .iter()
            .min_by_key(|&&f| (i64::from(f) - i64::from(freq_mhz)).abs())
        else {
            return 0;
        };
        if u32::from(selected) != freq_mhz {
            debug!("Frequency {} MHz snapped to {} MHz", freq_mhz, selected);
        }
        self.current_frequency = selected;
        selected
    }

    /// Correction at `freq` (current frequency when `None`), identity if none is stored.
    pub fn correction(&self, freq: Option<u16>) -> FrequencyCorrection {
        let freq = freq.unwrap_or(self.current_frequency);
        self.corrections
            .get(&freq)
            .copied()
            .unwrap_or_else(|| FrequencyCorrection::identity(freq))
    }

    pub fn offset(&self, freq: Option<u16>) -> f32 {
        self.correction(freq).offset_db
    }

    pub fn slope(&self, freq: Option<u16>) -> f32 {
        self.correction(freq).slope
    }

    pub fn set_offset(&mut self, offset_db: f32, freq: Option<u16>) -> Result<()> {
        self.update_correction(freq, offset_db != 0.0, |c| c.offset_db = offset_db)
    }

    pub fn set_slope(&mut self, slope: f32, freq: Option<u16>) -> Result<()> {
        self.update_correction(freq, slope != 1.0, |c| c.slope = slope)
    }

    fn update_correction(
        &mut self,
        freq: Option<u16>,
        differs: bool,
        update: impl FnOnce(&mut FrequencyCorrection),
    ) -> Result<()> {
        let freq = freq.unwrap_or(self.current_frequency);
        if !self.is_calibration_frequency(freq) {
            return Err(CalibrationError::UnknownFrequency(freq));
        }
        match self.corrections.get_mut(&freq) {
            Some(entry) => update(entry),
            None if differs => {
                let mut entry = FrequencyCorrection::identity(freq);
                update(&mut entry);
                self.corrections.insert(freq, entry);
            }
            None => {}
        }
        Ok(())
    }

    /// Drops every correction, returning all frequencies to identity.
    pub fn clear_corrections(&mut self) {
        self.corrections.clear();
    }

    /// Converts a detector voltage to dBm at the current frequency.
    pub fn voltage_to_dbm(&self, voltage: f32) -> f32 {
        if self.identity.base_slope.abs() < MIN_BASE_SLOPE {
            return 0.0;
        }
        let raw = voltage / self.identity.base_slope + self.identity.base_intercept;
        self.correction(None).apply(raw)
    }
}

/// Calibration of both channels plus scoped access to their EEPROMs.
pub struct CalibrationManager {
    bus: Box<dyn SensorBus>,
    mux_ports: [u8; 2],
    sensors: [Option<SensorCalibration>; 2],
}

impl CalibrationManager {
    pub fn new(bus: Box<dyn SensorBus>, mux_ports: [u8; 2]) -> Self {
        info!("Initializing calibration manager with mux ports {:?}", mux_ports);
        CalibrationManager {
            bus,
            mux_ports,
            sensors: [None, None],
        }
    }

    fn index(channel: u8) -> Result<usize> {
        match channel {
            1..=2 => Ok(channel as usize - 1),
            _ => Err(CalibrationError::InvalidChannel(channel)),
        }
    }

    /// Runs `op` against the channel's EEPROM with its multiplexer port
    /// selected, releasing the multiplexer afterwards whatever the outcome.
    fn with_store<T>(
        &mut self,
        channel: u8,
        op: impl FnOnce(&mut dyn SensorBus) -> devices::Result<T>,
    ) -> Result<T> {
        let port = self.mux_ports[Self::index(channel)?];
        self.bus.select(port)?;
        let result = op(self.bus.as_mut());
        let released = self.bus.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Reads the channel's EEPROM and replaces its calibration.
    ///
    /// A silent store or an invalid record leaves the channel without a
    /// sensor. Any other bus failure is returned and the previous
    /// calibration is kept.
    pub fn detect_sensor(&mut self, channel: u8) -> Result<Option<&SensorCalibration>> {
        let index = Self::index(channel)?;
        let bytes = match self.with_store(channel, |bus| bus.read(0, RECORD_CAPACITY)) {
            Ok(bytes) => Some(bytes),
            Err(CalibrationError::Device(DeviceError::NotResponding)) => None,
            Err(e) => {
                warn!("Sensor detection on channel {} failed: {}", channel, e);
                return Err(e);
            }
        };

        self.sensors[index] = match bytes.map(|b| record::decode(&b)) {
            Some(Ok(record)) => {
                let calibration = SensorCalibration::from_record(record);
                info!(
                    "Channel {}: detected {} (S/N: {}), {} calibration frequencies",
                    channel,
                    calibration.sensor_type(),
                    calibration.serial(),
                    calibration.frequencies().len()
                );
                Some(calibration)
            }
            Some(Err(e)) => {
                info!("Channel {}: no valid sensor record ({})", channel, e);
                None
            }
            None => {
                info!("Channel {}: no sensor", channel);
                None
            }
        };
        Ok(self.sensors[index].as_ref())
    }

    pub fn sensor(&self, channel: u8) -> Option<&SensorCalibration> {
        Self::index(channel)
            .ok()
            .and_then(|i| self.sensors[i].as_ref())
    }

    pub fn sensor_mut(&mut self, channel: u8) -> Option<&mut SensorCalibration> {
        Self::index(channel)
            .ok()
            .and_then(|i| self.sensors[i].as_mut())
    }

    fn require_sensor(&mut self, channel: u8) -> Result<&mut SensorCalibration> {
        let index = Self::index(channel)?;
        self.sensors[index]
            .as_mut()
            .ok_or(CalibrationError::NoSensor(channel))
    }

    /// Forgets the channel's calibration after its sensor was unplugged.
    pub fn discard(&mut self, channel: u8) {
        if let Ok(index) = Self::index(channel) {
            if self.sensors[index].take().is_some() {
                info!("Channel {}: calibration discarded", channel);
            }
        }
    }

    pub fn set_frequency(&mut self, channel: u8, freq_mhz: u32) -> Result<u16> {
        Ok(self.require_sensor(channel)?.set_frequency(freq_mhz))
    }

    pub fn set_offset(&mut self, channel: u8, offset_db: f32, freq: Option<u16>) -> Result<()> {
        self.require_sensor(channel)?.set_offset(offset_db, freq)
    }

    pub fn set_slope(&mut self, channel: u8, slope: f32, freq: Option<u16>) -> Result<()> {
        self.require_sensor(channel)?.set_slope(slope, freq)
    }

    /// Writes the calibration of `channel`, or of every channel holding a
    /// sensor when `None`, to EEPROM. Each record is encoded in full before
    /// a single write so a failure never leaves a partial record behind.
    /// Every channel is attempted; the first failure is returned.
    pub fn save(&mut self, channel: Option<u8>) -> Result<()> {
        let channels = match channel {
            Some(ch) => {
                Self::index(ch)?;
                vec![ch]
            }
            None => CHANNELS.to_vec(),
        };

        let mut first_error = None;
        for ch in channels {
            let encoded = match self.sensor(ch) {
                Some(sensor) => record::encode(&sensor.to_record()),
                None => continue,
            };
            let result = encoded
                .map_err(CalibrationError::from)
                .and_then(|bytes| self.with_store(ch, |bus| bus.write(0, &bytes)));
            match result {
                Ok(()) => info!("Channel {}: calibration saved", ch),
                Err(e) => {
                    warn!("Channel {}: saving calibration failed: {}", ch, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns every correction of the channel to identity and persists that.
    pub fn restore_defaults(&mut self, channel: u8) -> Result<()> {
        self.require_sensor(channel)?.clear_corrections();
        info!("Channel {}: calibration restored to defaults", channel);
        self.save(Some(channel))
    }

    /// Formats a blank sensor module: erases its EEPROM, writes the factory
    /// identity with no corrections, and loads it.
    pub fn provision(&mut self, channel: u8, identity: SensorIdentity) -> Result<()> {
        let bytes = record::encode(&CalibrationRecord {
            identity,
            corrections: Vec::new(),
        })?;
        let mut image = vec![0xFF; RECORD_CAPACITY];
        image[..bytes.len()].copy_from_slice(&bytes);
        self.with_store(channel, |bus| bus.write(0, &image))?;
        info!("Channel {}: sensor module provisioned", channel);
        self.detect_sensor(channel)?;
        Ok(())
    }

    /// Fills the channel's EEPROM with `0xFF` and forgets its calibration.
    pub fn erase(&mut self, channel: u8) -> Result<()> {
        self.with_store(channel, |bus| bus.write(0, &[0xFF; RECORD_CAPACITY]))?;
        self.discard(channel);
        Ok(())
    }
}
