//! The dual-channel meter: both measurement channels, their calibration and
//! the ADC feeding them.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::{
    CHANNELS, CalibrationError, CalibrationManager, SensorCalibration, SensorIdentity,
};
use crate::channel::MeasurementChannel;
use crate::devices::{DeviceError, VoltageSource};

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    #[error("ADC error: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

pub type Result<T> = std::result::Result<T, MeterError>;

pub struct PowerMeter {
    channels: [MeasurementChannel; 2],
    calibration: CalibrationManager,
    adc: Box<dyn VoltageSource>,
    averaging_default: u32,
}

impl PowerMeter {
    pub fn new(
        calibration: CalibrationManager,
        adc: Box<dyn VoltageSource>,
        averaging_default: u32,
    ) -> Self {
        info!("Initializing power meter, default averaging {}", averaging_default);
        PowerMeter {
            channels: [
                MeasurementChannel::new(1, averaging_default),
                MeasurementChannel::new(2, averaging_default),
            ],
            calibration,
            adc,
            averaging_default,
        }
    }

    fn index(channel: u8) -> Result<usize> {
        match channel {
            1..=2 => Ok(channel as usize - 1),
            _ => Err(MeterError::InvalidChannel(channel)),
        }
    }

    pub fn channel(&self, channel: u8) -> Result<&MeasurementChannel> {
        Ok(&self.channels[Self::index(channel)?])
    }

    pub fn channel_mut(&mut self, channel: u8) -> Result<&mut MeasurementChannel> {
        Ok(&mut self.channels[Self::index(channel)?])
    }

    pub fn sensor(&self, channel: u8) -> Option<&SensorCalibration> {
        self.calibration.sensor(channel)
    }

    pub fn calibration(&self) -> &CalibrationManager {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut CalibrationManager {
        &mut self.calibration
    }

    /// Takes one ADC sample on `channel` and updates its reading.
    pub fn sample(&mut self, channel: u8) -> Result<Option<f32>> {
        let index = Self::index(channel)?;
        let voltage = self.adc.read_voltage(channel)?;
        let calibration = self.calibration.sensor(channel);
        Ok(self.channels[index].read_power(voltage, calibration))
    }

    /// Samples every channel; a failing ADC is logged and skipped.
    pub fn sample_all(&mut self) {
        for channel in CHANNELS {
            if let Err(e) = self.sample(channel) {
                warn!("Channel {}: sampling failed: {}", channel, e);
            }
        }
    }

    /// Boot-time detection of both sensors.
    pub fn detect_sensors(&mut self) -> Vec<(u8, Option<String>)> {
        CHANNELS
            .iter()
            .map(|&channel| match self.sensor_inserted(channel) {
                Ok(sensor_type) => (channel, sensor_type),
                Err(e) => {
                    warn!("Channel {}: detection failed: {}", channel, e);
                    (channel, None)
                }
            })
            .collect()
    }

    /// Re-reads the sensor record of `channel` and restarts averaging.
    /// Returns the detected sensor type.
    pub fn sensor_inserted(&mut self, channel: u8) -> Result<Option<String>> {
        let index = Self::index(channel)?;
        let sensor_type = self
            .calibration
            .detect_sensor(channel)?
            .map(|s| s.sensor_type().to_string());
        self.channels[index].clear_averaging();
        Ok(sensor_type)
    }

    /// Forgets the calibration and the reading of an unplugged sensor.
    pub fn sensor_removed(&mut self, channel: u8) -> Result<()> {
        let index = Self::index(channel)?;
        self.calibration.discard(channel);
        self.channels[index].clear_reading();
        Ok(())
    }

    /// Formats the sensor module of `channel` with `identity` and loads it.
    /// The previous reading belonged to another identity and is dropped.
    pub fn provision(&mut self, channel: u8, identity: SensorIdentity) -> Result<()> {
        let index = Self::index(channel)?;
        self.calibration.provision(channel, identity)?;
        self.channels[index].clear_reading();
        Ok(())
    }

    /// Erases the sensor store of `channel`, leaving the channel without a sensor.
    pub fn erase(&mut self, channel: u8) -> Result<()> {
        let index = Self::index(channel)?;
        self.calibration.erase(channel)?;
        self.channels[index].clear_reading();
        Ok(())
    }

    /// Selects the operating frequency of `channel`, returning the snapped value.
    pub fn set_frequency(&mut self, channel: u8, freq_mhz: u32) -> Result<u16> {
        Self::index(channel)?;
        Ok(self.calibration.set_frequency(channel, freq_mhz)?)
    }

    /// Power-on settings for both channels: default averaging and unit, no
    /// attenuator, each sensor on its first calibration frequency.
    pub fn reset(&mut self) {
        debug!("Resetting power meter settings");
        for channel in CHANNELS {
            let index = channel as usize - 1;
            self.channels[index].reset(self.averaging_default);
            if let Some(sensor) = self.calibration.sensor_mut(channel) {
                if let Some(&first) = sensor.frequencies().first() {
                    sensor.set_frequency(u32::from(first));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::SensorIdentity;
    use crate::calibration::record::{self, CalibrationRecord};
    use crate::devices::SimulatedFrontEnd;

    fn sensor_image() -> Vec<u8> {
        record::encode(&CalibrationRecord {
            identity: SensorIdentity {
                sensor_type: "AD8307".into(),
                serial: "X".into(),
                base_slope: 0.025,
                base_intercept: -84.0,
                frequencies: vec![100, 500, 1000],
            },
            corrections: vec![],
        })
        .unwrap()
    }

    fn meter(fe: &SimulatedFrontEnd) -> PowerMeter {
        let cal = CalibrationManager::new(Box::new(fe.clone()), [0, 1]);
        PowerMeter::new(cal, Box::new(fe.clone()), 16)
    }

    #[test]
    fn samples_through_calibration() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(1, &sensor_image());
        fe.set_voltage(1, 1.5);
        let mut m = meter(&fe);
        m.detect_sensors();
        let dbm = m.sample(1).unwrap().unwrap();
        assert!((dbm - -24.0).abs() < 1e-4);
        assert_eq!(m.sample(2).unwrap(), None);
        assert!(matches!(m.sample(3), Err(MeterError::InvalidChannel(3))));
    }

    #[test]
    fn removal_clears_reading() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(2, &sensor_image());
        fe.set_voltage(2, 1.0);
        let mut m = meter(&fe);
        m.detect_sensors();
        m.sample(2).unwrap();
        assert!(m.channel(2).unwrap().last_power_dbm().is_some());
        m.sensor_removed(2).unwrap();
        assert!(m.sensor(2).is_none());
        assert!(m.channel(2).unwrap().last_power_dbm().is_none());
        assert_eq!(m.channel(2).unwrap().buffered_samples(), 0);
    }

    #[test]
    fn provision_and_erase_drop_stale_readings() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(1, &sensor_image());
        fe.set_voltage(1, 1.5);
        let mut m = meter(&fe);
        m.detect_sensors();
        for _ in 0..4 {
            m.sample(1).unwrap();
        }
        assert_eq!(m.channel(1).unwrap().buffered_samples(), 4);

        let identity = SensorIdentity {
            sensor_type: "NEW".into(),
            serial: "2".into(),
            base_slope: 0.05,
            base_intercept: -60.0,
            frequencies: vec![868],
        };
        m.provision(1, identity).unwrap();
        assert_eq!(m.sensor(1).unwrap().sensor_type(), "NEW");
        assert_eq!(m.channel(1).unwrap().buffered_samples(), 0);
        assert!(m.channel(1).unwrap().last_power_dbm().is_none());

        m.sample(1).unwrap();
        assert!(m.channel(1).unwrap().last_power_dbm().is_some());
        m.erase(1).unwrap();
        assert!(m.sensor(1).is_none());
        assert!(m.channel(1).unwrap().last_power_dbm().is_none());
        assert_eq!(m.channel(1).unwrap().buffered_samples(), 0);
        assert!(matches!(m.erase(3), Err(MeterError::InvalidChannel(3))));
    }

    #[test]
    fn reset_returns_to_first_frequency() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(1, &sensor_image());
        let mut m = meter(&fe);
        m.detect_sensors();
        assert_eq!(m.set_frequency(1, 900).unwrap(), 1000);
        m.channel_mut(1).unwrap().set_attenuator(10.0);
        m.reset();
        assert_eq!(m.sensor(1).unwrap().current_frequency(), 100);
        assert_eq!(m.channel(1).unwrap().attenuator(), 0.0);
    }
}
