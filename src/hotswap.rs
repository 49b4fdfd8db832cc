//! Sensor hot-swap handling.
//!
//! Presence-pin edges arrive in interrupt context, where no bus traffic is
//! allowed. The interrupt side only holds a [`PresenceLatch`], which can do
//! nothing but raise a per-channel "re-check me" flag. [`HotSwapMonitor::poll`]
//! runs from the cooperative loop, drains the flags, reads the pin level and
//! reloads or drops the calibration of that channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::calibration::CHANNELS;
use crate::devices::PresenceSource;
use crate::meter::PowerMeter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    #[default]
    Absent,
    Present,
}

/// Interrupt-side handle: one pending flag per channel.
#[derive(Debug, Clone, Default)]
pub struct PresenceLatch {
    pending: Arc<[AtomicBool; 2]>,
}

impl PresenceLatch {
    /// Marks `channel` for re-evaluation. Safe to call from an interrupt
    /// handler: a single atomic store, no allocation, no I/O.
    pub fn notify(&self, channel: u8) {
        if let Some(flag) = channel
            .checked_sub(1)
            .and_then(|i| self.pending.get(i as usize))
        {
            flag.store(true, Ordering::Release);
        }
    }

    fn take(&self, index: usize) -> bool {
        self.pending[index].swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self, channel: u8) -> bool {
        channel
            .checked_sub(1)
            .and_then(|i| self.pending.get(i as usize))
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HotSwapEvent {
    Inserted {
        channel: u8,
        sensor_type: Option<String>,
    },
    Removed {
        channel: u8,
    },
    DetectionFailed {
        channel: u8,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct HotSwapMonitor {
    latch: PresenceLatch,
    states: [Presence; 2],
}

impl HotSwapMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to hand to the presence-pin interrupt.
    pub fn latch(&self) -> PresenceLatch {
        self.latch.clone()
    }

    pub fn state(&self, channel: u8) -> Presence {
        match channel {
            1..=2 => self.states[channel as usize - 1],
            _ => Presence::Absent,
        }
    }

    /// Records the pin levels seen at boot, before any edge arrives.
    pub fn prime(&mut self, pins: &dyn PresenceSource) {
        for channel in CHANNELS {
            self.states[channel as usize - 1] = level(pins, channel);
        }
    }

    /// Re-evaluates every channel flagged since the last poll from its
    /// current pin level. Any number of edges before a poll collapse into
    /// one evaluation of the final level. A channel whose detection failed
    /// stays flagged for the next poll.
    pub fn poll(&mut self, meter: &mut PowerMeter, pins: &dyn PresenceSource) -> Vec<HotSwapEvent> {
        let mut events = Vec::new();
        for channel in CHANNELS {
            let index = channel as usize - 1;
            if !self.latch.take(index) {
                continue;
            }

            let presence = level(pins, channel);
            let previous = std::mem::replace(&mut self.states[index], presence);
            info!("Channel {}: presence {:?} -> {:?}", channel, previous, presence);

            let event = match presence {
                Presence::Present => match meter.sensor_inserted(channel) {
                    Ok(sensor_type) => HotSwapEvent::Inserted {
                        channel,
                        sensor_type,
                    },
                    Err(e) => {
                        warn!("Channel {}: sensor detection failed, retrying: {}", channel, e);
                        self.latch.notify(channel);
                        HotSwapEvent::DetectionFailed {
                            channel,
                            reason: e.to_string(),
                        }
                    }
                },
                Presence::Absent => {
                    if let Err(e) = meter.sensor_removed(channel) {
                        warn!("Channel {}: sensor removal failed: {}", channel, e);
                    }
                    HotSwapEvent::Removed { channel }
                }
            };
            events.push(event);
        }
        events
    }
}

fn level(pins: &dyn PresenceSource, channel: u8) -> Presence {
    if pins.is_present(channel) {
        Presence::Present
    } else {
        Presence::Absent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::record::{self, CalibrationRecord};
    use crate::calibration::{CalibrationManager, SensorIdentity};
    use crate::devices::SimulatedFrontEnd;

    fn image() -> Vec<u8> {
        record::encode(&CalibrationRecord {
            identity: SensorIdentity {
                sensor_type: "LTC5582".into(),
                serial: "77".into(),
                base_slope: 0.031,
                base_intercept: -70.0,
                frequencies: vec![10, 2400],
            },
            corrections: vec![],
        })
        .unwrap()
    }

    fn setup() -> (SimulatedFrontEnd, PowerMeter, HotSwapMonitor) {
        let fe = SimulatedFrontEnd::new([0, 1]);
        let cal = CalibrationManager::new(Box::new(fe.clone()), [0, 1]);
        let meter = PowerMeter::new(cal, Box::new(fe.clone()), 16);
        (fe, meter, HotSwapMonitor::new())
    }

    #[test]
    fn insertion_is_deferred_until_poll() {
        let (fe, mut meter, mut monitor) = setup();
        let irq = monitor.latch();

        fe.insert_sensor(1, &image());
        irq.notify(1);
        assert!(meter.sensor(1).is_none());
        assert!(irq.is_pending(1));

        let events = monitor.poll(&mut meter, &fe);
        assert_eq!(
            events,
            vec![HotSwapEvent::Inserted {
                channel: 1,
                sensor_type: Some("LTC5582".into())
            }]
        );
        assert_eq!(monitor.state(1), Presence::Present);
        assert_eq!(meter.sensor(1).unwrap().sensor_type(), "LTC5582");
        assert!(!irq.is_pending(1));
    }

    #[test]
    fn edges_collapse_to_final_level() {
        let (fe, mut meter, mut monitor) = setup();
        let irq = monitor.latch();

        fe.insert_sensor(2, &image());
        irq.notify(2);
        fe.remove_sensor(2);
        irq.notify(2);

        let events = monitor.poll(&mut meter, &fe);
        assert_eq!(events, vec![HotSwapEvent::Removed { channel: 2 }]);
        assert_eq!(monitor.state(2), Presence::Absent);
        assert!(meter.sensor(2).is_none());
    }

    #[test]
    fn removal_clears_channel_state() {
        let (fe, mut meter, mut monitor) = setup();
        fe.insert_sensor(1, &image());
        fe.set_voltage(1, 1.0);
        monitor.prime(&fe);
        meter.detect_sensors();
        meter.sample(1).unwrap();

        fe.remove_sensor(1);
        monitor.latch().notify(1);
        monitor.poll(&mut meter, &fe);
        assert!(meter.sensor(1).is_none());
        assert_eq!(meter.channel(1).unwrap().last_power_dbm(), None);
    }

    #[test]
    fn quiet_channels_are_left_alone() {
        let (fe, mut meter, mut monitor) = setup();
        fe.insert_sensor(1, &image());
        assert!(monitor.poll(&mut meter, &fe).is_empty());
        assert!(meter.sensor(1).is_none());
        monitor.latch().notify(0);
        monitor.latch().notify(9);
        assert!(monitor.poll(&mut meter, &fe).is_empty());
    }

    #[test]
    fn failed_detection_is_retried_on_next_poll() {
        let (fe, mut meter, mut monitor) = setup();
        fe.insert_sensor(1, &image());
        fe.fault_bus(true);
        monitor.latch().notify(1);
        let events = monitor.poll(&mut meter, &fe);
        assert!(matches!(
            events.as_slice(),
            [HotSwapEvent::DetectionFailed { channel: 1, .. }]
        ));
        assert!(monitor.latch().is_pending(1));

        fe.fault_bus(false);
        let events = monitor.poll(&mut meter, &fe);
        assert_eq!(
            events,
            vec![HotSwapEvent::Inserted {
                channel: 1,
                sensor_type: Some("LTC5582".into())
            }]
        );
        assert!(!monitor.latch().is_pending(1));
        assert_eq!(meter.sensor(1).unwrap().sensor_type(), "LTC5582");
    }
}
