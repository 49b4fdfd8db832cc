use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::{DeviceError, PresenceSource, Result, SensorBus, VoltageSource};
use crate::hotswap::PresenceLatch;

/// AT24C02 capacity.
pub const EEPROM_SIZE: usize = 256;

const CHANNELS: usize = 2;
const MUX_PORTS: u8 = 8;

#[derive(Debug, Clone)]
struct SensorSlot {
    eeprom: Vec<u8>,
    voltage: f32,
}

#[derive(Debug)]
struct FrontEndState {
    mux_ports: [u8; CHANNELS],
    slots: [Option<SensorSlot>; CHANNELS],
    presence: [bool; CHANNELS],
    selected: Option<u8>,
    fail_writes: bool,
    bus_faulted: bool,
    interrupt: Option<PresenceLatch>,
}

/// In-memory stand-in for the analog front end: two sensor sockets, each with
/// an EEPROM behind a shared multiplexer, an ADC and a presence pin.
///
/// Cloning yields another handle onto the same hardware, so a test or the
/// simulation loop can plug sensors in while the meter owns its own handle.
#[derive(Debug, Clone)]
pub struct SimulatedFrontEnd {
    state: Arc<Mutex<FrontEndState>>,
}

impl SimulatedFrontEnd {
    pub fn new(mux_ports: [u8; CHANNELS]) -> Self {
        info!("Initializing simulated front end with mux ports {:?}", mux_ports);
        SimulatedFrontEnd {
            state: Arc::new(Mutex::new(FrontEndState {
                mux_ports,
                slots: [None, None],
                presence: [false; CHANNELS],
                selected: None,
                fail_writes: false,
                bus_faulted: false,
                interrupt: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontEndState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugs a sensor whose EEPROM holds `image` (padded with erased bytes)
    /// and raises its presence pin.
    pub fn insert_sensor(&self, channel: u8, image: &[u8]) {
        let mut eeprom = vec![0xFF; EEPROM_SIZE];
        let len = image.len().min(EEPROM_SIZE);
        eeprom[..len].copy_from_slice(&image[..len]);
        let mut state = self.lock();
        if let Some(index) = slot_index(channel) {
            info!("Sensor inserted on channel {}", channel);
            state.slots[index] = Some(SensorSlot { eeprom, voltage: 0.0 });
            state.drive_presence(index, true);
        }
    }

    /// Plugs a sensor with a blank (erased) EEPROM.
    pub fn insert_blank_sensor(&self, channel: u8) {
        self.insert_sensor(channel, &[]);
    }

    pub fn remove_sensor(&self, channel: u8) {
        let mut state = self.lock();
        if let Some(index) = slot_index(channel) {
            info!("Sensor removed from channel {}", channel);
            state.slots[index] = None;
            state.drive_presence(index, false);
        }
    }

    /// Drives the presence pin without touching the socket contents.
    pub fn set_presence(&self, channel: u8, present: bool) {
        if let Some(index) = slot_index(channel) {
            self.lock().drive_presence(index, present);
        }
    }

    pub fn set_voltage(&self, channel: u8, voltage: f32) {
        let mut state = self.lock();
        if let Some(slot) = slot_index(channel).and_then(|i| state.slots[i].as_mut()) {
            slot.voltage = voltage;
        }
    }

    /// Wires the presence pins' edge interrupt to `latch`.
    pub fn attach_presence_interrupt(&self, latch: PresenceLatch) {
        self.lock().interrupt = Some(latch);
    }

    /// Makes every subsequent EEPROM write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Makes every subsequent bus transaction fail with an I/O error.
    pub fn fault_bus(&self, faulted: bool) {
        self.lock().bus_faulted = faulted;
    }

    /// Snapshot of a channel's EEPROM contents.
    pub fn eeprom(&self, channel: u8) -> Option<Vec<u8>> {
        let state = self.lock();
        slot_index(channel).and_then(|i| state.slots[i].as_ref().map(|s| s.eeprom.clone()))
    }

    pub fn selected_port(&self) -> Option<u8> {
        self.lock().selected
    }
}

fn slot_index(channel: u8) -> Option<usize> {
    match channel {
        1..=2 => Some(channel as usize - 1),
        _ => None,
    }
}

fn bus_fault() -> DeviceError {
    DeviceError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        "I2C bus fault",
    ))
}

impl FrontEndState {
    fn drive_presence(&mut self, index: usize, level: bool) {
        if self.presence[index] == level {
            return;
        }
        self.presence[index] = level;
        if let Some(latch) = &self.interrupt {
            latch.notify(index as u8 + 1);
        }
    }

    fn selected_slot(&mut self) -> Result<&mut SensorSlot> {
        if self.bus_faulted {
            return Err(bus_fault());
        }
        let port = self.selected.ok_or(DeviceError::NotSelected)?;
        let index = self
            .mux_ports
            .iter()
            .position(|&p| p == port)
            .ok_or(DeviceError::NotResponding)?;
        self.slots[index].as_mut().ok_or(DeviceError::NotResponding)
    }
}

impl SensorBus for SimulatedFrontEnd {
    fn select(&mut self, port: u8) -> Result<()> {
        if port >= MUX_PORTS {
            return Err(DeviceError::NoSuchPort(port));
        }
        let mut state = self.lock();
        if state.bus_faulted {
            return Err(bus_fault());
        }
        debug!("Selecting multiplexer port {}", port);
        state.selected = Some(port);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        debug!("Releasing multiplexer");
        self.lock().selected = None;
        Ok(())
    }

    fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let slot = state.selected_slot()?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= slot.eeprom.len())
            .ok_or(DeviceError::OutOfRange { offset, len })?;
        Ok(slot.eeprom[offset..end].to_vec())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let fail = state.fail_writes;
        let slot = state.selected_slot()?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= slot.eeprom.len())
            .ok_or(DeviceError::OutOfRange { offset, len: data.len() })?;
        if fail {
            warn!("Simulated EEPROM write failure at offset {}", offset);
            return Err(DeviceError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "EEPROM write not acknowledged",
            )));
        }
        slot.eeprom[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl VoltageSource for SimulatedFrontEnd {
    fn read_voltage(&mut self, channel: u8) -> Result<f32> {
        let state = self.lock();
        let index = slot_index(channel).ok_or(DeviceError::NotResponding)?;
        // An open socket reads as 0 V on the differential input.
        Ok(state.slots[index].as_ref().map_or(0.0, |s| s.voltage))
    }
}

impl PresenceSource for SimulatedFrontEnd {
    fn is_present(&self, channel: u8) -> bool {
        slot_index(channel).is_some_and(|i| self.lock().presence[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_require_a_selected_port() {
        let mut fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(1, b"RFPM");
        assert!(matches!(fe.read(0, 4), Err(DeviceError::NotSelected)));
        fe.select(0).unwrap();
        assert_eq!(fe.read(0, 4).unwrap(), b"RFPM");
    }

    #[test]
    fn empty_socket_does_not_respond() {
        let mut fe = SimulatedFrontEnd::new([0, 1]);
        fe.select(1).unwrap();
        assert!(matches!(fe.read(0, 1), Err(DeviceError::NotResponding)));
    }

    #[test]
    fn failed_write_leaves_contents_untouched() {
        let mut fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_sensor(2, &[1, 2, 3]);
        fe.fail_writes(true);
        fe.select(1).unwrap();
        assert!(fe.write(0, &[9, 9, 9]).is_err());
        assert_eq!(&fe.eeprom(2).unwrap()[..3], &[1, 2, 3]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let mut fe = SimulatedFrontEnd::new([0, 1]);
        fe.insert_blank_sensor(1);
        fe.select(0).unwrap();
        assert!(matches!(
            fe.read(250, 10),
            Err(DeviceError::OutOfRange { offset: 250, len: 10 })
        ));
    }

    #[test]
    fn presence_follows_socket() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        assert!(!fe.is_present(1));
        fe.insert_blank_sensor(1);
        assert!(fe.is_present(1));
        fe.remove_sensor(1);
        assert!(!fe.is_present(1));
    }

    #[test]
    fn presence_edges_raise_the_interrupt() {
        let fe = SimulatedFrontEnd::new([0, 1]);
        let latch = PresenceLatch::default();
        fe.attach_presence_interrupt(latch.clone());
        fe.set_voltage(2, 1.0);
        assert!(!latch.is_pending(2));
        fe.insert_blank_sensor(2);
        assert!(latch.is_pending(2));
        assert!(!latch.is_pending(1));
    }
}
