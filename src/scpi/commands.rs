//! Command table of the RF power meter.

use tracing::info;

use super::parser::{ErrorQueue, Registry, ScpiCommand, ScpiEngine};
use super::{NOT_A_NUMBER, Result, ScpiError};
use crate::calibration::CalibrationError;
use crate::channel::{MeasurementChannel, PowerUnit};
use crate::config::{IdentityConfig, MeterConfig, NetworkConfig};
use crate::meter::{MeterError, PowerMeter};

impl From<CalibrationError> for ScpiError {
    fn from(e: CalibrationError) -> Self {
        match e {
            CalibrationError::InvalidChannel(ch) => ScpiError::InvalidChannel(ch),
            CalibrationError::NoSensor(_) => ScpiError::NoSensor,
            other => ScpiError::Execution(other.to_string()),
        }
    }
}

impl From<MeterError> for ScpiError {
    fn from(e: MeterError) -> Self {
        match e {
            MeterError::InvalidChannel(ch) => ScpiError::InvalidChannel(ch),
            MeterError::Calibration(e) => e.into(),
            other => ScpiError::Execution(other.to_string()),
        }
    }
}

/// Everything the command handlers read and modify.
pub struct InstrumentState {
    pub meter: PowerMeter,
    identity: IdentityConfig,
    network: NetworkConfig,
    averaging_default: u32,
    opc: bool,
}

/// A power meter behind its SCPI interface. Every connection feeds its
/// lines through [`Instrument::handle`]; commands run to completion one at a
/// time, so the last writer wins.
pub struct Instrument {
    engine: ScpiEngine<InstrumentState>,
    state: InstrumentState,
}

impl Instrument {
    pub fn new(meter: PowerMeter, config: &MeterConfig) -> Self {
        let registry = registry();
        info!("SCPI handler initialized with {} commands", registry.len());
        Instrument {
            engine: ScpiEngine::new(registry),
            state: InstrumentState {
                meter,
                identity: config.identity.clone(),
                network: config.network.clone(),
                averaging_default: config.averaging_default,
                opc: true,
            },
        }
    }

    /// Processes one received line; returns the newline-terminated reply, if any.
    pub fn handle(&mut self, line: &str) -> Option<String> {
        self.engine.process_line(&mut self.state, line)
    }

    pub fn meter(&self) -> &PowerMeter {
        &self.state.meter
    }

    pub fn meter_mut(&mut self) -> &mut PowerMeter {
        &mut self.state.meter
    }

    pub fn errors(&self) -> &ErrorQueue {
        self.engine.errors()
    }
}

pub fn registry() -> Registry<InstrumentState> {
    Registry::new()
        // IEEE 488.2 common commands
        .register("*IDN", no_op, query_idn)
        .register("*RST", cmd_rst, cmd_rst)
        .register("*OPC", cmd_opc, query_opc)
        .register("*CLS", cmd_cls, cmd_cls)
        // Measurement
        .register("MEASure:POWer", cmd_measure, query_power)
        .register("MEASure:POWer:UNIT", cmd_unit, query_unit)
        .register("MEASure:POWer:AVERage", cmd_average, query_average)
        .register("MEASure:VOLTage", cmd_measure, query_voltage)
        // Frequency and attenuator
        .register("SENSe:FREQuency", cmd_frequency, query_frequency)
        .register("SENSe:FREQuency:CATalog", query_catalog, query_catalog)
        .register("SENSe:ATTenuation", cmd_attenuation, query_attenuation)
        // Calibration
        .register("CALibrate:POWer:OFFSet", cmd_cal_offset, query_cal_offset)
        .register("CALibrate:POWer:SLOPe", cmd_cal_slope, query_cal_slope)
        .register("CALibrate:POWer:SAVE", cmd_cal_save, cmd_cal_save)
        .register("CALibrate:POWer:RESTore", cmd_cal_restore, cmd_cal_restore)
        .register("CALibrate:SENSor:TYPE", no_op, query_sensor_type)
        // System
        .register("SYSTem:ERRor", query_error, query_error)
        .register("SYSTem:VERSion", query_version, query_version)
        .register("SYSTem:NET:IP", query_ip, query_ip)
        .register("SYSTem:NET:MAC", query_mac, query_mac)
}

type Response = Result<Option<String>>;

/// Channel addressed by the command suffix, channel 1 when there is none.
fn channel_of(cmd: &ScpiCommand) -> Result<u8> {
    match cmd.channel.unwrap_or(1) {
        ch @ 1..=2 => Ok(ch),
        ch => Err(ScpiError::InvalidChannel(ch)),
    }
}

fn channel_mut<'a>(s: &'a mut InstrumentState, cmd: &ScpiCommand) -> Result<&'a mut MeasurementChannel> {
    Ok(s.meter.channel_mut(channel_of(cmd)?)?)
}

fn no_op(_: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(None)
}

// === IEEE 488.2 common commands ===

fn query_idn(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    let id = &s.identity;
    Ok(Some(format!(
        "{},{},{},{}",
        id.manufacturer, id.model, id.serial, id.version
    )))
}

fn cmd_rst(s: &mut InstrumentState, errors: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    info!("*RST: resetting instrument");
    s.meter.reset();
    errors.clear();
    Ok(None)
}

fn cmd_opc(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    s.opc = true;
    Ok(None)
}

fn query_opc(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(Some(if s.opc { "1" } else { "0" }.to_string()))
}

fn cmd_cls(_: &mut InstrumentState, errors: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    errors.clear();
    Ok(None)
}

// === Measurement ===

fn cmd_measure(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    s.meter.sample(channel_of(cmd)?)?;
    Ok(None)
}

fn query_power(s: &mut InstrumentState, errors: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    if s.meter.sensor(ch).is_none() {
        errors.push_error(&ScpiError::NoSensor);
        return Ok(Some(NOT_A_NUMBER.to_string()));
    }
    let (power, _) = s.meter.channel(ch)?.get_power(None, true);
    Ok(Some(match power {
        Some(value) => format!("{value:.3}"),
        None => NOT_A_NUMBER.to_string(),
    }))
}

fn query_voltage(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let channel = s.meter.channel(channel_of(cmd)?)?;
    Ok(Some(format!("{:.6}", channel.last_voltage())))
}

fn cmd_unit(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let text = cmd.param_str().unwrap_or(PowerUnit::DBm.mnemonic());
    let unit: PowerUnit = text
        .parse()
        .map_err(|_| ScpiError::BadUnit(text.to_string()))?;
    channel_mut(s, cmd)?.set_unit(unit);
    Ok(None)
}

fn query_unit(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    Ok(Some(s.meter.channel(channel_of(cmd)?)?.unit().mnemonic().to_string()))
}

fn cmd_average(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let count = cmd
        .param_i64()?
        .unwrap_or(i64::from(s.averaging_default));
    channel_mut(s, cmd)?.set_averaging(count);
    Ok(None)
}

fn query_average(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    Ok(Some(s.meter.channel(channel_of(cmd)?)?.averaging().to_string()))
}

// === Frequency ===

fn cmd_frequency(s: &mut InstrumentState, errors: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let requested = cmd
        .param_f64()?
        .ok_or(ScpiError::MissingParameter("frequency"))?;
    if requested < 0.0 {
        return Err(ScpiError::InvalidParameter(requested.to_string()));
    }
    let requested = requested.trunc() as u32;
    let actual = s.meter.set_frequency(ch, requested)?;
    if u32::from(actual) != requested {
        errors.push(-100, format!("Frequency snapped to {actual}"));
    }
    Ok(None)
}

fn query_frequency(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let freq = s.meter.sensor(ch).map_or(0, |sensor| sensor.current_frequency());
    Ok(Some(freq.to_string()))
}

fn query_catalog(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let catalog = s
        .meter
        .sensor(ch)
        .map(|sensor| {
            sensor
                .frequencies()
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    Ok(Some(catalog))
}

// === Attenuator ===

fn cmd_attenuation(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let atten = cmd.param_f64()?.unwrap_or(0.0);
    channel_mut(s, cmd)?.set_attenuator(atten as f32);
    Ok(None)
}

fn query_attenuation(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    Ok(Some(format!("{:.1}", s.meter.channel(channel_of(cmd)?)?.attenuator())))
}

// === Calibration ===

fn cmd_cal_offset(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let offset = cmd.param_f64()?.unwrap_or(0.0) as f32;
    s.meter.calibration_mut().set_offset(ch, offset, None)?;
    Ok(None)
}

fn query_cal_offset(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let offset = s.meter.sensor(ch).map_or(0.0, |sensor| sensor.offset(None));
    Ok(Some(format!("{offset:.3}")))
}

fn cmd_cal_slope(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let slope = cmd.param_f64()?.unwrap_or(1.0) as f32;
    s.meter.calibration_mut().set_slope(ch, slope, None)?;
    Ok(None)
}

fn query_cal_slope(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let slope = s.meter.sensor(ch).map_or(1.0, |sensor| sensor.slope(None));
    Ok(Some(format!("{slope:.6}")))
}

fn persist_error(e: CalibrationError) -> ScpiError {
    match e {
        CalibrationError::Device(_) | CalibrationError::Record(_) => {
            ScpiError::PersistFailure(e.to_string())
        }
        other => other.into(),
    }
}

/// Without a channel suffix every channel holding a sensor is saved.
fn cmd_cal_save(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let channel = cmd.channel.map(|_| channel_of(cmd)).transpose()?;
    s.meter.calibration_mut().save(channel).map_err(persist_error)?;
    Ok(None)
}

fn cmd_cal_restore(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    s.meter
        .calibration_mut()
        .restore_defaults(ch)
        .map_err(persist_error)?;
    s.meter.channel_mut(ch)?.clear_averaging();
    Ok(None)
}

fn query_sensor_type(s: &mut InstrumentState, _: &mut ErrorQueue, cmd: &ScpiCommand) -> Response {
    let ch = channel_of(cmd)?;
    let sensor_type = s.meter.sensor(ch).map_or("NONE", |sensor| sensor.sensor_type());
    Ok(Some(sensor_type.to_string()))
}

// === System ===

fn query_error(_: &mut InstrumentState, errors: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(Some(errors.pop_formatted()))
}

fn query_version(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(Some(s.identity.scpi_version.clone()))
}

fn query_ip(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(Some(
        s.network
            .ip
            .map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string()),
    ))
}

fn query_mac(s: &mut InstrumentState, _: &mut ErrorQueue, _: &ScpiCommand) -> Response {
    Ok(Some(
        s.network
            .mac
            .clone()
            .unwrap_or_else(|| "00:00:00:00:00:00".to_string()),
    ))
}
