use rf_power_meter::calibration::record::{self, CalibrationRecord};
use rf_power_meter::calibration::{CalibrationManager, FrequencyCorrection, SensorIdentity};
use rf_power_meter::config::MeterConfig;
use rf_power_meter::devices::SimulatedFrontEnd;
use rf_power_meter::hotswap::{HotSwapEvent, HotSwapMonitor};
use rf_power_meter::meter::PowerMeter;
use rf_power_meter::scpi::Instrument;

fn sensor_image() -> Vec<u8> {
    record::encode(&CalibrationRecord {
        identity: SensorIdentity {
            sensor_type: "AD8318".into(),
            serial: "SN0042".into(),
            base_slope: 0.5,
            base_intercept: -30.0,
            frequencies: vec![100, 500, 1000],
        },
        corrections: vec![],
    })
    .unwrap()
}

fn bench() -> (SimulatedFrontEnd, Instrument) {
    let fe = SimulatedFrontEnd::new([0, 1]);
    fe.insert_sensor(1, &sensor_image());
    fe.set_voltage(1, 10.0);

    let cal = CalibrationManager::new(Box::new(fe.clone()), [0, 1]);
    let mut meter = PowerMeter::new(cal, Box::new(fe.clone()), 16);
    meter.detect_sensors();
    (fe, Instrument::new(meter, &MeterConfig::default()))
}

fn ask(inst: &mut Instrument, line: &str) -> String {
    inst.handle(line).unwrap_or_default()
}

#[test]
fn measures_detected_sensor() {
    let (_fe, mut inst) = bench();
    assert_eq!(ask(&mut inst, "CAL:SENS:TYPE1?"), "AD8318\n");
    assert_eq!(ask(&mut inst, "CAL:SENS:TYPE2?"), "NONE\n");

    assert_eq!(inst.handle("MEAS:POW1"), None);
    assert_eq!(ask(&mut inst, "MEAS:POW1?"), "-10.000\n");
    assert_eq!(ask(&mut inst, "MEAS:VOLT1?"), "10.000000\n");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "0,\"No error\"\n");
}

#[test]
fn attenuator_and_unit_apply_to_readings() {
    let (_fe, mut inst) = bench();
    inst.handle("MEAS:POW");
    inst.handle("SENS:ATT 40;MEAS:POW:UNIT MW");
    assert_eq!(ask(&mut inst, "SENS:ATT?;MEAS:POW:UNIT?"), "40.0;MW\n");
    assert_eq!(ask(&mut inst, "MEAS:POW?"), "1000.000\n");

    inst.handle("*RST");
    assert_eq!(ask(&mut inst, "MEAS:POW?"), "-10.000\n");
}

#[test]
fn frequency_snaps_to_nearest_calibration_point() {
    let (_fe, mut inst) = bench();
    assert_eq!(ask(&mut inst, "SENS:FREQ:CAT?"), "100,500,1000\n");
    assert_eq!(ask(&mut inst, "SENS:FREQ?"), "100\n");

    inst.handle("SENS:FREQ 600");
    assert_eq!(ask(&mut inst, "SENS:FREQ?"), "500\n");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "-100,\"Frequency snapped to 500\"\n");

    inst.handle("SENS:FREQ 1000");
    assert_eq!(ask(&mut inst, "SENS:FREQ?;SYST:ERR?"), "1000;0,\"No error\"\n");

    inst.handle("SENS:FREQ");
    assert_eq!(
        ask(&mut inst, "SYST:ERR?"),
        "-100,\"Missing frequency parameter\"\n"
    );
}

#[test]
fn offset_is_saved_and_restored() {
    let (fe, mut inst) = bench();
    inst.handle("SENS:FREQ 500;CAL:POW:OFFS 1.5;MEAS:POW");
    assert_eq!(ask(&mut inst, "CAL:POW:OFFS?"), "1.500\n");
    assert_eq!(ask(&mut inst, "MEAS:POW?"), "-8.500\n");

    // Other frequencies keep the identity correction
    inst.handle("SENS:FREQ 100");
    assert_eq!(ask(&mut inst, "CAL:POW:OFFS?;CAL:POW:SLOP?"), "0.000;1.000000\n");

    inst.handle("CAL:POW:SAVE");
    let saved = record::decode(&fe.eeprom(1).unwrap()).unwrap();
    assert_eq!(saved.corrections, vec![FrequencyCorrection::new(500, 1.5, 1.0)]);
    assert_eq!(saved.identity.serial, "SN0042");

    // A fresh detection picks the stored correction back up
    inst.meter_mut().sensor_inserted(1).unwrap();
    assert_eq!(inst.meter().sensor(1).unwrap().offset(Some(500)), 1.5);

    inst.handle("CAL:POW:REST1");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "0,\"No error\"\n");
    let restored = record::decode(&fe.eeprom(1).unwrap()).unwrap();
    assert!(restored.corrections.is_empty());
}

#[test]
fn failed_save_keeps_previous_record() {
    let (fe, mut inst) = bench();
    let before = fe.eeprom(1).unwrap();

    fe.fail_writes(true);
    inst.handle("CAL:POW:OFFS1 2.0;CAL:POW:SAVE1");
    let reply = ask(&mut inst, "SYST:ERR?");
    assert!(reply.starts_with("-300,\"Calibration save failed: "), "{reply}");
    assert_eq!(fe.eeprom(1).unwrap(), before);

    // In-memory correction survives the failed write
    assert_eq!(ask(&mut inst, "CAL:POW:OFFS1?"), "2.000\n");
}

#[test]
fn calibration_without_sensor() {
    let (_fe, mut inst) = bench();
    inst.handle("CAL:POW:OFFS2 1.0");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "-230,\"No sensor detected\"\n");
    assert_eq!(ask(&mut inst, "CAL:POW:OFFS2?"), "0.000\n");

    // Saving everything skips the empty socket
    inst.handle("CAL:POW:SAVE");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "0,\"No error\"\n");
}

#[test]
fn hot_swap_follows_presence_pin() {
    let (fe, mut inst) = bench();
    let mut monitor = HotSwapMonitor::new();
    monitor.prime(&fe);
    fe.attach_presence_interrupt(monitor.latch());

    fe.remove_sensor(1);
    fe.insert_sensor(2, &sensor_image());
    let events = monitor.poll(inst.meter_mut(), &fe);
    assert_eq!(
        events,
        vec![
            HotSwapEvent::Removed { channel: 1 },
            HotSwapEvent::Inserted {
                channel: 2,
                sensor_type: Some("AD8318".into())
            },
        ]
    );

    assert_eq!(ask(&mut inst, "CAL:SENS:TYPE1?;CAL:SENS:TYPE2?"), "NONE;AD8318\n");
    assert_eq!(ask(&mut inst, "MEAS:POW1?"), "9.91E37\n");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "-230,\"No sensor detected\"\n");

    // No edges, nothing to do
    assert!(monitor.poll(inst.meter_mut(), &fe).is_empty());
}

#[test]
fn error_queue_keeps_ten_most_recent() {
    let (_fe, mut inst) = bench();
    for _ in 0..11 {
        inst.handle("BOGUS");
    }
    inst.handle("MEAS:POW3?");
    assert_eq!(inst.errors().len(), 10);

    for _ in 0..9 {
        assert_eq!(
            ask(&mut inst, "SYST:ERR?"),
            "-100,\"Command error: Unknown command\"\n"
        );
    }
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "-200,\"Invalid channel\"\n");
    assert_eq!(ask(&mut inst, "SYST:ERR?"), "0,\"No error\"\n");
}

#[test]
fn bad_commands_do_not_abort_the_line() {
    let (_fe, mut inst) = bench();
    assert_eq!(
        ask(&mut inst, "NOPE;*IDN?;MEAS:POW:UNIT KW;MEAS:POW:UNIT?"),
        "HomeLab,RFPM-2CH,001,1.0.0;DBM\n"
    );
    assert_eq!(
        ask(&mut inst, "SYST:ERR?;SYST:ERR?"),
        "-100,\"Command error: Unknown command\";-100,\"Invalid unit\"\n"
    );
}
