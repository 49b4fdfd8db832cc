use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

use rf_power_meter::calibration::record::{self, CalibrationRecord, RecordError};
use rf_power_meter::calibration::{
    CHANNELS, CalibrationManager, FrequencyCorrection, SensorIdentity,
};
use rf_power_meter::config::MeterConfig;
use rf_power_meter::devices::SimulatedFrontEnd;
use rf_power_meter::hotswap::{HotSwapEvent, HotSwapMonitor};
use rf_power_meter::meter::PowerMeter;
use rf_power_meter::recorder::ReadingLog;
use rf_power_meter::scheduler::Scheduler;
use rf_power_meter::scpi::Instrument;

const COMMAND_POLL: Duration = Duration::from_millis(10);

/// State shared by the scheduled tasks.
struct App {
    instrument: Instrument,
    frontend: SimulatedFrontEnd,
    monitor: HotSwapMonitor,
    readings: ReadingLog,
    commands: Receiver<String>,
    input_closed: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => MeterConfig::load(Path::new(&path))?,
        None => MeterConfig::default(),
    };

    // Keep the guard alive so buffered log lines are flushed on exit
    let _guard = setup_logging(&config.log_dir);
    info!("Starting application");

    let frontend = SimulatedFrontEnd::new(config.mux_ports);
    frontend.insert_sensor(1, &demo_sensor_image("A1B2C3")?);
    frontend.set_voltage(1, 1.0);

    let calibration = CalibrationManager::new(Box::new(frontend.clone()), config.mux_ports);
    let mut meter = PowerMeter::new(calibration, Box::new(frontend.clone()), config.averaging_default);
    for (channel, sensor_type) in meter.detect_sensors() {
        match sensor_type {
            Some(sensor_type) => info!("Channel {}: {} detected at boot", channel, sensor_type),
            None => info!("Channel {}: no sensor at boot", channel),
        }
    }

    let mut monitor = HotSwapMonitor::new();
    monitor.prime(&frontend);
    frontend.attach_presence_interrupt(monitor.latch());

    let mut app = App {
        instrument: Instrument::new(meter, &config),
        frontend,
        monitor,
        readings: ReadingLog::create(&config.log_dir)?,
        commands: spawn_stdin_reader(),
        input_closed: false,
    };

    let start = Instant::now();
    let mut scheduler: Scheduler<App> = Scheduler::new();
    scheduler
        .every("sensor_read", config.sensor_period(), start, |app| {
            app.instrument.meter_mut().sample_all();
        })
        .every("hotswap", config.hotswap_period(), start, |app| {
            for event in app.monitor.poll(app.instrument.meter_mut(), &app.frontend) {
                log_hotswap(&event);
            }
        })
        .every("commands", COMMAND_POLL, start, drain_commands)
        .every("recorder", config.recorder_period(), start, |app| {
            if let Err(e) = app.readings.capture(app.instrument.meter()) {
                error!("Failed to record readings: {}", e);
            }
        });

    if config.run_seconds > 0 {
        let duration = Duration::from_secs(config.run_seconds);
        scheduler.run_for(&mut app, duration, |app| app.input_closed);
    } else {
        scheduler.run_until(&mut app, |app| app.input_closed);
    }

    match app.readings.finish() {
        Ok(path) => println!("Readings saved to: {}", path.display()),
        Err(e) => error!("Failed to save readings: {}", e),
    }

    info!("Application shutting down");
    Ok(())
}

fn setup_logging(dir: &Path) -> WorkerGuard {
    let file_appender = rolling::daily(dir, "rfpm.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .init();
    guard
}

/// Forwards stdin lines to the command task. The channel disconnects when
/// stdin closes.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn drain_commands(app: &mut App) {
    loop {
        let line = match app.commands.try_recv() {
            Ok(line) => line,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                info!("Command input closed");
                app.input_closed = true;
                return;
            }
        };

        let reply = match line.trim().strip_prefix('!') {
            Some(action) => Some(simulate(app, action)),
            None => app.instrument.handle(&line),
        };
        if let Some(reply) = reply {
            let mut out = io::stdout().lock();
            if let Err(e) = out.write_all(reply.as_bytes()).and_then(|_| out.flush()) {
                error!("Failed to write reply: {}", e);
            }
        }
    }
}

/// Bench controls for the simulated hardware, e.g. `!insert 2` or `!volt 1 0.8`.
fn simulate(app: &mut App, action: &str) -> String {
    let mut words = action.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let Some(channel) = words.next().and_then(|w| w.parse::<u8>().ok()) else {
        return "ERR usage: !<insert|blank|remove|volt|provision|erase> <channel> [value]\n".into();
    };
    if !CHANNELS.contains(&channel) {
        return format!("ERR no channel {}\n", channel);
    }

    let outcome: Result<(), String> = match verb.as_str() {
        "insert" => demo_sensor_image(&format!("SIM{:03}", channel))
            .map(|image| app.frontend.insert_sensor(channel, &image))
            .map_err(|e| e.to_string()),
        "blank" => {
            app.frontend.insert_blank_sensor(channel);
            Ok(())
        }
        "remove" => {
            app.frontend.remove_sensor(channel);
            Ok(())
        }
        "volt" => match words.next().and_then(|w| w.parse::<f32>().ok()) {
            Some(volts) => {
                app.frontend.set_voltage(channel, volts);
                Ok(())
            }
            None => Err("missing voltage".into()),
        },
        "provision" => app
            .instrument
            .meter_mut()
            .provision(channel, demo_identity(&format!("SIM{:03}", channel)))
            .map_err(|e| e.to_string()),
        "erase" => app
            .instrument
            .meter_mut()
            .erase(channel)
            .map_err(|e| e.to_string()),
        other => Err(format!("unknown action {}", other)),
    };

    match outcome {
        Ok(()) => "OK\n".into(),
        Err(e) => {
            warn!("Simulation action '{}' failed: {}", action, e);
            format!("ERR {}\n", e)
        }
    }
}

fn log_hotswap(event: &HotSwapEvent) {
    match event {
        HotSwapEvent::Inserted { channel, sensor_type: Some(sensor_type) } => {
            info!("Channel {}: {} inserted", channel, sensor_type)
        }
        HotSwapEvent::Inserted { channel, sensor_type: None } => {
            warn!("Channel {}: inserted sensor has no valid calibration", channel)
        }
        HotSwapEvent::Removed { channel } => info!("Channel {}: sensor removed", channel),
        HotSwapEvent::DetectionFailed { channel, reason } => {
            error!("Channel {}: detection failed: {}", channel, reason)
        }
    }
}

/// AD8318-style log detector: negative slope, calibrated across the ISM bands.
fn demo_identity(serial: &str) -> SensorIdentity {
    SensorIdentity {
        sensor_type: "AD8318".into(),
        serial: serial.into(),
        base_slope: -0.025,
        base_intercept: 20.0,
        frequencies: vec![433, 868, 915, 2400, 5800],
    }
}

fn demo_sensor_image(serial: &str) -> Result<Vec<u8>, RecordError> {
    record::encode(&CalibrationRecord {
        identity: demo_identity(serial),
        corrections: vec![
            FrequencyCorrection::new(2400, 1.5, 1.0),
            FrequencyCorrection::new(5800, 3.2, 0.98),
        ],
    })
}
