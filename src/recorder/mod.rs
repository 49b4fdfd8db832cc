pub mod data;

use chrono::Utc;
use csv::Writer;
use data::ReadingRecord;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::calibration::CHANNELS;
use crate::channel::PowerUnit;
use crate::meter::PowerMeter;

/// Current reading of every channel, as one record per channel.
pub fn snapshot(meter: &PowerMeter) -> Vec<ReadingRecord> {
    let now = Utc::now().to_rfc3339();
    CHANNELS
        .iter()
        .filter_map(|&channel| {
            let ch = meter.channel(channel).ok()?;
            let sensor = meter.sensor(channel);
            Some(ReadingRecord {
                timestamp: now.clone(),
                channel,
                sensor_type: sensor.map_or("NONE", |s| s.sensor_type()).to_string(),
                voltage: ch.last_voltage(),
                power_dbm: ch.get_power(Some(PowerUnit::DBm), true).0,
                frequency_mhz: sensor.map_or(0, |s| s.current_frequency()),
            })
        })
        .collect()
}

/// Reading log streamed to a timestamped CSV file. Every capture is flushed,
/// so the file holds all readings taken so far.
pub struct ReadingLog {
    path: PathBuf,
    writer: Writer<File>,
    written: usize,
}

impl ReadingLog {
    /// Creates `readings_<timestamp>.csv` under `dir`.
    pub fn create(dir: &Path) -> io::Result<Self> {
        let name = chrono::Local::now()
            .format("readings_%Y-%m-%d_%H-%M-%S.csv")
            .to_string();

        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = File::create(&path)?;
        info!("Recording readings to {}", path.display());

        Ok(ReadingLog {
            path,
            writer: Writer::from_writer(file),
            written: 0,
        })
    }

    /// Appends the current reading of every channel. Returns the number of
    /// rows written.
    pub fn capture(&mut self, meter: &PowerMeter) -> io::Result<usize> {
        let records = snapshot(meter);
        for record in &records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        self.written += records.len();
        debug!("{} readings written", self.written);
        Ok(records.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Flushes and closes the file.
    pub fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        info!("{} readings saved to {}", self.written, self.path.display());
        Ok(self.path)
    }
}
