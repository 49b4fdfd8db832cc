//! Fixed-layout binary record stored in each sensor module's EEPROM.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "RFPM"
//!      4     1  format version (1)
//!      5     1  sensor type length
//!      6     8  sensor type (UTF-8, zero padded)
//!     14     1  serial length
//!     15    12  serial (UTF-8, zero padded)
//!     27     4  base slope      (f32 LE)
//!     31     4  base intercept  (f32 LE)
//!     35     1  frequency count
//!     36    32  frequencies     (u16 LE, up to 16)
//!     68     1  correction count
//!     69  10*n  corrections     {freq u16, offset f32, slope f32}, up to 18
//! ```
//!
//! All multi-byte values are little-endian. The whole record fits in 256 bytes.

use thiserror::Error;

use super::{FrequencyCorrection, SensorIdentity};

pub const MAGIC: &[u8; 4] = b"RFPM";
pub const FORMAT_VERSION: u8 = 1;

pub const MAX_TYPE_LEN: usize = 8;
pub const MAX_SERIAL_LEN: usize = 12;
pub const MAX_FREQUENCIES: usize = 16;
pub const MAX_CORRECTIONS: usize = 18;
pub const RECORD_CAPACITY: usize = 256;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TYPE_LEN: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_SERIAL_LEN: usize = 14;
const OFF_SERIAL: usize = 15;
const OFF_SLOPE: usize = 27;
const OFF_INTERCEPT: usize = 31;
const OFF_NUM_FREQS: usize = 35;
const OFF_FREQS: usize = 36;
const OFF_CAL_DATA: usize = 68;
const CAL_ENTRY_SIZE: usize = 10;

/// Length of a record carrying no corrections.
pub const HEADER_LEN: usize = OFF_CAL_DATA + 1;

#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("Bad magic, not a sensor record")]
    BadMagic,

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("Record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{field} too long: {len} exceeds {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is not valid UTF-8")]
    InvalidText(&'static str),
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// Decoded contents of a sensor EEPROM.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub identity: SensorIdentity,
    pub corrections: Vec<FrequencyCorrection>,
}

/// Serializes `record`, dropping identity corrections and keeping at most
/// [`MAX_CORRECTIONS`] of the rest in the given order.
pub fn encode(record: &CalibrationRecord) -> Result<Vec<u8>> {
    let identity = &record.identity;
    let type_bytes = identity.sensor_type.as_bytes();
    let serial_bytes = identity.serial.as_bytes();
    check_len("sensor type", type_bytes.len(), MAX_TYPE_LEN)?;
    check_len("serial", serial_bytes.len(), MAX_SERIAL_LEN)?;
    check_len("frequency list", identity.frequencies.len(), MAX_FREQUENCIES)?;

    let corrections: Vec<&FrequencyCorrection> = record
        .corrections
        .iter()
        .filter(|c| !c.is_identity())
        .take(MAX_CORRECTIONS)
        .collect();

    let mut buf = vec![0u8; HEADER_LEN + corrections.len() * CAL_ENTRY_SIZE];
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(MAGIC);
    buf[OFF_VERSION] = FORMAT_VERSION;
    buf[OFF_TYPE_LEN] = type_bytes.len() as u8;
    buf[OFF_TYPE..OFF_TYPE + type_bytes.len()].copy_from_slice(type_bytes);
    buf[OFF_SERIAL_LEN] = serial_bytes.len() as u8;
    buf[OFF_SERIAL..OFF_SERIAL + serial_bytes.len()].copy_from_slice(serial_bytes);
    buf[OFF_SLOPE..OFF_SLOPE + 4].copy_from_slice(&identity.base_slope.to_le_bytes());
    buf[OFF_INTERCEPT..OFF_INTERCEPT + 4].copy_from_slice(&identity.base_intercept.to_le_bytes());
    buf[OFF_NUM_FREQS] = identity.frequencies.len() as u8;
    for (i, freq) in identity.frequencies.iter().enumerate() {
        let at = OFF_FREQS + i * 2;
        buf[at..at + 2].copy_from_slice(&freq.to_le_bytes());
    }

    buf[OFF_CAL_DATA] = corrections.len() as u8;
    for (i, c) in corrections.iter().enumerate() {
        let at = HEADER_LEN + i * CAL_ENTRY_SIZE;
        buf[at..at + 2].copy_from_slice(&c.frequency_mhz.to_le_bytes());
        buf[at + 2..at + 6].copy_from_slice(&c.offset_db.to_le_bytes());
        buf[at + 6..at + 10].copy_from_slice(&c.slope.to_le_bytes());
    }

    debug_assert!(buf.len() <= RECORD_CAPACITY);
    Ok(buf)
}

/// Parses a record. Any error means the store holds no usable sensor record.
///
/// Duplicate frequencies keep their first occurrence. Corrections naming a
/// frequency the sensor does not list are dropped, and a correction count
/// above [`MAX_CORRECTIONS`] (an erased cell reads `0xFF`) loads none.
pub fn decode(bytes: &[u8]) -> Result<CalibrationRecord> {
    need(bytes, OFF_VERSION + 1)?;
    if &bytes[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
        return Err(RecordError::BadMagic);
    }
    if bytes[OFF_VERSION] != FORMAT_VERSION {
        return Err(RecordError::UnsupportedVersion(bytes[OFF_VERSION]));
    }
    need(bytes, HEADER_LEN)?;

    let sensor_type = read_text(bytes, OFF_TYPE_LEN, OFF_TYPE, MAX_TYPE_LEN, "sensor type")?;
    let serial = read_text(bytes, OFF_SERIAL_LEN, OFF_SERIAL, MAX_SERIAL_LEN, "serial")?;
    let base_slope = read_f32(bytes, OFF_SLOPE);
    let base_intercept = read_f32(bytes, OFF_INTERCEPT);

    let num_freqs = bytes[OFF_NUM_FREQS] as usize;
    check_len("frequency list", num_freqs, MAX_FREQUENCIES)?;
    let mut frequencies: Vec<u16> = Vec::with_capacity(num_freqs);
    for i in 0..num_freqs {
        let freq = read_u16(bytes, OFF_FREQS + i * 2);
        if !frequencies.contains(&freq) {
            frequencies.push(freq);
        }
    }

    let count = bytes[OFF_CAL_DATA] as usize;
    let mut corrections = Vec::new();
    if count <= MAX_CORRECTIONS {
        need(bytes, HEADER_LEN + count * CAL_ENTRY_SIZE)?;
        for i in 0..count {
            let at = HEADER_LEN + i * CAL_ENTRY_SIZE;
            let correction = FrequencyCorrection {
                frequency_mhz: read_u16(bytes, at),
                offset_db: read_f32(bytes, at + 2),
                slope: read_f32(bytes, at + 6),
            };
            if frequencies.contains(&correction.frequency_mhz) {
                corrections.push(correction);
            }
        }
    }

    Ok(CalibrationRecord {
        identity: SensorIdentity {
            sensor_type,
            serial,
            base_slope,
            base_intercept,
            frequencies,
        },
        corrections,
    })
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(RecordError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn need(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(RecordError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn read_text(
    bytes: &[u8],
    len_at: usize,
    at: usize,
    max: usize,
    field: &'static str,
) -> Result<String> {
    let len = bytes[len_at] as usize;
    check_len(field, len, max)?;
    std::str::from_utf8(&bytes[at..at + len])
        .map(str::to_owned)
        .map_err(|_| RecordError::InvalidText(field))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
