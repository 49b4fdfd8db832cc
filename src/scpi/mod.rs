//! SCPI front end: command parsing, abbreviation matching, dispatch and the
//! instrument error queue.

pub mod commands;
pub mod parser;

pub use commands::{Instrument, InstrumentState};
pub use parser::{ErrorQueue, Registry, ScpiCommand, ScpiEngine};

use thiserror::Error;

/// SCPI "not a number", returned where a reading is unavailable.
pub const NOT_A_NUMBER: &str = "9.91E37";

/// Failure of a single command. Never fatal to the connection: the engine
/// queues it and moves on to the next command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScpiError {
    #[error("Command error: Unknown command")]
    UnknownCommand,

    #[error("Invalid channel")]
    InvalidChannel(u8),

    #[error("No sensor detected")]
    NoSensor,

    #[error("Missing {0} parameter")]
    MissingParameter(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid unit")]
    BadUnit(String),

    #[error("Calibration save failed: {0}")]
    PersistFailure(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl ScpiError {
    /// Error code reported by `SYSTem:ERRor?`.
    pub fn code(&self) -> i32 {
        match self {
            ScpiError::UnknownCommand
            | ScpiError::MissingParameter(_)
            | ScpiError::InvalidParameter(_)
            | ScpiError::BadUnit(_) => -100,
            ScpiError::InvalidChannel(_) | ScpiError::Execution(_) => -200,
            ScpiError::NoSensor => -230,
            ScpiError::PersistFailure(_) => -300,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScpiError>;
