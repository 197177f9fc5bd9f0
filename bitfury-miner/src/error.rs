//! Error types for the driver core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed clock record line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("Invalid clock option {entry:?}: {reason}")]
    InvalidClockOption { entry: String, reason: String },

    #[error("Unknown chip {0}")]
    UnknownChip(crate::types::ChipKey),

    #[error("No chips detected")]
    NoChips,
}

pub type Result<T> = std::result::Result<T, Error>;
