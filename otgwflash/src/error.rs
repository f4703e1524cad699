//! Error types for otgwflash.

use crate::image::hex::LoadError;
use std::io;
use thiserror::Error;

/// Result type for otgwflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for otgwflash operations.
///
/// Protocol faults on the serial link (bad checksums, verify mismatches,
/// missing responses) never show up here: the upgrade engine retries them
/// internally and reports a terminal [`Outcome`](crate::engine::Outcome).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware image could not be loaded.
    #[error("Invalid firmware image: {0}")]
    Load(#[from] LoadError),

    /// No usable serial port was found.
    #[error("No serial port found")]
    PortNotFound,

    /// An upgrade session is already running.
    #[error("An upgrade is already in progress")]
    Busy,

    /// The embedding application asked the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// Unsupported operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
