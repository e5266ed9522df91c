//! Error types for the USB helper

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The path did not yield a bus number and device address
    #[error("failed to determine device address for '{0}'")]
    Address(String),

    /// The address was parsed but no attached device carries it
    #[error("device {address} on bus {bus} not found")]
    NotFound { bus: u8, address: u8 },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("device handle is closed")]
    Closed,

    /// Report-access handles are bound to the interface they were opened for
    #[error("request for interface {requested} on a handle opened for interface {opened:?}")]
    InterfaceMismatch { opened: Option<u16>, requested: u16 },

    #[error("report of {length} bytes exceeds the {max} byte limit")]
    ReportTooLong { length: usize, max: usize },

    #[error("invalid read length {0}")]
    InvalidLength(usize),

    #[error("out of memory")]
    OutOfMemory,

    #[error("failed to initialize {backend}: {message}")]
    Init {
        backend: &'static str,
        message: String,
    },
}

#[cfg(feature = "hidapi")]
impl From<hidapi::HidError> for Error {
    fn from(err: hidapi::HidError) -> Self {
        Error::Hid(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
