//! Common utilities for usb-inputd
//!
//! Ambient pieces shared by the daemon binary and anything else that hosts
//! the USB helper: error type and tracing setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{LOG_LEVELS, setup_logging};
