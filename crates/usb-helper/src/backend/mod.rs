//! Native access libraries
//!
//! The helper talks to devices through two libraries: libusb (via `rusb`)
//! for raw control/interrupt transfers, and hidapi for report-level access.
//! Both are hidden behind the object-safe traits in this module so the rest
//! of the crate never touches FFI and can run against simulated devices.
//!
//! Completion handlers registered with [`UsbDevice::submit_interrupt`] are
//! invoked from inside [`UsbBackend::handle_events`]. Code running there
//! must not call back into arbitrary user code.

pub mod libusb;

#[cfg(feature = "hidapi")]
pub mod hid;

use crate::Result;
use std::time::Duration;
use tracing::debug;

/// One alternate setting of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSetting {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The parts of a configuration descriptor the claimer looks at
///
/// `interfaces[n]` lists every alternate setting of the n-th interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSummary {
    pub interfaces: Vec<Vec<InterfaceSetting>>,
}

/// Outcome of a finished asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Stall,
    NoDevice,
    Overflow,
    Cancelled,
    Error,
}

/// What the backend should do with a transfer once its handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler resubmitted the transfer; keep it alive
    Keep,
    /// Free the transfer and its buffer
    Release,
}

/// A transfer handed to its completion handler
pub trait CompletedTransfer {
    /// Endpoint address, including the direction bit
    fn endpoint(&self) -> u8;
    fn status(&self) -> TransferStatus;
    /// Bytes actually received
    fn data(&self) -> &[u8];
    /// Submit the same transfer (same buffer, same handler) again
    fn resubmit(&mut self) -> std::result::Result<(), rusb::Error>;
}

/// Completion handler of an asynchronous interrupt transfer
pub type TransferHandler = Box<dyn FnMut(&mut dyn CompletedTransfer) -> Disposition>;

/// Process-wide libusb state
pub trait UsbBackend {
    /// Snapshot of every attached device
    fn devices(&self) -> std::result::Result<Vec<Box<dyn AttachedDevice>>, rusb::Error>;

    /// Process pending events, invoking completion handlers
    fn handle_events(&self, timeout: Duration) -> std::result::Result<(), rusb::Error>;
}

/// An attached but not yet opened device
pub trait AttachedDevice {
    fn bus_number(&self) -> u8;
    fn address(&self) -> u8;
    fn open(&self) -> std::result::Result<Box<dyn UsbDevice>, rusb::Error>;
}

/// An opened libusb device; dropping it closes the device
pub trait UsbDevice {
    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> std::result::Result<(), rusb::Error>;

    /// Configuration descriptor by index; `rusb::Error::NotFound` past the last one
    fn config_descriptor(&self, index: u8) -> std::result::Result<ConfigSummary, rusb::Error>;

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), rusb::Error>;

    fn detach_kernel_driver(&mut self, interface: u8) -> std::result::Result<(), rusb::Error>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error>;

    /// Allocate and submit an interrupt transfer of `length` bytes
    ///
    /// `handler` is called from [`UsbBackend::handle_events`] each time the
    /// transfer finishes. Closing the device cancels the transfer; the
    /// handler still sees the cancellation.
    fn submit_interrupt(
        &self,
        endpoint: u8,
        length: usize,
        handler: TransferHandler,
    ) -> std::result::Result<(), rusb::Error>;
}

/// Process-wide hidapi state
#[cfg(feature = "hidapi")]
pub trait HidBackend {
    fn open_path(&self, path: &str) -> Result<Box<dyn HidDevice>>;
}

/// An opened hidapi device; dropping it closes the device
#[cfg(feature = "hidapi")]
pub trait HidDevice {
    /// Write an output report; the first byte is the report id
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// The first byte of `data` is the report id
    fn send_feature_report(&self, data: &[u8]) -> Result<()>;

    /// `buf[0]` selects the report id; returns bytes read including it
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read an input report; `0` ms makes this non-blocking and `Ok(0)`
    /// means no report was pending
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

/// Both native backends, owned together by the helper
pub struct Backends {
    pub usb: Box<dyn UsbBackend>,
    #[cfg(feature = "hidapi")]
    pub hid: Box<dyn HidBackend>,
}

impl Backends {
    /// Initialize libusb and, when compiled in, hidapi
    pub fn system() -> Result<Self> {
        let usb = libusb::LibusbBackend::new().map_err(|e| crate::Error::Init {
            backend: "libusb",
            message: e.to_string(),
        })?;

        #[cfg(feature = "hidapi")]
        let hid = hid::HidapiBackend::new().map_err(|e| crate::Error::Init {
            backend: "hidapi",
            message: e.to_string(),
        })?;

        Ok(Self {
            usb: Box::new(usb),
            #[cfg(feature = "hidapi")]
            hid: Box::new(hid),
        })
    }

    /// Drop the hidapi backend first, then release libusb
    pub fn shutdown(self) {
        #[cfg(feature = "hidapi")]
        {
            drop(self.hid);
            debug!("hidapi backend dropped; native hidapi state lives until exit");
        }
        drop(self.usb);
        debug!("libusb context released");
    }
}
