//! hidapi backend

use super::{HidBackend, HidDevice};
use crate::Result;
use hidapi::HidApi;
use std::ffi::CString;
use tracing::debug;

/// hidapi library state
///
/// The `hidapi` crate never calls `hid_exit`, so the native library stays
/// initialized for the rest of the process; dropping this only releases
/// the cached device list.
pub struct HidapiBackend {
    api: HidApi,
}

impl HidapiBackend {
    /// Initialize hidapi
    ///
    /// Safe to call when another `HidApi` already exists in the process.
    pub fn new() -> std::result::Result<Self, hidapi::HidError> {
        let api = HidApi::new()?;
        debug!("hidapi initialized");
        Ok(Self { api })
    }
}

impl HidBackend for HidapiBackend {
    fn open_path(&self, path: &str) -> Result<Box<dyn HidDevice>> {
        let c_path = CString::new(path)
            .map_err(|_| crate::Error::Hid(format!("path contains a NUL byte: {:?}", path)))?;
        let device = self.api.open_path(&c_path)?;
        Ok(Box::new(HidapiDevice { raw: device }))
    }
}

struct HidapiDevice {
    raw: hidapi::HidDevice,
}

impl HidDevice for HidapiDevice {
    fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.raw.write(data)?)
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        Ok(self.raw.send_feature_report(data)?)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.raw.get_feature_report(buf)?)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        Ok(self.raw.read_timeout(buf, timeout_ms)?)
    }
}
