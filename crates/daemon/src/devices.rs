//! Per-device startup: open, claim, initialize and start reading

use crate::config::DeviceConfig;
use anyhow::{Context, Result};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};
use usb_helper::{DeviceHandle, UsbHelper};

/// A device the daemon is reading from
pub struct ActiveDevice {
    pub path: String,
    pub handle: DeviceHandle,
    reports: Rc<Cell<u64>>,
    ended: Rc<Cell<bool>>,
}

impl ActiveDevice {
    /// Reports received so far
    pub fn reports(&self) -> u64 {
        self.reports.get()
    }

    /// Whether the read loop stopped on its own
    pub fn ended(&self) -> bool {
        self.ended.get()
    }
}

/// Bring one configured device up
///
/// The handle is closed again if any step after opening fails.
pub fn start_device(helper: &UsbHelper, device: &DeviceConfig) -> Result<ActiveDevice> {
    let path = device.expanded_path();
    let handle = helper
        .open(&path)
        .with_context(|| format!("Failed to open device '{}'", path))?;
    info!(
        handle = handle.id(),
        subsystem = %handle.subsystem(),
        "Opened {}",
        path
    );

    match initialize(helper, &handle, device, &path) {
        Ok(active) => Ok(active),
        Err(e) => {
            helper.close(&handle);
            Err(e)
        }
    }
}

fn initialize(
    helper: &UsbHelper,
    handle: &DeviceHandle,
    device: &DeviceConfig,
    path: &str,
) -> Result<ActiveDevice> {
    if let Some(class) = device.claim {
        let claimed = helper.claim_interfaces_by(handle, class);
        if claimed == 0 {
            warn!(
                "No interface of class {:02x}/{:02x}/{:02x} claimed on {}",
                class.class, class.subclass, class.protocol, path
            );
        } else {
            debug!("Claimed {} interface(s) on {}", claimed, path);
        }
    }

    if let (Some(index), Some(report)) = (device.report_index, &device.init_report) {
        let answer = helper
            .hid_request(handle, index, report)
            .with_context(|| format!("Initial feature report failed on '{}'", path))?;
        debug!("Feature report answer from {}: {:02x?}", path, answer);
    }

    let reports = Rc::new(Cell::new(0u64));
    let ended = Rc::new(Cell::new(false));
    let (counter, done) = (reports.clone(), ended.clone());
    let label = path.to_string();
    helper
        .interrupt_read_loop(
            handle,
            device.endpoint,
            device.length,
            move |handle, endpoint, data| match data {
                Some(report) => {
                    counter.set(counter.get() + 1);
                    trace!(
                        handle = handle.id(),
                        endpoint,
                        "Report from {}: {:02x?}",
                        label,
                        report
                    );
                }
                None => {
                    done.set(true);
                    warn!(handle = handle.id(), endpoint, "Read loop on {} ended", label);
                }
            },
        )
        .with_context(|| format!("Failed to start reading '{}'", path))?;

    Ok(ActiveDevice {
        path: path.to_string(),
        handle: handle.clone(),
        reports,
        ended,
    })
}

/// Start every device, skipping the ones that fail
pub fn start_all(helper: &UsbHelper, devices: &[DeviceConfig]) -> Vec<ActiveDevice> {
    devices
        .iter()
        .filter_map(|device| match start_device(helper, device) {
            Ok(active) => Some(active),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        })
        .collect()
}

/// Close every device, logging how much each one delivered
pub fn stop_all(helper: &UsbHelper, devices: Vec<ActiveDevice>) {
    for device in devices {
        info!(
            "Closing {} after {} report(s)",
            device.path,
            device.reports()
        );
        helper.close(&device.handle);
    }
}
