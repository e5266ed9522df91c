//! Interface claiming

use crate::backend::UsbDevice;
use crate::handle::{DeviceHandle, Native};
use tracing::{debug, error, warn};

/// Interface class triple to claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Claim every interface of every configuration matching `wanted`
///
/// Returns the number of successful claims. A failed claim is logged and the
/// scan goes on. hidapi handles need no claiming on Windows and report one
/// claimed interface there; elsewhere they report none.
pub(crate) fn claim_interfaces_by(handle: &DeviceHandle, wanted: InterfaceClass) -> usize {
    let mut native = match handle.native_mut() {
        Ok(native) => native,
        Err(e) => {
            warn!("Cannot claim interfaces on handle {}: {}", handle.id(), e);
            return 0;
        }
    };

    match &mut *native {
        Native::Usb(device) => claim_usb(device.as_mut(), wanted),
        #[cfg(feature = "hidapi")]
        Native::Hid(_) => {
            if cfg!(windows) {
                1
            } else {
                warn!("Interface claiming is not supported on hidapi handles");
                0
            }
        }
    }
}

fn claim_usb(device: &mut dyn UsbDevice, wanted: InterfaceClass) -> usize {
    let mut count = 0;
    for index in 0..=u8::MAX {
        let config = match device.config_descriptor(index) {
            Ok(config) => config,
            Err(rusb::Error::NotFound) => break,
            Err(e) => {
                error!("Failed to read configuration descriptor {}: {}", index, e);
                return 0;
            }
        };

        let matching = config
            .interfaces
            .iter()
            .flatten()
            .filter(|alt| {
                alt.class == wanted.class
                    && alt.subclass == wanted.subclass
                    && alt.protocol == wanted.protocol
            })
            .map(|alt| alt.number);

        for number in matching {
            match device.claim_interface(number) {
                Ok(()) => {
                    if cfg!(target_os = "linux") {
                        // Auto-detach usually did this already.
                        let _ = device.detach_kernel_driver(number);
                    }
                    debug!("Claimed interface {}", number);
                    count += 1;
                }
                Err(e) => error!("Failed to claim interface {}: {}", number, e),
            }
        }
    }
    count
}
