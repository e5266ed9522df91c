//! Device path decoding
//!
//! The device monitor hands the helper an opaque path string. Three
//! encodings are understood:
//!
//! - a sysfs device directory containing `busnum` and `devnum` files
//! - `/win32/usb/<bus>/<device>` with hexadecimal numbers, synthesized by
//!   the monitor where there is no sysfs
//! - `/hidapi/...`, a hidapi device path behind a marker prefix

use std::fs;
use std::path::Path;
use tracing::debug;

/// Prefix of synthetic libusb paths
pub const WIN32_USB_PREFIX: &str = "/win32/usb/";

/// Marker prefix of hidapi paths
pub const HIDAPI_PREFIX: &str = "/hidapi";

/// Marks the interface number of a composite device in a hidapi path
pub const INTERFACE_MARKER: &str = "&mi_";

/// Bus number and device address of a device path
///
/// Returns `None` when the path encodes no readable address.
pub fn usb_address(syspath: &str) -> Option<(u8, u8)> {
    if let Some(rest) = syspath.strip_prefix(WIN32_USB_PREFIX) {
        let (bus, device) = rest.split_once('/')?;
        let bus = u8::try_from(parse_hex_prefix(bus)?).ok()?;
        let device = u8::try_from(parse_hex_prefix(device)?).ok()?;
        return Some((bus, device));
    }

    let dir = Path::new(syspath);
    let bus = read_number(&dir.join("busnum"))?;
    let device = read_number(&dir.join("devnum"))?;
    Some((bus, device))
}

fn read_number(path: &Path) -> Option<u8> {
    let content = fs::read_to_string(path)
        .map_err(|e| debug!("Failed to read {}: {}", path.display(), e))
        .ok()?;
    content.trim().parse().ok()
}

/// Native hidapi path of a marked path, or `None` for any other path
pub fn hidapi_native_path(syspath: &str) -> Option<String> {
    let native = syspath.strip_prefix(HIDAPI_PREFIX)?;
    if !native.starts_with('/') {
        return None;
    }
    if cfg!(windows) {
        // The monitor turns backslashes into slashes for display.
        Some(native.replace('/', "\\"))
    } else {
        Some(native.to_string())
    }
}

/// Composite-device interface number encoded in a hidapi path
///
/// `None` if the marker is missing or not followed by a hex digit.
pub fn interface_index(native_path: &str) -> Option<u16> {
    let at = native_path.find(INTERFACE_MARKER)?;
    let digits = &native_path[at + INTERFACE_MARKER.len()..];
    parse_hex_prefix(digits).and_then(|n| u16::try_from(n).ok())
}

/// Leading hexadecimal digits of `s`, ignoring whatever follows them
fn parse_hex_prefix(s: &str) -> Option<u32> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_hexdigit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    u32::from_str_radix(&s[..end], 16).ok()
}
