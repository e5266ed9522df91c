//! HID feature reports over control transfers
//!
//! libusb handles speak the class requests directly: SET_REPORT carries the
//! request to the device, GET_REPORT fetches the answer into the same or a
//! fresh buffer. hidapi handles go through its feature-report calls with a
//! leading report-id byte.

use crate::backend::UsbDevice;
use crate::handle::{DeviceHandle, Native};
use crate::Result;
use std::time::Duration;
use tracing::{error, trace};

/// Class request, host to device, interface recipient
pub const REQUEST_TYPE_OUT: u8 = 0x21;
/// Class request, device to host, interface recipient
pub const REQUEST_TYPE_IN: u8 = 0xa1;
pub const SET_REPORT: u8 = 0x09;
pub const GET_REPORT: u8 = 0x01;
/// Feature report, report id 0
pub const FEATURE_REPORT_VALUE: u16 = 0x0300;

/// Largest payload a hidapi feature request may carry
pub const HIDAPI_REPORT_MAX: usize = 256;

/// Send a report and forget about it; failures are only logged
pub(crate) fn write(handle: &DeviceHandle, index: u16, data: &[u8], timeout: Duration) {
    let native = match handle.native() {
        Ok(native) => native,
        Err(e) => {
            error!("Report write on handle {}: {}", handle.id(), e);
            return;
        }
    };

    match &*native {
        Native::Usb(device) => {
            if let Err(e) = device.write_control(
                REQUEST_TYPE_OUT,
                SET_REPORT,
                FEATURE_REPORT_VALUE,
                index,
                data,
                timeout,
            ) {
                error!("Report write to interface {} failed: {}", index, e);
            }
        }
        #[cfg(feature = "hidapi")]
        Native::Hid(hid) => {
            if let Err(e) = hid.device.write(data) {
                error!("Report write failed: {}", e);
            }
        }
    }
}

/// Send `data` as a feature report and return the answer in a new buffer
///
/// The answer has exactly as many bytes as the request.
pub(crate) fn request(
    handle: &DeviceHandle,
    index: u16,
    data: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut answer = Vec::new();
    answer.try_reserve_exact(data.len())?;
    answer.resize(data.len(), 0);
    exchange(handle, index, &mut answer, Some(data), timeout)?;
    Ok(answer)
}

/// Send `buf` as a feature report and overwrite it with the answer
///
/// On failure `buf` may hold partial data.
pub(crate) fn request_in_place(
    handle: &DeviceHandle,
    index: u16,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    exchange(handle, index, buf, None, timeout)
}

/// One SET_REPORT / GET_REPORT round trip; `input` of `None` sends `output`
fn exchange(
    handle: &DeviceHandle,
    index: u16,
    output: &mut [u8],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<()> {
    let native = handle.native()?;
    let result = match &*native {
        Native::Usb(device) => usb_exchange(device.as_ref(), index, output, input, timeout),
        #[cfg(feature = "hidapi")]
        Native::Hid(hid) => hid_exchange(hid, index, output, input),
    };
    if let Err(e) = &result {
        error!("Feature request to interface {} failed: {}", index, e);
    }
    result
}

fn usb_exchange(
    device: &dyn UsbDevice,
    index: u16,
    output: &mut [u8],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<()> {
    let sent = device.write_control(
        REQUEST_TYPE_OUT,
        SET_REPORT,
        FEATURE_REPORT_VALUE,
        index,
        input.unwrap_or(&*output),
        timeout,
    )?;
    let received = device.read_control(
        REQUEST_TYPE_IN,
        GET_REPORT,
        FEATURE_REPORT_VALUE,
        index,
        output,
        timeout,
    )?;
    trace!(sent, received, index, "Feature report exchanged");
    Ok(())
}

#[cfg(feature = "hidapi")]
fn hid_exchange(
    hid: &crate::handle::HidHandle,
    index: u16,
    output: &mut [u8],
    input: Option<&[u8]>,
) -> Result<()> {
    let length = output.len();
    if length > HIDAPI_REPORT_MAX {
        return Err(crate::Error::ReportTooLong {
            length,
            max: HIDAPI_REPORT_MAX,
        });
    }
    if hid.interface != Some(index) {
        return Err(crate::Error::InterfaceMismatch {
            opened: hid.interface,
            requested: index,
        });
    }

    // Report id 0 goes in front of the payload.
    let mut buffer = [0u8; HIDAPI_REPORT_MAX + 1];
    buffer[1..=length].copy_from_slice(input.unwrap_or(&*output));
    hid.device.send_feature_report(&buffer[..=length])?;
    buffer[0] = 0;
    hid.device.get_feature_report(&mut buffer[..=length])?;
    output.copy_from_slice(&buffer[1..=length]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusb::{Direction, Recipient, RequestType};

    #[test]
    fn test_request_types_match_hid_class_requests() {
        assert_eq!(
            REQUEST_TYPE_OUT,
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface)
        );
        assert_eq!(
            REQUEST_TYPE_IN,
            rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface)
        );
    }
}
