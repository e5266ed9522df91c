//! libusb backend
//!
//! Synchronous operations go through `rusb`'s safe API. `rusb` has no
//! asynchronous transfers, so interrupt reads use the raw libusb transfer
//! API from `rusb::ffi` with a completion callback that runs inside
//! `libusb_handle_events_timeout_completed`.

use super::{
    AttachedDevice, CompletedTransfer, ConfigSummary, Disposition, InterfaceSetting,
    TransferHandler, TransferStatus, UsbBackend, UsbDevice,
};
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_fill_interrupt_transfer,
    libusb_free_transfer, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::cell::{Cell, RefCell};
use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

/// libusb context owned by the helper
pub struct LibusbBackend {
    context: Context,
}

impl LibusbBackend {
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        debug!("libusb context initialized");
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for LibusbBackend {
    fn devices(&self) -> Result<Vec<Box<dyn AttachedDevice>>, rusb::Error> {
        let list = self.context.devices()?;
        Ok(list
            .iter()
            .map(|device| Box::new(LibusbAttached { device }) as Box<dyn AttachedDevice>)
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error> {
        self.context.handle_events(Some(timeout))
    }
}

struct LibusbAttached {
    device: Device<Context>,
}

impl AttachedDevice for LibusbAttached {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn open(&self) -> Result<Box<dyn UsbDevice>, rusb::Error> {
        let handle = self.device.open()?;
        Ok(Box::new(LibusbDevice {
            device: self.device.clone(),
            open: Rc::new(OpenDevice {
                handle: RefCell::new(handle),
                closing: Cell::new(false),
                in_flight: RefCell::new(Vec::new()),
            }),
        }))
    }
}

/// State shared between an open device and its in-flight transfers
///
/// The libusb handle stays open until the last transfer referencing it has
/// been released, even after the [`LibusbDevice`] itself is dropped.
struct OpenDevice {
    handle: RefCell<DeviceHandle<Context>>,
    closing: Cell<bool>,
    in_flight: RefCell<Vec<NonNull<libusb_transfer>>>,
}

pub struct LibusbDevice {
    device: Device<Context>,
    open: Rc<OpenDevice>,
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        self.open.closing.set(true);
        let in_flight = self.open.in_flight.borrow();
        for transfer in in_flight.iter() {
            // SAFETY: transfers stay in `in_flight` until they are freed, so
            // the pointer is valid. Cancelling only flags the transfer; the
            // callback runs later from handle_events.
            unsafe {
                libusb_cancel_transfer(transfer.as_ptr());
            }
        }
        if !in_flight.is_empty() {
            debug!(
                "Cancelled {} in-flight transfer(s) on bus {} device {}",
                in_flight.len(),
                self.device.bus_number(),
                self.device.address()
            );
        }
    }
}

impl UsbDevice for LibusbDevice {
    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> Result<(), rusb::Error> {
        self.open
            .handle
            .borrow_mut()
            .set_auto_detach_kernel_driver(enable)
    }

    fn config_descriptor(&self, index: u8) -> Result<ConfigSummary, rusb::Error> {
        let config = self.device.config_descriptor(index)?;
        let interfaces = config
            .interfaces()
            .map(|interface| {
                interface
                    .descriptors()
                    .map(|alt| InterfaceSetting {
                        number: alt.interface_number(),
                        class: alt.class_code(),
                        subclass: alt.sub_class_code(),
                        protocol: alt.protocol_code(),
                    })
                    .collect()
            })
            .collect();
        Ok(ConfigSummary { interfaces })
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.open.handle.borrow_mut().claim_interface(interface)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.open.handle.borrow_mut().detach_kernel_driver(interface)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.open
            .handle
            .borrow()
            .write_control(request_type, request, value, index, data, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.open
            .handle
            .borrow()
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn submit_interrupt(
        &self,
        endpoint: u8,
        length: usize,
        handler: TransferHandler,
    ) -> Result<(), rusb::Error> {
        let max_size = c_int::try_from(length).map_err(|_| rusb::Error::InvalidParam)?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(length)
            .map_err(|_| rusb::Error::NoMem)?;
        buffer.resize(length, 0);

        // SAFETY: plain allocation; null is handled below.
        let transfer = NonNull::new(unsafe { libusb_alloc_transfer(0) }).ok_or(rusb::Error::NoMem)?;

        let mut state = Box::new(InterruptState {
            transfer,
            buffer: buffer.into_boxed_slice(),
            handler,
            device: self.open.clone(),
        });
        let buffer_ptr = state.buffer.as_mut_ptr();
        let raw_handle = self.open.handle.borrow().as_raw();
        let state_ptr = Box::into_raw(state);

        // SAFETY: transfer, raw_handle and buffer_ptr are valid; the buffer
        // is owned by the boxed state, which is only reclaimed by
        // interrupt_finished (or below, if submission fails).
        let rc = unsafe {
            libusb_fill_interrupt_transfer(
                transfer.as_ptr(),
                raw_handle,
                endpoint,
                buffer_ptr,
                max_size,
                interrupt_finished,
                state_ptr as *mut c_void,
                0,
            );
            libusb_submit_transfer(transfer.as_ptr())
        };

        if let Err(e) = check(rc) {
            // SAFETY: submission failed, so libusb will never call back with
            // this pointer.
            drop(unsafe { Box::from_raw(state_ptr) });
            return Err(e);
        }

        self.open.in_flight.borrow_mut().push(transfer);
        trace!("Submitted interrupt transfer on endpoint {:#04x}", endpoint);
        Ok(())
    }
}

/// Heap state carried in `libusb_transfer::user_data`
struct InterruptState {
    transfer: NonNull<libusb_transfer>,
    buffer: Box<[u8]>,
    handler: TransferHandler,
    device: Rc<OpenDevice>,
}

impl Drop for InterruptState {
    fn drop(&mut self) {
        self.device
            .in_flight
            .borrow_mut()
            .retain(|t| *t != self.transfer);
        // SAFETY: the transfer is not submitted when its state is dropped.
        unsafe { libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

struct Finished<'a> {
    transfer: NonNull<libusb_transfer>,
    endpoint: u8,
    status: TransferStatus,
    data: &'a [u8],
}

impl CompletedTransfer for Finished<'_> {
    fn endpoint(&self) -> u8 {
        self.endpoint
    }

    fn status(&self) -> TransferStatus {
        self.status
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn resubmit(&mut self) -> Result<(), rusb::Error> {
        // SAFETY: called from the completion callback, where the transfer
        // is idle and still filled in with the same buffer and user data.
        check(unsafe { libusb_submit_transfer(self.transfer.as_ptr()) })
    }
}

extern "system" fn interrupt_finished(transfer: *mut libusb_transfer) {
    if transfer.is_null() {
        return;
    }

    // SAFETY: libusb hands back the transfer we filled in submit_interrupt.
    let (user_data, status, actual_length, endpoint) = unsafe {
        let t = &*transfer;
        (t.user_data, t.status, t.actual_length, t.endpoint)
    };
    let state_ptr = user_data as *mut InterruptState;
    if state_ptr.is_null() {
        return;
    }

    // SAFETY: user_data is the leaked Box<InterruptState> of this transfer
    // and nothing else accesses it while the callback runs.
    let state = unsafe { &mut *state_ptr };
    let disposition = if state.device.closing.get() {
        Disposition::Release
    } else {
        let InterruptState {
            transfer,
            buffer,
            handler,
            ..
        } = state;
        let length = usize::try_from(actual_length)
            .unwrap_or(0)
            .min(buffer.len());
        let mut finished = Finished {
            transfer: *transfer,
            endpoint,
            status: map_transfer_status(status),
            data: &buffer[..length],
        };
        handler(&mut finished as &mut dyn CompletedTransfer)
    };

    if disposition == Disposition::Release {
        // SAFETY: the transfer was not resubmitted, so libusb no longer
        // references it or its buffer.
        drop(unsafe { Box::from_raw(state_ptr) });
    }
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

fn check(rc: c_int) -> Result<(), rusb::Error> {
    if rc >= 0 {
        return Ok(());
    }
    Err(match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_NO_DEVICE),
            TransferStatus::NoDevice
        );
        assert_eq!(map_transfer_status(LIBUSB_TRANSFER_ERROR), TransferStatus::Error);
    }

    #[test]
    fn test_check_error_codes() {
        assert!(check(0).is_ok());
        assert!(check(8).is_ok());
        assert_eq!(check(LIBUSB_ERROR_NO_DEVICE), Err(rusb::Error::NoDevice));
        assert_eq!(check(LIBUSB_ERROR_BUSY), Err(rusb::Error::Busy));
        assert_eq!(check(LIBUSB_ERROR_NO_MEM), Err(rusb::Error::NoMem));
        assert_eq!(check(-1000), Err(rusb::Error::Other));
    }
}
