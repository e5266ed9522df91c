//! Device handle
//!
//! A [`DeviceHandle`] wraps exactly one native device from one backend. The
//! handle is reference counted so read loops can hold a weak back-reference
//! and pass the handle to their callbacks. The native device is released by
//! [`DeviceHandle::close`], or when the last clone goes away.

use crate::backend::UsbDevice;
#[cfg(feature = "hidapi")]
use crate::backend::HidDevice;
use crate::{Error, Result};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Which backend a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// libusb: raw control and interrupt transfers
    Usb,
    /// hidapi: report-level access
    #[cfg(feature = "hidapi")]
    Hidapi,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Usb => write!(f, "usb"),
            #[cfg(feature = "hidapi")]
            Subsystem::Hidapi => write!(f, "hidapi"),
        }
    }
}

/// The native device behind an open handle
pub(crate) enum Native {
    Usb(Box<dyn UsbDevice>),
    #[cfg(feature = "hidapi")]
    Hid(HidHandle),
}

#[cfg(feature = "hidapi")]
pub(crate) struct HidHandle {
    pub(crate) device: Box<dyn HidDevice>,
    /// Interface of a composite device, if the path told us
    pub(crate) interface: Option<u16>,
}

struct HandleInner {
    id: u64,
    subsystem: Subsystem,
    native: RefCell<Option<Native>>,
}

/// An open connection to one device
#[derive(Clone)]
pub struct DeviceHandle(Rc<HandleInner>);

/// Non-owning reference held by read loops
#[derive(Clone)]
pub(crate) struct WeakHandle(Weak<HandleInner>);

impl DeviceHandle {
    pub(crate) fn new(id: u64, native: Native) -> Self {
        let subsystem = match &native {
            Native::Usb(_) => Subsystem::Usb,
            #[cfg(feature = "hidapi")]
            Native::Hid(_) => Subsystem::Hidapi,
        };
        Self(Rc::new(HandleInner {
            id,
            subsystem,
            native: RefCell::new(Some(native)),
        }))
    }

    /// Helper-unique id, stable for the life of the handle
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn subsystem(&self) -> Subsystem {
        self.0.subsystem
    }

    pub fn is_open(&self) -> bool {
        self.0.native.borrow().is_some()
    }

    /// Composite interface a hidapi handle was opened for
    ///
    /// Always `None` for libusb handles.
    pub fn interface_index(&self) -> Option<u16> {
        match &*self.0.native.borrow() {
            #[cfg(feature = "hidapi")]
            Some(Native::Hid(hid)) => hid.interface,
            _ => None,
        }
    }

    /// Release the native device
    ///
    /// Read loops on this handle end: libusb transfers are cancelled and
    /// hidapi polling stops on its next run. Returns `false` if the handle
    /// was already closed.
    pub fn close(&self) -> bool {
        let native = self.0.native.borrow_mut().take();
        match native {
            Some(native) => {
                drop(native);
                debug!("Closed {} device handle {}", self.0.subsystem, self.0.id);
                true
            }
            None => {
                warn!("Device handle {} closed twice", self.0.id);
                false
            }
        }
    }

    /// Shared access to the native device
    pub(crate) fn native(&self) -> Result<Ref<'_, Native>> {
        Ref::filter_map(self.0.native.borrow(), Option::as_ref).map_err(|_| Error::Closed)
    }

    /// Exclusive access to the native device
    pub(crate) fn native_mut(&self) -> Result<RefMut<'_, Native>> {
        RefMut::filter_map(self.0.native.borrow_mut(), Option::as_mut).map_err(|_| Error::Closed)
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle(Rc::downgrade(&self.0))
    }
}

impl WeakHandle {
    /// The handle, if it still exists and is open
    pub(crate) fn upgrade_open(&self) -> Option<DeviceHandle> {
        self.0
            .upgrade()
            .map(DeviceHandle)
            .filter(DeviceHandle::is_open)
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DeviceHandle {}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.0.id)
            .field("subsystem", &self.0.subsystem)
            .field("open", &self.is_open())
            .finish()
    }
}
