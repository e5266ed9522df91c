//! Helper context and mainloop adapter
//!
//! [`UsbHelper`] owns both native backends and the deferred queue. Creating
//! it registers a tick hook with the host mainloop; every tick the hook
//! pumps libusb events and then hands queued reads to their callbacks.

use crate::backend::Backends;
use crate::claim::{self, InterfaceClass};
use crate::handle::{DeviceHandle, Native};
use crate::interrupt::{self, ReadLoopContext};
use crate::mainloop::{HookId, Mainloop};
use crate::queue::{DeferredQueue, ReadCallback, SharedQueue};
use crate::settings::HelperSettings;
use crate::{Error, Result, path, report};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// USB and HID device access for one daemon
pub struct UsbHelper {
    shared: Rc<Shared>,
    hook: HookId,
}

struct Shared {
    backends: Backends,
    settings: HelperSettings,
    queue: SharedQueue,
    mainloop: Rc<dyn Mainloop>,
    next_handle: Cell<u64>,
}

impl UsbHelper {
    /// Initialize libusb and hidapi and hook into `mainloop`
    ///
    /// Fails if either library cannot be initialized.
    pub fn init(mainloop: Rc<dyn Mainloop>, settings: HelperSettings) -> Result<Self> {
        let backends = Backends::system()?;
        Ok(Self::with_backends(mainloop, settings, backends))
    }

    /// Build a helper on already initialized backends
    pub fn with_backends(
        mainloop: Rc<dyn Mainloop>,
        settings: HelperSettings,
        backends: Backends,
    ) -> Self {
        let shared = Rc::new(Shared {
            backends,
            queue: Rc::new(RefCell::new(DeferredQueue::new(settings.deferred_queue_limit))),
            settings,
            mainloop: mainloop.clone(),
            next_handle: Cell::new(1),
        });

        let weak = Rc::downgrade(&shared);
        let hook = mainloop.add_tick_hook(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.pump();
            }
        }));

        info!("USB helper initialized");
        Self { shared, hook }
    }

    pub fn settings(&self) -> &HelperSettings {
        &self.shared.settings
    }

    /// Open the device behind a monitor-supplied path
    pub fn open(&self, syspath: &str) -> Result<DeviceHandle> {
        #[cfg(feature = "hidapi")]
        if let Some(native_path) = path::hidapi_native_path(syspath) {
            return self.open_hid(&native_path);
        }

        let (bus, address) = path::usb_address(syspath).ok_or_else(|| {
            error!("Failed to determine device address for '{}'", syspath);
            Error::Address(syspath.to_string())
        })?;

        let devices = self.shared.backends.usb.devices().inspect_err(|e| {
            error!("Failed to list USB devices: {}", e);
        })?;
        let Some(attached) = devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
        else {
            error!("Device {} on bus {} not found", address, bus);
            return Err(Error::NotFound { bus, address });
        };

        let mut device = attached.open().inspect_err(|e| {
            error!("Failed to open device {} on bus {}: {}", address, bus, e);
        })?;
        if let Err(e) = device.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        let handle = DeviceHandle::new(self.shared.next_id(), Native::Usb(device));
        info!(bus, address, handle = handle.id(), "Opened USB device");
        Ok(handle)
    }

    #[cfg(feature = "hidapi")]
    fn open_hid(&self, native_path: &str) -> Result<DeviceHandle> {
        let device = self.shared.backends.hid.open_path(native_path).inspect_err(|e| {
            error!("Failed to open device {}: {}", native_path, e);
        })?;
        let interface = path::interface_index(native_path);
        let handle = DeviceHandle::new(
            self.shared.next_id(),
            Native::Hid(crate::handle::HidHandle { device, interface }),
        );
        info!(handle = handle.id(), ?interface, "Opened HID device {}", native_path);
        Ok(handle)
    }

    /// Close a handle, dropping reads still queued for it
    pub fn close(&self, handle: &DeviceHandle) -> bool {
        let discarded = self.shared.queue.borrow_mut().discard_handle(handle);
        if discarded > 0 {
            debug!(handle = handle.id(), discarded, "Dropped undelivered reads");
        }
        handle.close()
    }

    /// Claim every interface matching `wanted`; returns how many were claimed
    pub fn claim_interfaces_by(&self, handle: &DeviceHandle, wanted: InterfaceClass) -> usize {
        claim::claim_interfaces_by(handle, wanted)
    }

    /// Send an output report; errors are logged, not returned
    pub fn hid_write(&self, handle: &DeviceHandle, index: u16, data: &[u8]) {
        report::write(handle, index, data, self.shared.settings.control_timeout());
    }

    /// Feature-report round trip returning the answer in a new buffer
    pub fn hid_request(&self, handle: &DeviceHandle, index: u16, data: &[u8]) -> Result<Vec<u8>> {
        report::request(handle, index, data, self.shared.settings.control_timeout())
    }

    /// Feature-report round trip overwriting `buf` with the answer
    pub fn hid_request_in_place(
        &self,
        handle: &DeviceHandle,
        index: u16,
        buf: &mut [u8],
    ) -> Result<()> {
        report::request_in_place(handle, index, buf, self.shared.settings.control_timeout())
    }

    /// Keep reading `length`-byte reports from `endpoint` until the handle
    /// is closed
    ///
    /// `callback` gets the handle, the endpoint number and each report. A
    /// final `None` report means the loop ended on its own. libusb reads
    /// are delivered on the tick after they arrive, hidapi reads as soon as
    /// the poll task finds them.
    pub fn interrupt_read_loop<F>(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        length: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&DeviceHandle, u8, Option<&[u8]>) + 'static,
    {
        let callback: ReadCallback = Rc::new(RefCell::new(callback));
        interrupt::start(
            handle,
            endpoint,
            length,
            callback,
            ReadLoopContext {
                queue: &self.shared.queue,
                mainloop: &self.shared.mainloop,
                poll_interval: self.shared.settings.hid_poll_interval(),
            },
        )
        .inspect_err(|e| error!(handle = handle.id(), endpoint, "Failed to start read loop: {}", e))
    }

    /// Run one iteration of the mainloop adapter by hand
    ///
    /// The registered tick hook does the same thing.
    pub fn pump(&self) {
        self.shared.pump();
    }

    /// Reads waiting for the next tick
    pub fn pending_deliveries(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Unhook from the mainloop, drop hidapi, then release libusb
    pub fn shutdown(self) {
        self.shared.mainloop.remove_tick_hook(self.hook);
        match Rc::try_unwrap(self.shared) {
            Ok(shared) => {
                let pending = shared.queue.borrow_mut().take();
                if !pending.is_empty() {
                    debug!("Dropping {} undelivered read(s)", pending.len());
                }
                drop(pending);
                shared.backends.shutdown();
                info!("USB helper shut down");
            }
            Err(_) => warn!("USB helper still in use at shutdown; backends left to drop"),
        }
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        id
    }

    fn pump(&self) {
        let timeout = if cfg!(target_os = "linux") {
            Duration::ZERO
        } else {
            self.mainloop.sleep_time()
        };
        if let Err(e) = self.backends.usb.handle_events(timeout) {
            warn!("Failed to handle USB events: {}", e);
        }
        self.dispatch_deferred();
    }

    /// Deliver everything the pump queued, oldest first
    fn dispatch_deferred(&self) {
        let batch = self.queue.borrow_mut().take();
        if batch.is_empty() {
            return;
        }
        trace!("Delivering {} deferred read(s)", batch.len());
        for delivery in batch {
            if delivery.handle.is_open() {
                delivery.deliver();
            }
        }
    }
}
