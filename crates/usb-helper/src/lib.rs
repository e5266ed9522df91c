//! USB and HID device access for the input daemon
//!
//! One [`DeviceHandle`] type covers devices opened through libusb and, with
//! the `hidapi` feature, through hidapi. On top of it the helper provides
//! interface claiming, HID feature-report exchanges and interrupt read
//! loops that deliver reports on the daemon's own mainloop.
//!
//! Everything runs on one thread. libusb completions are parked in a
//! deferred queue while the libusb event pump runs and handed to callbacks
//! once it has returned, so a callback may start new I/O freely.
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//! use usb_helper::{HelperSettings, InterfaceClass, Mainloop, Scheduler, UsbHelper};
//!
//! # fn main() -> usb_helper::Result<()> {
//! let scheduler = Rc::new(Scheduler::new(Duration::from_millis(10)));
//! let helper = UsbHelper::init(scheduler.clone(), HelperSettings::default())?;
//! let handle = helper.open("/sys/bus/usb/devices/3-2")?;
//! helper.claim_interfaces_by(&handle, InterfaceClass { class: 3, subclass: 0, protocol: 0 });
//! helper.interrupt_read_loop(&handle, 1, 64, |_, endpoint, report| {
//!     println!("endpoint {}: {:?}", endpoint, report);
//! })?;
//! loop {
//!     scheduler.tick();
//!     std::thread::sleep(scheduler.sleep_time());
//! }
//! # }
//! ```

pub mod backend;
pub mod claim;
pub mod context;
pub mod error;
pub mod handle;
mod interrupt;
pub mod mainloop;
pub mod path;
pub mod queue;
pub mod report;
pub mod settings;
pub mod test_utils;

pub use claim::InterfaceClass;
pub use context::UsbHelper;
pub use error::{Error, Result};
pub use handle::{DeviceHandle, Subsystem};
pub use mainloop::{HookId, Mainloop, Scheduler};
pub use queue::ReadCallback;
pub use settings::HelperSettings;
