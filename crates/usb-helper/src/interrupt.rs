//! Interrupt read loops
//!
//! A libusb read loop is one asynchronous transfer that resubmits itself
//! from its completion handler. The handler runs inside the libusb event
//! pump, so it never calls the caller: it copies the report into the
//! deferred queue, which the mainloop adapter drains after the pump returns.
//!
//! hidapi has no asynchronous reads. Its read loop is a task on the host
//! scheduler that drains every pending report without blocking, hands each
//! one straight to the caller and schedules itself again.

use crate::backend::{CompletedTransfer, Disposition, TransferHandler, TransferStatus};
use crate::handle::{DeviceHandle, Native, WeakHandle};
use crate::mainloop::Mainloop;
use crate::queue::{Delivery, ReadCallback, SharedQueue};
use crate::{Error, Result};
use rusb::constants::{LIBUSB_ENDPOINT_DIR_MASK, LIBUSB_ENDPOINT_IN};
use std::rc::Rc;
use tracing::{debug, error, trace, warn};

/// Where a new read loop delivers to and how it is driven
pub(crate) struct ReadLoopContext<'a> {
    pub(crate) queue: &'a SharedQueue,
    pub(crate) mainloop: &'a Rc<dyn Mainloop>,
    pub(crate) poll_interval: u32,
}

/// Start reading `length`-byte reports from `endpoint`
///
/// On error nothing was submitted or scheduled and `callback` will never
/// be called.
pub(crate) fn start(
    handle: &DeviceHandle,
    endpoint: u8,
    length: usize,
    callback: ReadCallback,
    ctx: ReadLoopContext<'_>,
) -> Result<()> {
    if length == 0 {
        return Err(Error::InvalidLength(length));
    }
    let endpoint = endpoint & !LIBUSB_ENDPOINT_DIR_MASK;

    let native = handle.native()?;
    match &*native {
        Native::Usb(device) => {
            let mut request = InputRequest {
                callback,
                handle: handle.downgrade(),
                endpoint,
                queue: ctx.queue.clone(),
            };
            let handler: TransferHandler = Box::new(move |transfer: &mut dyn CompletedTransfer| {
                request.on_complete(transfer)
            });
            device.submit_interrupt(endpoint | LIBUSB_ENDPOINT_IN, length, handler)?;
            debug!(handle = handle.id(), endpoint, "Started interrupt read loop");
            Ok(())
        }
        #[cfg(feature = "hidapi")]
        Native::Hid(_) => {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(length)?;
            buffer.resize(length, 0);
            HidPoll {
                callback,
                handle: handle.downgrade(),
                endpoint,
                buffer,
                mainloop: Rc::downgrade(ctx.mainloop),
                interval: ctx.poll_interval,
            }
            .schedule();
            debug!(handle = handle.id(), endpoint, "Started report poll loop");
            Ok(())
        }
    }
}

/// State of one libusb read loop, owned by its transfer handler
struct InputRequest {
    callback: ReadCallback,
    handle: WeakHandle,
    /// Endpoint number without the direction bit
    endpoint: u8,
    queue: SharedQueue,
}

impl InputRequest {
    fn on_complete(&mut self, transfer: &mut dyn CompletedTransfer) -> Disposition {
        let Some(handle) = self.handle.upgrade_open() else {
            return Disposition::Release;
        };
        let status = transfer.status();
        if status == TransferStatus::Cancelled {
            debug!(handle = handle.id(), endpoint = self.endpoint, "Read loop cancelled");
            return Disposition::Release;
        }

        // Two slots: the report and a possible end-of-loop notice.
        let reserved = self.queue.borrow_mut().reserve(2);
        if let Err(e) = reserved {
            debug!(handle = handle.id(), "Deferred queue allocation failed: {}", e);
            return self.out_of_memory(&handle);
        }

        if status == TransferStatus::Completed {
            let received = transfer.data();
            let mut data = Vec::new();
            if data.try_reserve_exact(received.len()).is_err() {
                return self.out_of_memory(&handle);
            }
            data.extend_from_slice(received);
            trace!(endpoint = self.endpoint, len = data.len(), "Interrupt report");
            self.enqueue(&handle, Some(data));
        } else {
            debug!(
                handle = handle.id(),
                endpoint = self.endpoint,
                "Interrupt transfer finished with {:?}",
                status
            );
        }

        match transfer.resubmit() {
            Ok(()) => Disposition::Keep,
            Err(e) => {
                error!(
                    handle = handle.id(),
                    endpoint = self.endpoint,
                    "Failed to resubmit interrupt transfer: {}",
                    e
                );
                self.enqueue(&handle, None);
                Disposition::Release
            }
        }
    }

    fn enqueue(&self, handle: &DeviceHandle, data: Option<Vec<u8>>) {
        let delivery = Delivery {
            callback: self.callback.clone(),
            handle: handle.clone(),
            endpoint: self.endpoint,
            data,
        };
        let dropped = self.queue.borrow_mut().push(delivery);
        if dropped > 0 {
            warn!(
                handle = handle.id(),
                endpoint = self.endpoint,
                "Deferred queue full, dropped the oldest undelivered report"
            );
        }
    }

    /// No memory to defer anything: drop what is queued for this device and
    /// end the loop with an immediate notice
    fn out_of_memory(&self, handle: &DeviceHandle) -> Disposition {
        let discarded = self.queue.borrow_mut().discard_handle(handle);
        error!(
            handle = handle.id(),
            endpoint = self.endpoint,
            discarded,
            "Out of memory while reading from device; reconnect the device to recover"
        );
        (&mut *self.callback.borrow_mut())(handle, self.endpoint, None);
        Disposition::Release
    }
}

/// A hidapi read loop between two runs
#[cfg(feature = "hidapi")]
struct HidPoll {
    callback: ReadCallback,
    handle: WeakHandle,
    endpoint: u8,
    buffer: Vec<u8>,
    mainloop: std::rc::Weak<dyn Mainloop>,
    interval: u32,
}

#[cfg(feature = "hidapi")]
impl HidPoll {
    fn schedule(self) {
        if let Some(mainloop) = self.mainloop.upgrade() {
            let interval = self.interval;
            mainloop.schedule(interval, Box::new(move || self.run()));
        }
    }

    fn run(mut self) {
        loop {
            let Some(handle) = self.handle.upgrade_open() else {
                debug!(endpoint = self.endpoint, "Report poll loop ended with its handle");
                return;
            };

            // The borrow must end before the callback, which may close the handle.
            let read = match handle.native().as_deref() {
                Ok(Native::Hid(hid)) => hid.device.read_timeout(&mut self.buffer, 0),
                _ => return,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    let n = n.min(self.buffer.len());
                    (&mut *self.callback.borrow_mut())(&handle, self.endpoint, Some(&self.buffer[..n]));
                }
                Err(e) => {
                    debug!(handle = handle.id(), "Report read failed: {}", e);
                    break;
                }
            }
        }
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UsbBackend;
    use crate::mainloop::Scheduler;
    use crate::queue::DeferredQueue;
    use crate::test_utils::MockUsb;
    use std::cell::RefCell;
    use std::time::Duration;

    type Log = Rc<RefCell<Vec<(u64, Option<Vec<u8>>, bool)>>>;

    fn open(usb: &MockUsb, id: u64, address: u8) -> DeviceHandle {
        usb.add_device(1, address, Vec::new());
        let device = usb.open_device(1, address).unwrap();
        DeviceHandle::new(id, Native::Usb(device))
    }

    fn start_recording(
        usb: &MockUsb,
        handle: &DeviceHandle,
        queue: &SharedQueue,
        mainloop: &Rc<dyn Mainloop>,
    ) -> Log {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let u = usb.clone();
        let callback: ReadCallback = Rc::new(RefCell::new(
            move |h: &DeviceHandle, _: u8, data: Option<&[u8]>| {
                l.borrow_mut().push((h.id(), data.map(<[u8]>::to_vec), u.in_pump()));
            },
        ));
        let ctx = ReadLoopContext {
            queue,
            mainloop,
            poll_interval: 1,
        };
        start(handle, 1, 8, callback, ctx).unwrap();
        log
    }

    #[test]
    fn test_allocation_failure_ends_loop_and_discards_its_backlog() {
        let usb = MockUsb::new();
        let mainloop: Rc<dyn Mainloop> = Rc::new(Scheduler::new(Duration::from_millis(10)));
        let queue: SharedQueue = Rc::new(RefCell::new(DeferredQueue::new(64)));
        let a = open(&usb, 1, 2);
        let b = open(&usb, 2, 3);
        let log_a = start_recording(&usb, &a, &queue, &mainloop);
        let log_b = start_recording(&usb, &b, &queue, &mainloop);

        usb.push_report(1, 2, 1, &[0xa1]);
        usb.push_report(1, 3, 1, &[0xb1]);
        usb.handle_events(Duration::ZERO).unwrap();
        assert_eq!(queue.borrow().len(), 2);

        queue.borrow_mut().fail_reserve(true);
        usb.push_report(1, 2, 1, &[0xa2]);
        usb.handle_events(Duration::ZERO).unwrap();

        assert_eq!(*log_a.borrow(), vec![(1, None, true)]);
        assert!(log_b.borrow().is_empty());
        assert_eq!(usb.in_flight_endpoints(), vec![0x81]);

        queue.borrow_mut().fail_reserve(false);
        for delivery in queue.borrow_mut().take() {
            delivery.deliver();
        }
        assert_eq!(log_a.borrow().len(), 1);
        assert_eq!(*log_b.borrow(), vec![(2, Some(vec![0xb1]), false)]);
    }

    #[test]
    fn test_full_queue_keeps_every_loop_running() {
        let usb = MockUsb::new();
        let mainloop: Rc<dyn Mainloop> = Rc::new(Scheduler::new(Duration::from_millis(10)));
        let queue: SharedQueue = Rc::new(RefCell::new(DeferredQueue::new(2)));
        let a = open(&usb, 1, 2);
        let log_a = start_recording(&usb, &a, &queue, &mainloop);

        for byte in 1..=4u8 {
            usb.push_report(1, 2, 1, &[byte]);
        }
        usb.handle_events(Duration::ZERO).unwrap();

        assert!(log_a.borrow().is_empty());
        assert_eq!(usb.in_flight(), 1);
        for delivery in queue.borrow_mut().take() {
            delivery.deliver();
        }
        let data: Vec<_> = log_a.borrow().iter().map(|e| e.1.clone()).collect();
        assert_eq!(data, vec![Some(vec![3]), Some(vec![4])]);
    }
}
