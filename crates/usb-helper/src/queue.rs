//! Deferred dispatch queue
//!
//! Interrupt completions arrive while libusb is inside its event pump, where
//! caller code must not run. They are parked here and handed out in FIFO
//! order once the pump has returned.

use crate::handle::DeviceHandle;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Caller callback of a read loop
///
/// Receives the handle, the endpoint number without its direction bit, and
/// the report bytes. `None` means the read loop has ended and nothing more
/// will be delivered.
pub type ReadCallback = Rc<RefCell<dyn FnMut(&DeviceHandle, u8, Option<&[u8]>)>>;

/// One completed read waiting for delivery
pub struct Delivery {
    pub(crate) callback: ReadCallback,
    pub(crate) handle: DeviceHandle,
    pub(crate) endpoint: u8,
    pub(crate) data: Option<Vec<u8>>,
}

impl Delivery {
    /// Invoke the callback, consuming the payload
    pub(crate) fn deliver(self) {
        let Delivery {
            callback,
            handle,
            endpoint,
            data,
        } = self;
        (&mut *callback.borrow_mut())(&handle, endpoint, data.as_deref());
    }
}

pub(crate) type SharedQueue = Rc<RefCell<DeferredQueue>>;

pub struct DeferredQueue {
    entries: VecDeque<Delivery>,
    /// Entries carrying a report, as opposed to end-of-loop notices
    reports: usize,
    limit: usize,
    #[cfg(test)]
    fail_reserve: bool,
}

impl DeferredQueue {
    /// Queue holding at most `limit` undelivered reports
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            reports: 0,
            limit,
            #[cfg(test)]
            fail_reserve: false,
        }
    }

    /// Allocate room for `additional` entries so the following pushes
    /// cannot fail
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        #[cfg(test)]
        if self.fail_reserve {
            return Err(Error::OutOfMemory);
        }
        self.entries.try_reserve(additional)?;
        Ok(())
    }

    /// Append an entry; call [`reserve`](Self::reserve) first
    ///
    /// At the report limit the oldest queued report is dropped to make room,
    /// or the new one if no older report is queued. End-of-loop notices are
    /// always kept. Returns how many reports were dropped.
    pub fn push(&mut self, delivery: Delivery) -> usize {
        if delivery.data.is_some() && self.reports >= self.limit {
            match self.entries.iter().position(|d| d.data.is_some()) {
                Some(oldest) => {
                    self.entries.remove(oldest);
                }
                None => return 1,
            }
            self.entries.push_back(delivery);
            return 1;
        }
        if delivery.data.is_some() {
            self.reports += 1;
        }
        self.entries.push_back(delivery);
        0
    }

    /// Drop every pending entry for `handle`, returning how many went
    pub fn discard_handle(&mut self, handle: &DeviceHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|d| d.handle != *handle);
        self.reports = self.entries.iter().filter(|d| d.data.is_some()).count();
        before - self.entries.len()
    }

    /// Take the whole backlog, leaving the queue empty
    pub fn take(&mut self) -> Vec<Delivery> {
        self.reports = 0;
        Vec::from(std::mem::take(&mut self.entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make every following [`reserve`](Self::reserve) fail
    #[cfg(test)]
    pub(crate) fn fail_reserve(&mut self, fail: bool) {
        self.fail_reserve = fail;
    }
}
