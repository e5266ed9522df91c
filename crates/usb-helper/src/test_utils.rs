//! Simulated backends for tests
//!
//! [`MockUsb`] and [`MockHid`] implement the backend traits over shared
//! in-memory state. A test keeps a clone of each to script device behaviour
//! and to inspect what the helper did.
//!
//! # Example
//!
//! ```
//! use usb_helper::backend::ConfigSummary;
//! use usb_helper::test_utils::MockUsb;
//!
//! let usb = MockUsb::new();
//! usb.add_device(1, 4, vec![ConfigSummary::default()]);
//! assert!(usb.open_device(1, 4).is_some());
//! assert!(usb.open_device(1, 5).is_none());
//! ```

use crate::backend::{
    AttachedDevice, Backends, CompletedTransfer, ConfigSummary, Disposition, TransferHandler,
    TransferStatus, UsbBackend, UsbDevice,
};
#[cfg(feature = "hidapi")]
use crate::backend::{HidBackend, HidDevice};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Build helper backends over the given mocks
#[cfg(feature = "hidapi")]
pub fn mock_backends(usb: &MockUsb, hid: &MockHid) -> Backends {
    Backends {
        usb: Box::new(usb.clone()),
        hid: Box::new(hid.clone()),
    }
}

/// Build helper backends over the given mock
#[cfg(not(feature = "hidapi"))]
pub fn mock_backends(usb: &MockUsb) -> Backends {
    Backends {
        usb: Box::new(usb.clone()),
    }
}

/// One control transfer seen by a [`MockUsb`] device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub bus: u8,
    pub address: u8,
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Payload of an outgoing transfer; empty for incoming ones
    pub data: Vec<u8>,
    pub length: usize,
    pub timeout: Duration,
}

struct DeviceState {
    bus: u8,
    address: u8,
    configs: Vec<ConfigSummary>,
    open_fails: bool,
    claim_failures: Vec<u8>,
    claimed: Vec<u8>,
    detached: Vec<u8>,
    auto_detach: bool,
}

struct Transfer {
    instance: u64,
    bus: u8,
    address: u8,
    endpoint: u8,
    length: usize,
    handler: TransferHandler,
    cancelled: bool,
}

struct Event {
    bus: u8,
    address: u8,
    endpoint: u8,
    status: TransferStatus,
    data: Vec<u8>,
}

impl Transfer {
    fn targets(&self, event: &Event) -> bool {
        !self.cancelled
            && self.bus == event.bus
            && self.address == event.address
            && self.endpoint & 0x7f == event.endpoint & 0x7f
    }
}

#[derive(Default)]
struct UsbState {
    devices: Vec<DeviceState>,
    open_instances: Vec<u64>,
    next_instance: u64,
    controls: Vec<ControlRecord>,
    control_response: Vec<u8>,
    failing_requests: Vec<u8>,
    transfers: Vec<Transfer>,
    events: VecDeque<Event>,
    submissions: usize,
    failing_resubmits: usize,
    fail_submit: bool,
    fail_events: bool,
    in_pump: bool,
    pumps: usize,
    last_pump_timeout: Option<Duration>,
}

impl UsbState {
    fn device_mut(&mut self, bus: u8, address: u8) -> Option<&mut DeviceState> {
        self.devices
            .iter_mut()
            .find(|d| d.bus == bus && d.address == address)
    }

    fn device(&self, bus: u8, address: u8) -> Option<&DeviceState> {
        self.devices
            .iter()
            .find(|d| d.bus == bus && d.address == address)
    }
}

/// In-memory libusb
///
/// Interrupt transfers complete only inside [`UsbBackend::handle_events`],
/// in the order their events were pushed.
#[derive(Clone, Default)]
pub struct MockUsb {
    state: Rc<RefCell<UsbState>>,
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with the given configuration descriptors
    pub fn add_device(&self, bus: u8, address: u8, configs: Vec<ConfigSummary>) {
        self.state.borrow_mut().devices.push(DeviceState {
            bus,
            address,
            configs,
            open_fails: false,
            claim_failures: Vec::new(),
            claimed: Vec::new(),
            detached: Vec::new(),
            auto_detach: false,
        });
    }

    /// Make opening the device fail with `Access`
    pub fn fail_open(&self, bus: u8, address: u8) {
        if let Some(device) = self.state.borrow_mut().device_mut(bus, address) {
            device.open_fails = true;
        }
    }

    /// Make claiming `interface` on the device fail with `Busy`
    pub fn fail_claim(&self, bus: u8, address: u8, interface: u8) {
        if let Some(device) = self.state.borrow_mut().device_mut(bus, address) {
            device.claim_failures.push(interface);
        }
    }

    /// Interfaces claimed on the device, in claim order
    pub fn claimed(&self, bus: u8, address: u8) -> Vec<u8> {
        self.state
            .borrow()
            .device(bus, address)
            .map(|d| d.claimed.clone())
            .unwrap_or_default()
    }

    /// Interfaces a kernel-driver detach was requested for
    pub fn detached(&self, bus: u8, address: u8) -> Vec<u8> {
        self.state
            .borrow()
            .device(bus, address)
            .map(|d| d.detached.clone())
            .unwrap_or_default()
    }

    /// Whether automatic kernel-driver detach was enabled on the device
    pub fn auto_detach(&self, bus: u8, address: u8) -> bool {
        self.state
            .borrow()
            .device(bus, address)
            .is_some_and(|d| d.auto_detach)
    }

    /// Open a device directly, bypassing the helper
    pub fn open_device(&self, bus: u8, address: u8) -> Option<Box<dyn UsbDevice>> {
        self.state.borrow().device(bus, address)?;
        Some(self.open_instance(bus, address))
    }

    fn open_instance(&self, bus: u8, address: u8) -> Box<dyn UsbDevice> {
        let mut state = self.state.borrow_mut();
        state.next_instance += 1;
        let instance = state.next_instance;
        state.open_instances.push(instance);
        Box::new(MockDevice {
            state: self.state.clone(),
            bus,
            address,
            instance,
        })
    }

    /// Every control transfer so far
    pub fn controls(&self) -> Vec<ControlRecord> {
        self.state.borrow().controls.clone()
    }

    /// Bytes returned by incoming control transfers
    pub fn set_control_response(&self, data: &[u8]) {
        self.state.borrow_mut().control_response = data.to_vec();
    }

    /// Make control transfers with this request code fail with `Pipe`
    pub fn fail_control(&self, request: u8) {
        self.state.borrow_mut().failing_requests.push(request);
    }

    /// Make new interrupt submissions fail with `Io`
    pub fn fail_submit(&self, fail: bool) {
        self.state.borrow_mut().fail_submit = fail;
    }

    /// Make the next `count` resubmissions fail with `Io`
    pub fn fail_resubmits(&self, count: usize) {
        self.state.borrow_mut().failing_resubmits = count;
    }

    /// Make event handling fail with `Io`
    pub fn fail_events(&self, fail: bool) {
        self.state.borrow_mut().fail_events = fail;
    }

    /// Complete the transfer on `endpoint` with `data` during the next pump
    pub fn push_report(&self, bus: u8, address: u8, endpoint: u8, data: &[u8]) {
        self.push_event(bus, address, endpoint, TransferStatus::Completed, data.to_vec());
    }

    /// Finish the transfer on `endpoint` with `status` during the next pump
    pub fn push_status(&self, bus: u8, address: u8, endpoint: u8, status: TransferStatus) {
        self.push_event(bus, address, endpoint, status, Vec::new());
    }

    fn push_event(&self, bus: u8, address: u8, endpoint: u8, status: TransferStatus, data: Vec<u8>) {
        self.state.borrow_mut().events.push_back(Event {
            bus,
            address,
            endpoint,
            status,
            data,
        });
    }

    /// Transfers currently submitted and not cancelled
    pub fn in_flight(&self) -> usize {
        self.state
            .borrow()
            .transfers
            .iter()
            .filter(|t| !t.cancelled)
            .count()
    }

    /// Endpoint addresses of the transfers in flight
    pub fn in_flight_endpoints(&self) -> Vec<u8> {
        self.state
            .borrow()
            .transfers
            .iter()
            .filter(|t| !t.cancelled)
            .map(|t| t.endpoint)
            .collect()
    }

    /// Submissions and successful resubmissions so far
    pub fn submissions(&self) -> usize {
        self.state.borrow().submissions
    }

    /// True only while `handle_events` runs
    pub fn in_pump(&self) -> bool {
        self.state.borrow().in_pump
    }

    /// Number of `handle_events` calls
    pub fn pumps(&self) -> usize {
        self.state.borrow().pumps
    }

    /// Timeout passed to the most recent `handle_events` call
    pub fn last_pump_timeout(&self) -> Option<Duration> {
        self.state.borrow().last_pump_timeout
    }

    /// Next transfer to finish: cancellations first, then pushed events
    fn next_completion(&self) -> Option<(Transfer, TransferStatus, Vec<u8>)> {
        let mut state = self.state.borrow_mut();
        if let Some(pos) = state.transfers.iter().position(|t| t.cancelled) {
            let transfer = state.transfers.remove(pos);
            return Some((transfer, TransferStatus::Cancelled, Vec::new()));
        }
        while let Some(event) = state.events.pop_front() {
            if let Some(pos) = state.transfers.iter().position(|t| t.targets(&event)) {
                let transfer = state.transfers.remove(pos);
                let mut data = event.data;
                data.truncate(transfer.length);
                return Some((transfer, event.status, data));
            }
        }
        None
    }

    fn complete(&self, mut transfer: Transfer, status: TransferStatus, data: Vec<u8>) {
        let mut finished = MockFinished {
            state: &self.state,
            instance: transfer.instance,
            endpoint: transfer.endpoint,
            status,
            data: &data,
            resubmitted: false,
        };
        let disposition = (transfer.handler)(&mut finished as &mut dyn CompletedTransfer);
        if finished.resubmitted && disposition == Disposition::Keep {
            self.state.borrow_mut().transfers.push(transfer);
        } else {
            // Dropped outside any borrow: the handler may own the last
            // reference to a device.
            drop(transfer);
        }
    }
}

impl UsbBackend for MockUsb {
    fn devices(&self) -> Result<Vec<Box<dyn AttachedDevice>>, rusb::Error> {
        Ok(self
            .state
            .borrow()
            .devices
            .iter()
            .map(|d| {
                Box::new(MockAttached {
                    usb: self.clone(),
                    bus: d.bus,
                    address: d.address,
                }) as Box<dyn AttachedDevice>
            })
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error> {
        {
            let mut state = self.state.borrow_mut();
            state.pumps += 1;
            state.last_pump_timeout = Some(timeout);
            if state.fail_events {
                return Err(rusb::Error::Io);
            }
            state.in_pump = true;
        }
        while let Some((transfer, status, data)) = self.next_completion() {
            self.complete(transfer, status, data);
        }
        self.state.borrow_mut().in_pump = false;
        Ok(())
    }
}

struct MockAttached {
    usb: MockUsb,
    bus: u8,
    address: u8,
}

impl AttachedDevice for MockAttached {
    fn bus_number(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn open(&self) -> Result<Box<dyn UsbDevice>, rusb::Error> {
        let fails = self
            .usb
            .state
            .borrow()
            .device(self.bus, self.address)
            .is_none_or(|d| d.open_fails);
        if fails {
            return Err(rusb::Error::Access);
        }
        Ok(self.usb.open_instance(self.bus, self.address))
    }
}

struct MockDevice {
    state: Rc<RefCell<UsbState>>,
    bus: u8,
    address: u8,
    instance: u64,
}

impl MockDevice {
    fn with_device<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> Result<T, rusb::Error> {
        let mut state = self.state.borrow_mut();
        let device = state
            .device_mut(self.bus, self.address)
            .ok_or(rusb::Error::NoDevice)?;
        Ok(f(device))
    }

    fn record_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        length: usize,
        timeout: Duration,
    ) -> Result<(), rusb::Error> {
        let mut state = self.state.borrow_mut();
        state.controls.push(ControlRecord {
            bus: self.bus,
            address: self.address,
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
            length,
            timeout,
        });
        if state.failing_requests.contains(&request) {
            return Err(rusb::Error::Pipe);
        }
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.open_instances.retain(|i| *i != self.instance);
        for transfer in state.transfers.iter_mut() {
            if transfer.instance == self.instance {
                transfer.cancelled = true;
            }
        }
    }
}

impl UsbDevice for MockDevice {
    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> Result<(), rusb::Error> {
        self.with_device(|d| d.auto_detach = enable)
    }

    fn config_descriptor(&self, index: u8) -> Result<ConfigSummary, rusb::Error> {
        self.with_device(|d| d.configs.get(usize::from(index)).cloned())?
            .ok_or(rusb::Error::NotFound)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.with_device(|d| {
            if d.claim_failures.contains(&interface) {
                Err(rusb::Error::Busy)
            } else {
                d.claimed.push(interface);
                Ok(())
            }
        })?
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.with_device(|d| d.detached.push(interface))?;
        // Auto-detach already took the driver away.
        Err(rusb::Error::NotFound)
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
        self.record_control(request_type, request, value, index, data, data.len(), timeout)?;
        Ok(data.len())
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
        self.record_control(request_type, request, value, index, &[], buf.len(), timeout)?;
        let state = self.state.borrow();
        let n = state.control_response.len().min(buf.len());
        buf[..n].copy_from_slice(&state.control_response[..n]);
        Ok(n)
    }

    fn submit_interrupt(
        &self,
        endpoint: u8,
        length: usize,
        handler: TransferHandler,
    ) -> Result<(), rusb::Error> {
        let mut state = self.state.borrow_mut();
        if state.fail_submit {
            return Err(rusb::Error::Io);
        }
        state.transfers.push(Transfer {
            instance: self.instance,
            bus: self.bus,
            address: self.address,
            endpoint,
            length,
            handler,
            cancelled: false,
        });
        state.submissions += 1;
        Ok(())
    }
}

struct MockFinished<'a> {
    state: &'a RefCell<UsbState>,
    instance: u64,
    endpoint: u8,
    status: TransferStatus,
    data: &'a [u8],
    resubmitted: bool,
}

impl CompletedTransfer for MockFinished<'_> {
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
        let mut state = self.state.borrow_mut();
        if state.failing_resubmits > 0 {
            state.failing_resubmits -= 1;
            return Err(rusb::Error::Io);
        }
        if !state.open_instances.contains(&self.instance) {
            return Err(rusb::Error::NoDevice);
        }
        state.submissions += 1;
        self.resubmitted = true;
        Ok(())
    }
}

#[cfg(feature = "hidapi")]
#[derive(Default)]
struct HidState {
    paths: Vec<String>,
    opened: Vec<String>,
    closed: usize,
    written: Vec<Vec<u8>>,
    features_sent: Vec<Vec<u8>>,
    feature_response: Vec<u8>,
    feature_calls: usize,
    fail_features: bool,
    reads: VecDeque<Vec<u8>>,
    read_calls: usize,
}

/// In-memory hidapi
#[cfg(feature = "hidapi")]
#[derive(Clone, Default)]
pub struct MockHid {
    state: Rc<RefCell<HidState>>,
}

#[cfg(feature = "hidapi")]
impl MockHid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `path` openable
    pub fn add_path(&self, path: &str) {
        self.state.borrow_mut().paths.push(path.to_string());
    }

    /// Native paths opened so far
    pub fn opened(&self) -> Vec<String> {
        self.state.borrow().opened.clone()
    }

    /// Number of devices closed so far
    pub fn closed(&self) -> usize {
        self.state.borrow().closed
    }

    /// Output reports written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.borrow().written.clone()
    }

    /// Feature reports sent so far, report id byte included
    pub fn features_sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().features_sent.clone()
    }

    /// Payload returned after the report id by feature-report reads
    pub fn set_feature_response(&self, data: &[u8]) {
        self.state.borrow_mut().feature_response = data.to_vec();
    }

    /// Make feature-report calls fail
    pub fn fail_features(&self, fail: bool) {
        self.state.borrow_mut().fail_features = fail;
    }

    /// Feature-report sends and gets attempted so far
    pub fn feature_calls(&self) -> usize {
        self.state.borrow().feature_calls
    }

    /// Queue an input report for `read_timeout`
    pub fn push_input(&self, data: &[u8]) {
        self.state.borrow_mut().reads.push_back(data.to_vec());
    }

    /// Number of `read_timeout` calls
    pub fn read_calls(&self) -> usize {
        self.state.borrow().read_calls
    }
}

#[cfg(feature = "hidapi")]
impl HidBackend for MockHid {
    fn open_path(&self, path: &str) -> crate::Result<Box<dyn HidDevice>> {
        let mut state = self.state.borrow_mut();
        if !state.paths.iter().any(|p| p == path) {
            return Err(crate::Error::Hid(format!("no device at {}", path)));
        }
        state.opened.push(path.to_string());
        Ok(Box::new(MockHidDevice {
            state: self.state.clone(),
        }))
    }
}

#[cfg(feature = "hidapi")]
struct MockHidDevice {
    state: Rc<RefCell<HidState>>,
}

#[cfg(feature = "hidapi")]
impl Drop for MockHidDevice {
    fn drop(&mut self) {
        self.state.borrow_mut().closed += 1;
    }
}

#[cfg(feature = "hidapi")]
impl HidDevice for MockHidDevice {
    fn write(&self, data: &[u8]) -> crate::Result<usize> {
        self.state.borrow_mut().written.push(data.to_vec());
        Ok(data.len())
    }

    fn send_feature_report(&self, data: &[u8]) -> crate::Result<()> {
        let mut state = self.state.borrow_mut();
        state.feature_calls += 1;
        if state.fail_features {
            return Err(crate::Error::Hid("feature report failed".to_string()));
        }
        state.features_sent.push(data.to_vec());
        Ok(())
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> crate::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.feature_calls += 1;
        if state.fail_features {
            return Err(crate::Error::Hid("feature report failed".to_string()));
        }
        let Some(payload) = buf.get_mut(1..) else {
            return Ok(0);
        };
        let n = state.feature_response.len().min(payload.len());
        payload[..n].copy_from_slice(&state.feature_response[..n]);
        Ok(n + 1)
    }

    fn read_timeout(&self, buf: &mut [u8], _timeout_ms: i32) -> crate::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.read_calls += 1;
        match state.reads.pop_front() {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}
