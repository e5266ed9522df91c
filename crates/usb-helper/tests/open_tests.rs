//! Device open/close tests
//!
//! # Test Scenarios
//! - Opening libusb devices by sysfs and synthetic paths
//! - Not-found versus unparsable paths
//! - Opening hidapi devices and recording their interface
//! - Closing handles
//!
//! Run with: `cargo test -p usb-helper --test open_tests`

#![cfg(feature = "hidapi")]

use std::fs;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;
use usb_helper::backend::ConfigSummary;
use usb_helper::path::hidapi_native_path;
use usb_helper::test_utils::{MockHid, MockUsb, mock_backends};
use usb_helper::{Error, HelperSettings, Scheduler, Subsystem, UsbHelper};

fn setup() -> (UsbHelper, MockUsb, MockHid) {
    let scheduler = Rc::new(Scheduler::new(Duration::from_millis(10)));
    let usb = MockUsb::new();
    let hid = MockHid::new();
    let helper = UsbHelper::with_backends(
        scheduler,
        HelperSettings::default(),
        mock_backends(&usb, &hid),
    );
    (helper, usb, hid)
}

fn sysfs_device(bus: u8, address: u8) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("busnum"), format!("{}\n", bus)).unwrap();
    fs::write(dir.path().join("devnum"), format!("{}\n", address)).unwrap();
    dir
}

// ============================================================================
// libusb
// ============================================================================

#[test]
fn test_open_by_sysfs_path() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 5, vec![ConfigSummary::default()]);
    usb.add_device(3, 7, vec![ConfigSummary::default()]);

    let dir = sysfs_device(3, 7);
    let handle = helper.open(dir.path().to_str().unwrap()).unwrap();

    assert_eq!(handle.subsystem(), Subsystem::Usb);
    assert!(handle.is_open());
    assert_eq!(handle.interface_index(), None);
    assert!(usb.auto_detach(3, 7));
    assert!(!usb.auto_detach(1, 5));
}

#[test]
fn test_open_by_synthetic_path() {
    let (helper, usb, _hid) = setup();
    usb.add_device(0x1a, 0x0b, vec![ConfigSummary::default()]);

    let handle = helper.open("/win32/usb/1a/b").unwrap();
    assert_eq!(handle.subsystem(), Subsystem::Usb);
}

#[test]
fn test_every_attached_device_opens() {
    let (helper, usb, _hid) = setup();
    let addresses = [(1u8, 1u8), (1, 2), (2, 1), (4, 127)];
    for (bus, address) in addresses {
        usb.add_device(bus, address, Vec::new());
    }

    let mut ids = Vec::new();
    for (bus, address) in addresses {
        let handle = helper
            .open(&format!("/win32/usb/{:x}/{:x}", bus, address))
            .unwrap();
        assert_eq!(handle.subsystem(), Subsystem::Usb);
        ids.push(handle.id());
    }
    ids.dedup();
    assert_eq!(ids.len(), addresses.len());
}

#[test]
fn test_absent_device_is_not_found() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, Vec::new());

    for path in ["/win32/usb/1/3", "/win32/usb/2/2"] {
        match helper.open(path) {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound for {}, got {:?}", path, other.map(|h| h.id())),
        }
    }

    let dir = sysfs_device(9, 9);
    assert!(matches!(
        helper.open(dir.path().to_str().unwrap()),
        Err(Error::NotFound { bus: 9, address: 9 })
    ));
}

#[test]
fn test_unparsable_path() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, Vec::new());

    let empty = tempfile::tempdir().unwrap();
    assert!(matches!(
        helper.open(empty.path().to_str().unwrap()),
        Err(Error::Address(_))
    ));
    assert!(matches!(helper.open("/win32/usb/zz"), Err(Error::Address(_))));
    assert!(matches!(helper.open("/win32/usb/101/2"), Err(Error::Address(_))));
}

#[test]
fn test_open_failure_is_reported() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, Vec::new());
    usb.fail_open(1, 2);

    assert!(matches!(
        helper.open("/win32/usb/1/2"),
        Err(Error::Usb(rusb::Error::Access))
    ));
}

// ============================================================================
// hidapi
// ============================================================================

#[test]
fn test_open_hidapi_composite_interface() {
    let (helper, _usb, hid) = setup();
    let path = "/hidapi/hid#vid_28de&pid_1142&mi_02#7&2e";
    let native = hidapi_native_path(path).unwrap();
    hid.add_path(&native);

    let handle = helper.open(path).unwrap();
    assert_eq!(handle.subsystem(), Subsystem::Hidapi);
    assert_eq!(handle.interface_index(), Some(2));
    assert_eq!(hid.opened(), vec![native]);
}

#[test]
fn test_open_hidapi_without_interface() {
    let (helper, _usb, hid) = setup();
    let path = "/hidapi/dev/hidraw4";
    hid.add_path(&hidapi_native_path(path).unwrap());

    let handle = helper.open(path).unwrap();
    assert_eq!(handle.interface_index(), None);
}

#[test]
fn test_open_hidapi_missing_device() {
    let (helper, _usb, _hid) = setup();
    assert!(matches!(helper.open("/hidapi/dev/hidraw9"), Err(Error::Hid(_))));
}

// ============================================================================
// close
// ============================================================================

#[test]
fn test_close_releases_native_device_once() {
    let (helper, _usb, hid) = setup();
    let path = "/hidapi/dev/hidraw1";
    hid.add_path(&hidapi_native_path(path).unwrap());

    let handle = helper.open(path).unwrap();
    let clone = handle.clone();
    assert!(helper.close(&handle));
    assert!(!clone.is_open());
    assert_eq!(hid.closed(), 1);

    assert!(!helper.close(&clone));
    assert_eq!(hid.closed(), 1);
}

#[test]
fn test_operations_on_closed_handle() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, Vec::new());
    let handle = helper.open("/win32/usb/1/2").unwrap();
    helper.close(&handle);

    assert!(matches!(
        helper.hid_request(&handle, 0, &[1, 2, 3]),
        Err(Error::Closed)
    ));
    assert!(matches!(
        helper.interrupt_read_loop(&handle, 1, 8, |_, _, _| {}),
        Err(Error::Closed)
    ));
}
