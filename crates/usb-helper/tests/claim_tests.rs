//! Interface claiming tests
//!
//! Run with: `cargo test -p usb-helper --test claim_tests`

#![cfg(feature = "hidapi")]

use std::rc::Rc;
use std::time::Duration;
use usb_helper::backend::{ConfigSummary, InterfaceSetting};
use usb_helper::test_utils::{MockHid, MockUsb, mock_backends};
use usb_helper::{HelperSettings, InterfaceClass, Scheduler, UsbHelper};

const GAMEPAD: InterfaceClass = InterfaceClass {
    class: 3,
    subclass: 0,
    protocol: 0,
};

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

fn alt(number: u8, class: u8, subclass: u8, protocol: u8) -> InterfaceSetting {
    InterfaceSetting {
        number,
        class,
        subclass,
        protocol,
    }
}

/// One configuration with `matching` gamepad interfaces interleaved with
/// `other` vendor-specific ones
fn mixed_config(matching: u8, other: u8) -> ConfigSummary {
    let mut interfaces = Vec::new();
    let mut number = 0;
    for i in 0..matching.max(other) {
        if i < other {
            interfaces.push(vec![alt(number, 0xff, 0x5d, 0x01)]);
            number += 1;
        }
        if i < matching {
            interfaces.push(vec![alt(number, 3, 0, 0)]);
            number += 1;
        }
    }
    ConfigSummary { interfaces }
}

#[test]
fn test_claim_count_equals_matching_interfaces() {
    for (matching, other) in [(0u8, 3u8), (1, 0), (2, 2), (4, 1)] {
        let (helper, usb, _hid) = setup();
        usb.add_device(1, 2, vec![mixed_config(matching, other)]);
        let handle = helper.open("/win32/usb/1/2").unwrap();

        assert_eq!(
            helper.claim_interfaces_by(&handle, GAMEPAD),
            usize::from(matching),
            "{} matching, {} other",
            matching,
            other
        );
        assert_eq!(usb.claimed(1, 2).len(), usize::from(matching));
    }
}

#[test]
fn test_subclass_and_protocol_must_match() {
    let (helper, usb, _hid) = setup();
    usb.add_device(
        1,
        2,
        vec![ConfigSummary {
            interfaces: vec![
                vec![alt(0, 3, 1, 1)],
                vec![alt(1, 3, 0, 2)],
                vec![alt(2, 3, 0, 0)],
            ],
        }],
    );
    let handle = helper.open("/win32/usb/1/2").unwrap();

    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), 1);
    assert_eq!(usb.claimed(1, 2), vec![2]);
}

#[test]
fn test_failed_claim_does_not_stop_scan() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, vec![mixed_config(3, 0)]);
    usb.fail_claim(1, 2, 0);
    let handle = helper.open("/win32/usb/1/2").unwrap();

    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), 2);
    assert_eq!(usb.claimed(1, 2), vec![1, 2]);
}

#[test]
fn test_claims_across_configurations() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, vec![mixed_config(1, 1), mixed_config(2, 0)]);
    let handle = helper.open("/win32/usb/1/2").unwrap();

    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), 3);
}

#[cfg(target_os = "linux")]
#[test]
fn test_claimed_interfaces_are_detached() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, vec![mixed_config(2, 1)]);
    usb.fail_claim(1, 2, 1);
    let handle = helper.open("/win32/usb/1/2").unwrap();

    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), 1);
    assert_eq!(usb.detached(1, 2), usb.claimed(1, 2));
}

#[test]
fn test_hidapi_handle_claims() {
    let (helper, _usb, hid) = setup();
    let path = "/hidapi/dev/hidraw2";
    hid.add_path(&usb_helper::path::hidapi_native_path(path).unwrap());
    let handle = helper.open(path).unwrap();

    let expected = if cfg!(windows) { 1 } else { 0 };
    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), expected);
}

#[test]
fn test_closed_handle_claims_nothing() {
    let (helper, usb, _hid) = setup();
    usb.add_device(1, 2, vec![mixed_config(2, 0)]);
    let handle = helper.open("/win32/usb/1/2").unwrap();
    helper.close(&handle);

    assert_eq!(helper.claim_interfaces_by(&handle, GAMEPAD), 0);
    assert!(usb.claimed(1, 2).is_empty());
}
