//! C1/C2: device and array admission rules, and `discover_members`'s
//! stale-removal suppression during recovery.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use raidguardd::core::raid_ioctl::fake::{self, FakeRaidIoctl};
use raidguardd::core::raid_ioctl::ArrayInfo;
use raidguardd::core::registry::{ArrayHandle, ArrayRegistry, DeviceHandle, DeviceRegistry, MemberKind};

fn dasd_handle(status: Option<&str>, alias: Option<&str>) -> DeviceHandle {
    DeviceHandle {
        key: (9, 0),
        name: "dasda".to_string(),
        devnode: PathBuf::from("/dev/dasda"),
        kind: MemberKind::Dasd,
        parent_status: status.map(str::to_string),
        alias: alias.map(str::to_string),
        dm_uuid: None,
    }
}

#[test]
fn online_dasd_without_pav_alias_is_admitted() {
    let devices = DeviceRegistry::new();
    assert!(devices.attach(dasd_handle(Some("online"), None)).is_some());
}

#[test]
fn offline_dasd_is_refused() {
    let devices = DeviceRegistry::new();
    assert!(devices.attach(dasd_handle(Some("offline"), None)).is_none());
}

#[test]
fn pav_alias_dasd_is_refused() {
    let devices = DeviceRegistry::new();
    assert!(devices.attach(dasd_handle(Some("online"), Some("1"))).is_none());
}

#[test]
fn multipath_map_requires_mpath_uuid_prefix() {
    let devices = DeviceRegistry::new();
    let admitted = devices.attach(DeviceHandle {
        key: (253, 0),
        name: "dm-0".to_string(),
        devnode: PathBuf::from("/dev/dm-0"),
        kind: MemberKind::Multipath,
        parent_status: None,
        alias: None,
        dm_uuid: Some("mpath-36005".to_string()),
    });
    assert!(admitted.is_some());

    let refused = devices.attach(DeviceHandle {
        key: (253, 1),
        name: "dm-1".to_string(),
        devnode: PathBuf::from("/dev/dm-1"),
        kind: MemberKind::Multipath,
        parent_status: None,
        alias: None,
        dm_uuid: Some("lvm-pv-uuid-36005".to_string()),
    });
    assert!(refused.is_none());
}

#[test]
fn attaching_same_key_twice_returns_the_existing_record() {
    let devices = DeviceRegistry::new();
    let first = devices.attach(dasd_handle(Some("online"), None)).unwrap();
    let second = devices.attach(dasd_handle(Some("online"), None)).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn array_admission_rejects_non_raid10() {
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo {
        level: 1,
        raid_disks: 2,
        size: 1,
        layout: 2,
        ..ArrayInfo::default()
    }));
    let arrays = ArrayRegistry::new(raid_ioctl);
    let result = arrays.admit(ArrayHandle {
        name: "md0".to_string(),
        devnode: PathBuf::from("/dev/md0"),
    });
    assert!(result.is_err());
}

#[test]
fn array_admission_accepts_raid10_and_is_idempotent() {
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo {
        level: 10,
        raid_disks: 4,
        size: 1,
        layout: 2,
        ..ArrayInfo::default()
    }));
    let arrays = ArrayRegistry::new(raid_ioctl);
    let handle = ArrayHandle {
        name: "md0".to_string(),
        devnode: PathBuf::from("/dev/md0"),
    };
    let a = arrays.admit(handle.clone()).unwrap();
    let b = arrays.admit(handle).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

/// `discover_members` suppresses stale-member removal while the array is
/// in recovery, so a rebuild slot that transiently disappears doesn't get
/// detached out from under it.
#[test]
fn discover_members_keeps_stale_child_during_recovery() {
    let h = common::two_by_two();
    h.array.set_in_recovery(true);

    // Drop dasdd's slot from the kernel's view without removing it from
    // the device registry.
    h.raid_ioctl.disks.lock().remove(&3);

    h.arrays
        .discover_members(&h.array, &PathBuf::from("/dev/md0"), &h.devices, |maj, min| {
            Some((maj as u32, min as u32))
        })
        .unwrap();

    assert!(h.array.find_child("dasdd").is_some(), "stale child kept during recovery");
}

#[test]
fn discover_members_drops_stale_child_outside_recovery() {
    let h = common::two_by_two();
    h.raid_ioctl.disks.lock().remove(&3);

    h.arrays
        .discover_members(&h.array, &PathBuf::from("/dev/md0"), &h.devices, |maj, min| {
            Some((maj as u32, min as u32))
        })
        .unwrap();

    assert!(h.array.find_child("dasdd").is_none());
}
