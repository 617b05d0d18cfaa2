//! C9: Event Router dispatch table, driven with hand-built `HotplugEvent`s
//! rather than a real udev socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use raidguardd::core::raid_ioctl::fake::FakeRaidIoctl;
use raidguardd::core::raid_ioctl::ArrayInfo;
use raidguardd::core::registry::{ArrayRegistry, DeviceRegistry};
use raidguardd::events::{Action, EventRouter, HotplugEvent};

fn router() -> (EventRouter, Arc<DeviceRegistry>, Arc<ArrayRegistry>, Arc<FakeRaidIoctl>) {
    let devices = Arc::new(DeviceRegistry::new());
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo {
        level: 10,
        raid_disks: 2,
        size: 1,
        layout: 2,
        ..ArrayInfo::default()
    }));
    let arrays = Arc::new(ArrayRegistry::new(raid_ioctl.clone()));
    let router = EventRouter::new(devices.clone(), arrays.clone());
    (router, devices, arrays, raid_ioctl)
}

fn dasd_add(name: &str, status: &str) -> HotplugEvent {
    let mut props = HashMap::new();
    props.insert("DASD_STATUS".to_string(), status.to_string());
    HotplugEvent {
        action: Action::Add,
        subsystem: "block".to_string(),
        sysname: name.to_string(),
        devnode: Some(PathBuf::from(format!("/dev/{name}"))),
        devnum: Some((9, 0)),
        properties: props,
    }
}

#[test]
fn add_event_attaches_an_online_dasd() {
    let (router, devices, _arrays, _) = router();
    router.handle(dasd_add("dasda", "online"));
    assert!(devices.lookup_by_name("dasda").is_some());
}

#[test]
fn add_event_ignores_an_offline_dasd() {
    let (router, devices, _arrays, _) = router();
    router.handle(dasd_add("dasda", "offline"));
    assert!(devices.lookup_by_name("dasda").is_none());
}

#[test]
fn remove_event_detaches_a_known_device() {
    let (router, devices, _arrays, _) = router();
    router.handle(dasd_add("dasda", "online"));
    assert!(devices.lookup_by_name("dasda").is_some());

    router.handle(HotplugEvent {
        action: Action::Remove,
        subsystem: "block".to_string(),
        sysname: "dasda".to_string(),
        devnode: Some(PathBuf::from("/dev/dasda")),
        devnum: Some((9, 0)),
        properties: HashMap::new(),
    });
    assert!(devices.lookup_by_name("dasda").is_none());
}

#[test]
fn change_event_on_an_array_admits_it() {
    let (router, _devices, arrays, raid_ioctl) = router();
    raid_ioctl.set_disk(0, raidguardd::core::raid_ioctl::fake::disk_info(0, 0, 0, 0));

    router.handle(HotplugEvent {
        action: Action::Change,
        subsystem: "block".to_string(),
        sysname: "md0".to_string(),
        devnode: Some(PathBuf::from("/dev/md0")),
        devnum: None,
        properties: HashMap::new(),
    });
    assert!(arrays.lookup("md0").is_some());
}

#[test]
fn change_event_on_a_non_raid10_array_is_not_admitted() {
    let devices = Arc::new(DeviceRegistry::new());
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo {
        level: 1,
        raid_disks: 2,
        size: 1,
        layout: 2,
        ..ArrayInfo::default()
    }));
    let arrays = Arc::new(ArrayRegistry::new(raid_ioctl));
    let router = EventRouter::new(devices, arrays.clone());

    router.handle(HotplugEvent {
        action: Action::Change,
        subsystem: "block".to_string(),
        sysname: "md0".to_string(),
        devnode: Some(PathBuf::from("/dev/md0")),
        devnum: None,
        properties: HashMap::new(),
    });
    assert!(arrays.lookup("md0").is_none());
}

#[test]
fn remove_event_on_an_array_drops_it() {
    let (router, _devices, arrays, raid_ioctl) = router();
    raid_ioctl.set_disk(0, raidguardd::core::raid_ioctl::fake::disk_info(0, 0, 0, 0));
    router.handle(HotplugEvent {
        action: Action::Change,
        subsystem: "block".to_string(),
        sysname: "md0".to_string(),
        devnode: Some(PathBuf::from("/dev/md0")),
        devnum: None,
        properties: HashMap::new(),
    });
    assert!(arrays.lookup("md0").is_some());

    router.handle(HotplugEvent {
        action: Action::Remove,
        subsystem: "block".to_string(),
        sysname: "md0".to_string(),
        devnode: Some(PathBuf::from("/dev/md0")),
        devnum: None,
        properties: HashMap::new(),
    });
    assert!(arrays.lookup("md0").is_none());
}
