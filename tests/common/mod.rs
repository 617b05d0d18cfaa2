//! Shared scaffolding for the integration suite: admits a 4-disk/2-copy
//! RAID-10 array through the real `DeviceRegistry`/`ArrayRegistry`
//! discovery path (backed by a scripted `FakeRaidIoctl`), and wires a real
//! `ManagementExecutor` on top of it backed by the other `fake` modules.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use raidguardd::core::array::Array;
use raidguardd::core::dasd::fake::FakeDasdIoctl;
use raidguardd::core::device::Device;
use raidguardd::core::raid_ioctl::fake::{self, FakeRaidIoctl};
use raidguardd::core::raid_ioctl::ArrayInfo;
use raidguardd::core::registry::{ArrayHandle, ArrayRegistry, DeviceHandle, DeviceRegistry, MemberKind};
use raidguardd::executor::fake::FakeManagementTool;
use raidguardd::executor::ManagementExecutor;
use raidguardd::multipath::fake::FakeQueueingControl;

pub struct Harness {
    pub devices: Arc<DeviceRegistry>,
    pub arrays: Arc<ArrayRegistry>,
    pub array: Arc<Array>,
    /// Members in slot order: `dasda`(0/A), `dasdb`(1/B), `dasdc`(2/A), `dasdd`(3/B).
    pub members: Vec<Arc<Device>>,
    pub executor: Arc<ManagementExecutor>,
    pub tool: Arc<FakeManagementTool>,
    pub dasd: Arc<FakeDasdIoctl>,
    pub mpath: Arc<FakeQueueingControl>,
    pub raid_ioctl: Arc<FakeRaidIoctl>,
}

/// A 4-disk, 2-copy RAID-10 array admitted through the real discovery
/// path, every member starting `IN_SYNC`/`OK`.
pub fn two_by_two() -> Harness {
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo {
        level: 10,
        raid_disks: 4,
        size: 1,
        layout: 2,
        ..ArrayInfo::default()
    }));
    let devices = Arc::new(DeviceRegistry::new());
    let arrays = Arc::new(ArrayRegistry::new(raid_ioctl.clone()));

    let names = ["dasda", "dasdb", "dasdc", "dasdd"];
    for (slot, name) in names.iter().enumerate() {
        let key = (9u32, slot as u32);
        devices.attach(DeviceHandle {
            key,
            name: name.to_string(),
            devnode: PathBuf::from(format!("/dev/{name}")),
            kind: MemberKind::Dasd,
            parent_status: Some("online".to_string()),
            alias: None,
            dm_uuid: None,
        });
        raid_ioctl.set_disk(
            slot as i32,
            fake::disk_info(9, slot as i32, slot as i32, fake::STATE_ACTIVE_SYNC),
        );
    }

    let array = arrays
        .admit(ArrayHandle {
            name: "md0".to_string(),
            devnode: PathBuf::from("/dev/md0"),
        })
        .expect("RAID-10 admission");
    arrays
        .discover_members(&array, &PathBuf::from("/dev/md0"), &devices, |maj, min| {
            Some((maj as u32, min as u32))
        })
        .expect("member discovery");

    for member in array.children() {
        member.set_io_state(raidguardd::core::IoState::Ok);
    }
    let members = names
        .iter()
        .map(|n| devices.lookup_by_name(n).unwrap())
        .collect();

    let tool = Arc::new(FakeManagementTool::default());
    let dasd = Arc::new(FakeDasdIoctl::default());
    let mpath = Arc::new(FakeQueueingControl::default());

    let (executor, _handle) = ManagementExecutor::new(
        arrays.clone(),
        tool.clone(),
        dasd.clone(),
        mpath.clone(),
        Duration::from_millis(20),
    );

    Harness {
        devices,
        arrays,
        array,
        members,
        executor,
        tool,
        dasd,
        mpath,
        raid_ioctl,
    }
}

/// Waits for a pending action enqueued by `policy::fail_mirror`/
/// `reset_mirror` to be drained. Requires the caller to have already
/// spawned `h.executor.clone().run()` in the background; this just polls
/// for the pending slot to clear within a short grace period.
pub async fn drain_pending(h: &Harness) {
    for _ in 0..100 {
        if h.array.pending().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
