use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::{ioctl_read, Result as NixResult};

const MD_DISK_FAULTY: i32 = 0;
const MD_DISK_ACTIVE: i32 = 1;
const MD_DISK_SYNC: i32 = 2;
const MD_DISK_REMOVED: i32 = 3;
const MD_DISK_TIMEOUT: i32 = 11;

/// `mdu_array_info_t` (`<linux/raid/md_u.h>`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayInfo {
    pub major_version: i32,
    pub minor_version: i32,
    pub patch_version: i32,
    pub ctime: u32,
    pub level: i32,
    pub size: i32,
    pub nr_disks: i32,
    pub raid_disks: i32,
    pub md_minor: i32,
    pub not_persistent: i32,
    pub utime: u32,
    pub state: i32,
    pub active_disks: i32,
    pub working_disks: i32,
    pub failed_disks: i32,
    pub spare_disks: i32,
    pub layout: i32,
    pub chunk_size: i32,
}

/// `mdu_disk_info_t`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskInfo {
    pub number: i32,
    pub major: i32,
    pub minor: i32,
    pub raid_disk: i32,
    pub state: i32,
}

impl DiskInfo {
    pub fn is_faulty(&self) -> bool {
        self.state & (1 << MD_DISK_FAULTY) != 0
    }

    pub fn is_timeout(&self) -> bool {
        self.state & (1 << MD_DISK_TIMEOUT) != 0
    }

    pub fn is_active_sync(&self) -> bool {
        self.state & (1 << MD_DISK_ACTIVE) != 0 && self.state & (1 << MD_DISK_SYNC) != 0
    }

    pub fn is_removed(&self) -> bool {
        self.state & (1 << MD_DISK_REMOVED) != 0
    }
}

const MD_MAJOR: u8 = 9;
const GET_ARRAY_INFO_NR: u8 = 0x11;
const GET_DISK_INFO_NR: u8 = 0x12;

ioctl_read!(get_array_info_raw, MD_MAJOR, GET_ARRAY_INFO_NR, ArrayInfo);
ioctl_read!(get_disk_info_raw, MD_MAJOR, GET_DISK_INFO_NR, DiskInfo);

/// The kernel RAID ioctl surface used by the state oracle: `GET_ARRAY_INFO`
/// and `GET_DISK_INFO`, exactly the two operations `md_rdev_check_state`
/// issues against the array device node.
pub trait RaidIoctl: Send + Sync {
    fn get_array_info(&self, array_devnode: &Path) -> NixResult<ArrayInfo>;
    fn get_disk_info(&self, array_devnode: &Path, index: i32) -> NixResult<DiskInfo>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealRaidIoctl;

impl RaidIoctl for RealRaidIoctl {
    fn get_array_info(&self, array_devnode: &Path) -> NixResult<ArrayInfo> {
        let file = File::open(array_devnode)
            .map_err(|e| nix::Error::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))?;
        let mut info = ArrayInfo::default();
        unsafe { get_array_info_raw(file.as_raw_fd(), &mut info as *mut ArrayInfo)? };
        Ok(info)
    }

    fn get_disk_info(&self, array_devnode: &Path, index: i32) -> NixResult<DiskInfo> {
        let file = File::open(array_devnode)
            .map_err(|e| nix::Error::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))?;
        let mut info = DiskInfo {
            number: index,
            ..DiskInfo::default()
        };
        unsafe { get_disk_info_raw(file.as_raw_fd(), &mut info as *mut DiskInfo)? };
        Ok(info)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted `RaidIoctl`: one fixed `ArrayInfo` plus a by-index table of
    /// `DiskInfo` responses. An index absent from the table behaves like
    /// the kernel running out of slots (an error), ending a discovery walk.
    pub struct FakeRaidIoctl {
        pub array_info: ArrayInfo,
        pub disks: Mutex<HashMap<i32, DiskInfo>>,
    }

    impl FakeRaidIoctl {
        pub fn new(array_info: ArrayInfo) -> Self {
            FakeRaidIoctl {
                array_info,
                disks: Mutex::new(HashMap::new()),
            }
        }

        pub fn set_disk(&self, index: i32, info: DiskInfo) {
            self.disks.lock().insert(index, info);
        }
    }

    impl RaidIoctl for FakeRaidIoctl {
        fn get_array_info(&self, _array_devnode: &Path) -> NixResult<ArrayInfo> {
            Ok(self.array_info)
        }

        fn get_disk_info(&self, _array_devnode: &Path, index: i32) -> NixResult<DiskInfo> {
            self.disks
                .lock()
                .get(&index)
                .copied()
                .ok_or(nix::Error::Sys(nix::errno::Errno::ENODEV))
        }
    }

    /// Helper for building a `DiskInfo` from the bits a test usually cares
    /// about: major/minor identity, raid_disk slot, and state flags.
    pub fn disk_info(major: i32, minor: i32, raid_disk: i32, state: i32) -> DiskInfo {
        DiskInfo {
            number: raid_disk,
            major,
            minor,
            raid_disk,
            state,
        }
    }

    pub const STATE_ACTIVE_SYNC: i32 = (1 << MD_DISK_ACTIVE) | (1 << MD_DISK_SYNC);
    pub const STATE_FAULTY: i32 = 1 << MD_DISK_FAULTY;
    pub const STATE_FAULTY_TIMEOUT: i32 = (1 << MD_DISK_FAULTY) | (1 << MD_DISK_TIMEOUT);
    pub const STATE_SPARE: i32 = 0;
    pub const STATE_REMOVED: i32 = 1 << MD_DISK_REMOVED;
}
