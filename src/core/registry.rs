use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use snafu::ResultExt;

use super::array::Array;
use super::device::Device;
use super::error::{ArrayInfoSnafu, NotRaid10Snafu, RegistryError};
use super::raid_ioctl::RaidIoctl;

pub type DeviceKey = (u32, u32);

const MULTIPATH_UUID_PREFIX: &str = "mpath-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Dasd,
    Multipath,
}

/// Everything [`DeviceRegistry::attach`] needs from a hot-plug `add` event,
/// gathered from udev properties/attributes by the caller (normally
/// `events::EventRouter`).
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub key: DeviceKey,
    pub name: String,
    pub devnode: PathBuf,
    pub kind: MemberKind,
    /// DASD `status` sysfs attribute, e.g. "online".
    pub parent_status: Option<String>,
    /// DASD `alias` sysfs attribute; `"1"` marks a PAV alias device.
    pub alias: Option<String>,
    /// device-mapper `DM_UUID`, checked for the multipath prefix.
    pub dm_uuid: Option<String>,
}

/// C1: the flat map from stable device key to `Device` record.
pub struct DeviceRegistry {
    by_key: Mutex<HashMap<DeviceKey, Arc<Device>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry {
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn admissible(handle: &DeviceHandle) -> bool {
        match handle.kind {
            MemberKind::Dasd => {
                handle.parent_status.as_deref() == Some("online")
                    && handle.alias.as_deref() != Some("1")
            }
            MemberKind::Multipath => handle
                .dm_uuid
                .as_deref()
                .map(|u| u.starts_with(MULTIPATH_UUID_PREFIX))
                .unwrap_or(false),
        }
    }

    /// Admits a device, or is a no-op if the key is already present. Never
    /// creates a second record for an already-attached key.
    pub fn attach(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        if !Self::admissible(&handle) {
            return None;
        }
        let mut map = self.by_key.lock();
        if let Some(existing) = map.get(&handle.key) {
            return Some(existing.clone());
        }
        let dev = Arc::new(Device::new(handle.name, handle.devnode));
        map.insert(handle.key, dev.clone());
        Some(dev)
    }

    pub fn detach(&self, key: DeviceKey) -> Option<Arc<Device>> {
        let dev = self.by_key.lock().remove(&key)?;
        dev.detach_parent();
        Some(dev)
    }

    pub fn lookup_by_key(&self, key: DeviceKey) -> Option<Arc<Device>> {
        self.by_key.lock().get(&key).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.by_key.lock().values().find(|d| d.name == name).cloned()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Device>)) {
        for dev in self.by_key.lock().values() {
            f(dev);
        }
    }
}

/// Everything [`ArrayRegistry::admit`] needs from a `change` event on an
/// `md*` device.
#[derive(Debug, Clone)]
pub struct ArrayHandle {
    pub name: String,
    pub devnode: PathBuf,
}

/// C2: the flat map from array name to `Array` record.
pub struct ArrayRegistry {
    by_name: Mutex<HashMap<String, Arc<Array>>>,
    raid_ioctl: Arc<dyn RaidIoctl>,
}

impl ArrayRegistry {
    pub fn new(raid_ioctl: Arc<dyn RaidIoctl>) -> Self {
        ArrayRegistry {
            by_name: Mutex::new(HashMap::new()),
            raid_ioctl,
        }
    }

    pub fn admit(&self, handle: ArrayHandle) -> Result<Arc<Array>, RegistryError> {
        let mut map = self.by_name.lock();
        if let Some(existing) = map.get(&handle.name) {
            return Ok(existing.clone());
        }
        let info = self
            .raid_ioctl
            .get_array_info(&handle.devnode)
            .context(ArrayInfoSnafu {
                name: handle.name.clone(),
            })?;
        const RAID10_LEVEL: i32 = 10;
        if info.level != RAID10_LEVEL || info.raid_disks <= 0 || info.size <= 0 {
            return NotRaid10Snafu {
                name: handle.name.clone(),
            }
            .fail();
        }
        let array = Arc::new(Array::new(
            handle.name.clone(),
            info.raid_disks as u32,
            info.layout as u32,
        ));
        map.insert(handle.name, array.clone());
        Ok(array)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Array>> {
        let array = self.by_name.lock().remove(name)?;
        for child in array.children() {
            child.detach_parent();
        }
        Some(array)
    }

    pub fn lookup(&self, name_or_alias: &str) -> Option<Arc<Array>> {
        self.by_name.lock().get(name_or_alias).cloned()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Array>)) {
        for array in self.by_name.lock().values() {
            f(array);
        }
    }

    /// Walks disk indices looking for present slots, attaching/detaching
    /// members to match the kernel's current view. Stale-member removal
    /// is suppressed while the array is in recovery, to avoid racing a
    /// rebuild that is still populating slots.
    pub fn discover_members(
        &self,
        array: &Arc<Array>,
        array_devnode: &std::path::Path,
        devices: &DeviceRegistry,
        resolve: impl Fn(i32, i32) -> Option<DeviceKey>,
    ) -> Result<(), RegistryError> {
        array.set_in_discovery(true);
        let mut seen = Vec::new();
        for index in 0..4096i32 {
            let info = match self.raid_ioctl.get_disk_info(array_devnode, index) {
                Ok(info) => info,
                Err(_) => break,
            };
            if info.major == 0 && info.minor == 0 {
                continue;
            }
            if info.is_removed() {
                continue;
            }
            let key = match resolve(info.major, info.minor) {
                Some(k) => k,
                None => continue,
            };
            let dev = match devices.lookup_by_key(key) {
                Some(d) => d,
                None => continue,
            };
            dev.set_raid_state(
                if info.is_faulty() {
                    if info.is_timeout() {
                        super::device::RaidState::Timeout
                    } else {
                        super::device::RaidState::Faulty
                    }
                } else if info.is_active_sync() {
                    super::device::RaidState::InSync
                } else {
                    super::device::RaidState::Spare
                },
                Some(info.raid_disk),
            );
            dev.set_parent(Arc::downgrade(array));
            if array.find_child(&dev.name).is_none() {
                array.add_child(dev.clone());
            }
            seen.push(dev.name.clone());
        }
        if !array.in_recovery() {
            for child in array.children() {
                if !seen.contains(&child.name) {
                    array.remove_child(&child.name);
                    child.detach_parent();
                }
            }
        }
        array.set_in_discovery(false);
        Ok(())
    }
}
