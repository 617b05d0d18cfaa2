use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::device::{Device, RaidState};

/// Single queued reshape/fail/reset action for one array, processed by the
/// `ManagementExecutor`. Corresponds to the `pending`/`pending_status`/
/// `pending_side` trio on `struct md_monitor`, folded into one record
/// because the original only ever holds one in flight per array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAction {
    pub status: RaidState,
    pub side: u8,
}

/// Mutable half of an [`Array`], guarded by the status lock. Lock order
/// relative to the device list is always device_lock-then-status_lock,
/// matching `md_monitor.c`'s acquisition order throughout `fail_mirror`/
/// `reset_mirror`.
pub struct ArrayStatus {
    pub pending: Option<PendingAction>,
    pub raid_disks: u32,
    pub layout: u32,
    pub in_recovery: bool,
    /// Bitmask over mirror sides; bit N set means side N is degraded.
    pub degraded: u8,
    pub in_discovery: bool,
}

/// One RAID-10 array under supervision. Corresponds to `struct md_monitor`.
pub struct Array {
    pub name: String,
    pub dev_name: String,
    children: Mutex<Vec<Arc<Device>>>,
    status: Mutex<ArrayStatus>,
}

impl Array {
    pub fn new(name: impl Into<String>, raid_disks: u32, layout: u32) -> Self {
        let name = name.into();
        Array {
            dev_name: name.clone(),
            name,
            children: Mutex::new(Vec::new()),
            status: Mutex::new(ArrayStatus {
                pending: None,
                raid_disks,
                layout,
                in_recovery: false,
                degraded: 0,
                in_discovery: false,
            }),
        }
    }

    /// `layout & 0xFF`: the low byte of the RAID-10 layout word is the
    /// mirror-copies count, the divisor used everywhere a slot is turned
    /// into a mirror side.
    pub fn mirror_copies(&self) -> u32 {
        (self.status.lock().layout & 0xFF).max(1)
    }

    pub fn raid_disks(&self) -> u32 {
        self.status.lock().raid_disks
    }

    pub fn children(&self) -> Vec<Arc<Device>> {
        self.children.lock().clone()
    }

    pub fn add_child(&self, dev: Arc<Device>) {
        self.children.lock().push(dev);
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Device>> {
        let mut children = self.children.lock();
        if let Some(pos) = children.iter().position(|d| d.name == name) {
            Some(children.remove(pos))
        } else {
            None
        }
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Device>> {
        self.children.lock().iter().find(|d| d.name == name).cloned()
    }

    pub fn in_recovery(&self) -> bool {
        self.status.lock().in_recovery
    }

    pub fn set_in_recovery(&self, v: bool) {
        self.status.lock().in_recovery = v;
    }

    pub fn in_discovery(&self) -> bool {
        self.status.lock().in_discovery
    }

    pub fn set_in_discovery(&self, v: bool) {
        self.status.lock().in_discovery = v;
    }

    pub fn degraded_mask(&self) -> u8 {
        self.status.lock().degraded
    }

    pub fn is_side_degraded(&self, side: u8) -> bool {
        self.status.lock().degraded & (1 << side) != 0
    }

    pub fn set_side_degraded(&self, side: u8) {
        self.status.lock().degraded |= 1 << side;
    }

    pub fn clear_degraded(&self) {
        self.status.lock().degraded = 0;
    }

    pub fn pending(&self) -> Option<PendingAction> {
        self.status.lock().pending
    }

    /// Enqueues a pending action iff none is already queued; returns
    /// whether it was accepted. Single-flight per array, matching
    /// `fail_mirror`'s `list_empty(&md->pending)` check before enqueuing.
    pub fn try_set_pending(&self, action: PendingAction) -> bool {
        let mut status = self.status.lock();
        if status.pending.is_some() {
            return false;
        }
        status.pending = Some(action);
        true
    }

    pub fn clear_pending(&self) {
        self.status.lock().pending = None;
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("name", &self.name)
            .field("degraded", &self.degraded_mask())
            .field("children", &self.children.lock().len())
            .finish()
    }
}
