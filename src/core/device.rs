use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::array::Array;

/// Mirrors `enum md_rdev_status` (md_monitor.h), in the order the original
/// state table prints them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidState {
    Unknown,
    InSync,
    Faulty,
    Timeout,
    Spare,
    Recovery,
    Removed,
    Pending,
    Blocked,
    Stopped,
}

impl RaidState {
    /// Single-character encoding used by `ArrayStatus`/`MirrorStatus` replies.
    pub fn as_char(self) -> char {
        match self {
            RaidState::Unknown => '.',
            RaidState::InSync => 'A',
            RaidState::Faulty => 'W',
            RaidState::Timeout => 'T',
            RaidState::Spare => 'S',
            RaidState::Recovery => 'R',
            RaidState::Removed => '-',
            RaidState::Pending => 'P',
            RaidState::Blocked => 'B',
            RaidState::Stopped => '.',
        }
    }
}

impl fmt::Display for RaidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaidState::Unknown => "unknown",
            RaidState::InSync => "in_sync",
            RaidState::Faulty => "faulty",
            RaidState::Timeout => "timeout",
            RaidState::Spare => "spare",
            RaidState::Recovery => "recovery",
            RaidState::Removed => "removed",
            RaidState::Pending => "pending",
            RaidState::Blocked => "blocked",
            RaidState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Mirrors `enum device_io_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Unknown,
    Error,
    Ok,
    Failed,
    Pending,
    Timeout,
    Retry,
}

impl IoState {
    pub fn as_char(self) -> char {
        match self {
            IoState::Unknown => '.',
            IoState::Error => 'X',
            IoState::Ok => 'A',
            IoState::Failed => 'W',
            IoState::Pending => 'R',
            IoState::Timeout => 'T',
            IoState::Retry => 'R',
        }
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, IoState::Ok)
    }
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoState::Unknown => "unknown",
            IoState::Error => "error",
            IoState::Ok => "ok",
            IoState::Failed => "failed",
            IoState::Pending => "pending",
            IoState::Timeout => "timeout",
            IoState::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// Mutable, lock-protected half of a [`Device`]. Guarded by `Device::state`,
/// the per-member analogue of `device_monitor.lock` in the original source.
pub struct DeviceState {
    pub raid_state: RaidState,
    pub io_state: IoState,
    /// Slot index as last reported by the oracle; `None` before the first
    /// successful `GET_DISK_INFO`.
    pub slot: Option<i32>,
    /// Slot carried over from the previous check when the current state is
    /// `Timeout`/`Faulty` and the kernel no longer reports a sane slot.
    pub saved_slot: Option<i32>,
    pub index: Option<i32>,
    pub in_discovery: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            raid_state: RaidState::Unknown,
            io_state: IoState::Unknown,
            slot: None,
            saved_slot: None,
            index: None,
            in_discovery: false,
        }
    }
}

/// A running member monitor task plus the handles needed to steer it:
/// `recheck` wakes the probe loop the way the recheck real-time signal did
/// in the original, `running` lets `detach` ask it to stop without a
/// kill-by-tid.
pub struct MonitorHandle {
    pub join: JoinHandle<()>,
    pub recheck: std::sync::Arc<Notify>,
    pub running: std::sync::Arc<AtomicBool>,
}

/// One mirror member: a DASD path or a multipath map contributing to one
/// side of a RAID-10 array. Corresponds to `struct device_monitor`.
///
/// Resource ownership follows the exclusive-ownership policy in spec §9:
/// the open block-device handle and the `io_uring` context used for
/// probing belong to the owning `MonitorTask`'s stack, not to this record,
/// so no lock here ever needs to protect an fd.
pub struct Device {
    /// Short kernel name, e.g. `dasda` or `mpatha`.
    pub name: String,
    /// Device node the probe engine opens, e.g. `/dev/dasda`.
    pub devnode: std::path::PathBuf,
    /// Array-relative component name as registered with mdadm, usually
    /// identical to `name` but kept distinct since the kernel is the
    /// source of truth for it.
    pub component_name: String,
    state: Mutex<DeviceState>,
    /// Non-owning back-reference to the owning array. Cleared to `None`
    /// by `detach` before the array itself is dropped, so a stale upgrade
    /// is impossible rather than merely unlikely.
    parent: Mutex<Option<Weak<Array>>>,
    monitor: Mutex<Option<MonitorHandle>>,
    io_ready: Notify,
}

impl Device {
    pub fn new(name: impl Into<String>, devnode: std::path::PathBuf) -> Self {
        let name = name.into();
        Device {
            component_name: name.clone(),
            name,
            devnode,
            state: Mutex::new(DeviceState::default()),
            parent: Mutex::new(None),
            monitor: Mutex::new(None),
            io_ready: Notify::new(),
        }
    }

    pub fn raid_state(&self) -> RaidState {
        self.state.lock().raid_state
    }

    pub fn io_state(&self) -> IoState {
        self.state.lock().io_state
    }

    pub fn slot(&self) -> Option<i32> {
        self.state.lock().slot
    }

    /// Applies a freshly-observed RAID state via [`super::super::oracle::reconcile`]
    /// and returns the resulting state. Slot bookkeeping mirrors
    /// `md_rdev_check_state`: the slot is only overwritten when the new
    /// observation isn't `Timeout`/`Faulty`.
    pub fn set_raid_state(&self, observed: RaidState, slot: Option<i32>) -> RaidState {
        let mut st = self.state.lock();
        let resolved = crate::oracle::reconcile(st.raid_state, observed);
        st.raid_state = resolved;
        if !matches!(observed, RaidState::Timeout | RaidState::Faulty) {
            if let Some(s) = slot {
                st.slot = Some(s);
                st.saved_slot = Some(s);
            }
        }
        resolved
    }

    /// Forces the RAID state without going through reconcile. Used by
    /// `fail_component`/`reset_component`, which set terminal states as a
    /// side effect of a completed action rather than an observation.
    pub fn force_raid_state(&self, new_state: RaidState) {
        self.state.lock().raid_state = new_state;
    }

    pub fn set_io_state(&self, new_state: IoState) {
        self.state.lock().io_state = new_state;
        self.io_ready.notify_waiters();
    }

    /// Waits briefly for a pending I/O observation to resolve, the Rust
    /// analogue of `reset_component`'s bounded `pthread_cond_timedwait` on
    /// `io_cond` (`status_wait_ns`, 10ms).
    pub async fn wait_io_resolved(&self, timeout: std::time::Duration) -> IoState {
        if self.state.lock().io_state != IoState::Unknown {
            return self.io_state();
        }
        let notified = self.io_ready.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
        self.io_state()
    }

    pub fn set_parent(&self, parent: Weak<Array>) {
        *self.parent.lock() = Some(parent);
    }

    pub fn parent(&self) -> Option<std::sync::Arc<Array>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Clears the back-reference. Called by `ArrayRegistry::remove` before
    /// the array's last `Arc` is dropped, per the non-owning-handle design
    /// note.
    pub fn detach_parent(&self) {
        *self.parent.lock() = None;
    }

    pub fn install_monitor(&self, handle: MonitorHandle) {
        *self.monitor.lock() = Some(handle);
    }

    pub fn take_monitor(&self) -> Option<MonitorHandle> {
        self.monitor.lock().take()
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Interrupts the owning monitor task's blocking reap, the async
    /// equivalent of `pthread_kill(thread, recheck_signal)`.
    pub fn recheck(&self) {
        if let Some(h) = self.monitor.lock().as_ref() {
            h.recheck.notify_one();
        }
    }

    pub fn in_discovery(&self) -> bool {
        self.state.lock().in_discovery
    }

    pub fn set_in_discovery(&self, v: bool) {
        self.state.lock().in_discovery = v;
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("raid_state", &self.raid_state())
            .field("io_state", &self.io_state())
            .finish()
    }
}
