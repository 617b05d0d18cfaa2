//! C9: Event Router. Bridges libudev hot-plug notifications into the
//! registries and the monitor-task lifecycle, modeled on the
//! `udev::MonitorBuilder` + background-thread + channel pattern used for
//! streaming udev events.

use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::registry::{ArrayHandle, DeviceHandle, MemberKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub action: Action,
    pub subsystem: String,
    pub sysname: String,
    pub devnode: Option<std::path::PathBuf>,
    pub devnum: Option<(u32, u32)>,
    pub properties: std::collections::HashMap<String, String>,
}

/// Runs `udev::MonitorSocket::iter()` on a dedicated OS thread (libudev's
/// monitor fd is not `Send`-friendly across an async runtime) and forwards
/// parsed events over an unbounded channel, the same bridge pattern the
/// reference `udev_utils` crate uses for its `mio`-polled background
/// thread.
pub fn spawn_listener() -> Result<mpsc::UnboundedReceiver<HotplugEvent>, std::io::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let socket = udev::MonitorBuilder::new()?.match_subsystem("block")?.listen()?;

    thread::Builder::new()
        .name("raidguardd-udev".into())
        .spawn(move || {
            for event in socket.iter() {
                let action = match event.event_type() {
                    udev::EventType::Add => Action::Add,
                    udev::EventType::Change => Action::Change,
                    udev::EventType::Remove => Action::Remove,
                    _ => continue,
                };
                let device = event.device();
                let properties = device
                    .properties()
                    .map(|p| {
                        (
                            p.name().to_string_lossy().into_owned(),
                            p.value().to_string_lossy().into_owned(),
                        )
                    })
                    .collect();
                let hp = HotplugEvent {
                    action,
                    subsystem: device
                        .subsystem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    sysname: device.sysname().to_string_lossy().into_owned(),
                    devnode: device.devnode().map(|p| p.to_path_buf()),
                    devnum: device.devnum().map(|d| {
                        (
                            unsafe { libc::major(d) } as u32,
                            unsafe { libc::minor(d) } as u32,
                        )
                    }),
                    properties,
                };
                if tx.send(hp).is_err() {
                    break;
                }
            }
        })?;

    Ok(rx)
}

fn is_dasd(name: &str) -> bool {
    name.starts_with("dasd") && name.len() == 5
}

fn is_multipath_map(name: &str) -> bool {
    name.starts_with("dm-")
}

fn is_array(name: &str) -> bool {
    name.starts_with("md")
}

/// Routes one event into C1/C2/C5, per spec §4.9's dispatch table.
pub struct EventRouter {
    devices: Arc<crate::core::registry::DeviceRegistry>,
    arrays: Arc<crate::core::registry::ArrayRegistry>,
}

impl EventRouter {
    pub fn new(
        devices: Arc<crate::core::registry::DeviceRegistry>,
        arrays: Arc<crate::core::registry::ArrayRegistry>,
    ) -> Self {
        EventRouter { devices, arrays }
    }

    pub fn handle(&self, ev: HotplugEvent) {
        match (ev.action, is_dasd(&ev.sysname), is_multipath_map(&ev.sysname), is_array(&ev.sysname)) {
            (Action::Add, true, _, _) | (Action::Add, _, true, _) => {
                let Some((maj, min)) = ev.devnum else { return };
                let kind = if is_dasd(&ev.sysname) {
                    MemberKind::Dasd
                } else {
                    MemberKind::Multipath
                };
                let handle = DeviceHandle {
                    key: (maj, min),
                    name: ev.sysname.clone(),
                    devnode: ev.devnode.clone().unwrap_or_else(|| format!("/dev/{}", ev.sysname).into()),
                    kind,
                    parent_status: ev.properties.get("DASD_STATUS").cloned(),
                    alias: ev.properties.get("DASD_ALIAS").cloned(),
                    dm_uuid: ev.properties.get("DM_UUID").cloned(),
                };
                if self.devices.attach(handle).is_some() {
                    info!(device = %ev.sysname, "device attached");
                }
            }
            (Action::Change, _, _, true) => {
                let devnode = ev.devnode.unwrap_or_else(|| format!("/dev/{}", ev.sysname).into());
                match self.arrays.admit(ArrayHandle {
                    name: ev.sysname.clone(),
                    devnode: devnode.clone(),
                }) {
                    Ok(array) => {
                        let devices = self.devices.clone();
                        if let Err(e) = self.arrays.discover_members(&array, &devnode, &devices, |maj, min| {
                            Some((maj as u32, min as u32))
                        }) {
                            warn!(array = %ev.sysname, error = %e, "discover_members failed, rolling back admit");
                            self.arrays.remove(&ev.sysname);
                        }
                    }
                    Err(e) => warn!(array = %ev.sysname, error = %e, "array admission refused"),
                }
            }
            (Action::Remove, _, _, true) => {
                if self.arrays.remove(&ev.sysname).is_some() {
                    info!(array = %ev.sysname, "array removed");
                }
            }
            (Action::Remove, true, _, _) | (Action::Remove, _, true, _) => {
                if let Some((maj, min)) = ev.devnum {
                    if self.devices.detach((maj, min)).is_some() {
                        info!(device = %ev.sysname, "device detached");
                    }
                }
            }
            _ => {}
        }
    }
}
