//! C10: Control Socket. A local abstract-namespace `SOCK_DGRAM` endpoint
//! authenticated via `SCM_CREDENTIALS`, grounded in `cli_monitor_thread`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{
    bind, recvmsg, sendto, socket, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use nix::sys::uio::IoVec;
use snafu::ResultExt;
use tokio::io::unix::AsyncFd;
use tracing::{info, warn};

use crate::core::device::RaidState;
use crate::core::error::{BindSnafu, ControlError, NotPermittedSnafu};
use crate::core::registry::{ArrayRegistry, DeviceRegistry};
use crate::policy::{self, FailMode};

const HELP_TEXT: &str = "\
Shutdown Help ArrayStatus MirrorStatus MonitorStatus NewArray \
RebuildStarted RebuildFinished DeviceDisappeared Fail FailSpare Remove SpareActive";

#[derive(Debug, Clone)]
pub struct Verb {
    pub name: String,
    pub array: Option<String>,
    pub device: Option<String>,
}

/// Parses `VERB[:ARRAY[@/dev/MEMBER]]`.
pub fn parse_verb(line: &str) -> Result<Verb, ControlError> {
    let line = line.trim();
    let (name, rest) = match line.split_once(':') {
        Some((n, r)) => (n, Some(r)),
        None => (line, None),
    };
    if name.is_empty() {
        return Err(ControlError::MalformedVerb { verb: line.to_string() });
    }
    let (array, device) = match rest {
        None => (None, None),
        Some(r) => match r.split_once('@') {
            Some((a, d)) => (Some(a.to_string()), Some(d.to_string())),
            None => (Some(r.to_string()), None),
        },
    };
    Ok(Verb {
        name: name.to_string(),
        array,
        device,
    })
}

pub enum Reply {
    Ok,
    Errno(u8),
    Text(String),
}

impl Reply {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Ok => Vec::new(),
            Reply::Errno(code) => vec![code],
            Reply::Text(s) => s.into_bytes(),
        }
    }
}

pub struct ControlSocket {
    fd: RawFd,
    devices: Arc<DeviceRegistry>,
    arrays: Arc<ArrayRegistry>,
    fail_mode: FailMode,
    executor: Arc<crate::executor::ManagementExecutor>,
}

impl ControlSocket {
    /// Binds an abstract-namespace datagram socket at `\0name`.
    pub fn bind(
        name: &str,
        devices: Arc<DeviceRegistry>,
        arrays: Arc<ArrayRegistry>,
        fail_mode: FailMode,
        executor: Arc<crate::executor::ManagementExecutor>,
    ) -> Result<Self, ControlError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        .context(BindSnafu { path: name.to_string() })?;

        let addr = UnixAddr::new_abstract(name.as_bytes())
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            .context(BindSnafu { path: name.to_string() })?;
        bind(fd, &nix::sys::socket::SockAddr::Unix(addr))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            .context(BindSnafu { path: name.to_string() })?;

        let _ = nix::sys::socket::setsockopt(fd, nix::sys::socket::sockopt::PassCred, &true);

        Ok(ControlSocket {
            fd,
            devices,
            arrays,
            fail_mode,
            executor,
        })
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), ControlError> {
        let async_fd = AsyncFd::new(self.fd).expect("control socket fd registration");
        loop {
            tokio::select! {
                guard = async_fd.readable() => {
                    let mut guard = guard.expect("control socket readable");
                    match self.recv_and_dispatch().await {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "control socket request failed"),
                    }
                    guard.clear_ready();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` iff the request was `Shutdown`.
    async fn recv_and_dispatch(&self) -> Result<bool, ControlError> {
        let mut buf = [0u8; 4096];
        let mut cmsg_buf = nix::cmsg_space!(nix::sys::socket::UnixCredentials);
        let iov = [IoVec::from_mut_slice(&mut buf)];
        let msg = recvmsg(self.fd, &iov, Some(&mut cmsg_buf), MsgFlags::empty())
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            .map_err(|_| ControlError::MalformedVerb {
                verb: "<recv error>".to_string(),
            })?;

        let mut uid = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmCredentials(cred) = cmsg {
                uid = Some(cred.uid());
            }
        }
        let uid = uid.unwrap_or(u32::MAX);
        if uid != 0 {
            return NotPermittedSnafu { uid }.fail();
        }

        let text = String::from_utf8_lossy(&buf[..msg.bytes]).to_string();
        let verb = parse_verb(&text)?;
        let is_shutdown = verb.name == "Shutdown";
        let reply = self.dispatch(verb).await;
        if let Some(addr) = msg.address {
            let bytes = reply.into_bytes();
            let _ = sendto(self.fd, &bytes, &addr, MsgFlags::empty());
        }
        Ok(is_shutdown)
    }

    async fn dispatch(&self, verb: Verb) -> Reply {
        match verb.name.as_str() {
            "Shutdown" => Reply::Ok,
            "Help" => Reply::Text(HELP_TEXT.to_string()),
            "NewArray" => Reply::Ok,
            "ArrayStatus" => self.array_status(verb.array.as_deref()),
            "MirrorStatus" => self.mirror_status(verb.array.as_deref()),
            "MonitorStatus" => self.monitor_status(verb.array.as_deref()),
            "RebuildStarted" => self.rebuild(verb.array.as_deref(), true),
            "RebuildFinished" => self.rebuild(verb.array.as_deref(), false),
            "DeviceDisappeared" => self.device_disappeared(verb.array.as_deref()),
            "Fail" | "FailSpare" => {
                self.fail_device(verb.array.as_deref(), verb.device.as_deref()).await
            }
            "Remove" => self.remove_device(verb.array.as_deref(), verb.device.as_deref()),
            "SpareActive" => self.spare_active(verb.array.as_deref(), verb.device.as_deref()),
            _ => Reply::Errno(libc::EINVAL as u8),
        }
    }

    fn array_status(&self, array: Option<&str>) -> Reply {
        let Some(name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        let Some(array) = self.arrays.lookup(name) else { return Reply::Errno(libc::ENODEV as u8) };
        let mut out = String::new();
        for (slot, child) in array.children().iter().enumerate() {
            out.push_str(&format!(
                "{}: dev {} slot {}/{} status {} {}\n",
                name,
                child.name,
                slot,
                array.raid_disks(),
                child.raid_state(),
                child.io_state(),
            ));
        }
        Reply::Text(out)
    }

    fn mirror_status(&self, array: Option<&str>) -> Reply {
        let Some(name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        let Some(array) = self.arrays.lookup(name) else { return Reply::Errno(libc::ENODEV as u8) };
        let disks = array.raid_disks() as usize;
        let mut buf = vec!['.'; disks];
        for child in array.children() {
            if let Some(slot) = child.slot() {
                if (slot as usize) < disks {
                    buf[slot as usize] = child.raid_state().as_char();
                }
            }
        }
        Reply::Text(buf.into_iter().collect())
    }

    fn monitor_status(&self, array: Option<&str>) -> Reply {
        let Some(name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        let Some(array) = self.arrays.lookup(name) else { return Reply::Errno(libc::ENODEV as u8) };
        let disks = array.raid_disks() as usize;
        let mut buf = vec!['.'; disks];
        for child in array.children() {
            if let Some(slot) = child.slot() {
                if (slot as usize) < disks {
                    buf[slot as usize] = child.io_state().as_char();
                }
            }
        }
        Reply::Text(buf.into_iter().collect())
    }

    fn rebuild(&self, array: Option<&str>, started: bool) -> Reply {
        let Some(name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        let Some(array) = self.arrays.lookup(name) else { return Reply::Errno(libc::ENODEV as u8) };
        array.set_in_recovery(started);
        info!(array = %name, started, "rebuild state changed");
        Reply::Ok
    }

    fn device_disappeared(&self, array: Option<&str>) -> Reply {
        let Some(name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        if self.arrays.remove(name).is_some() {
            Reply::Ok
        } else {
            Reply::Errno(libc::ENODEV as u8)
        }
    }

    /// `Fail`/`FailSpare`: fail one component in place, ignoring the
    /// request if the member's current state says the array shouldn't be
    /// touched (`fail_md_component`'s UNKNOWN/RECOVERY/SPARE/BLOCKED guard).
    async fn fail_device(&self, array: Option<&str>, device: Option<&str>) -> Reply {
        let (Some(array_name), Some(device_name)) = (array, device) else {
            return Reply::Errno(libc::EINVAL as u8);
        };
        let Some(array) = self.arrays.lookup(array_name) else { return Reply::Errno(libc::ENODEV as u8) };
        let Some(member) = array.find_child(device_name) else { return Reply::Errno(libc::ENODEV as u8) };

        if array.in_recovery() {
            info!(array = %array_name, device = %device_name, "rebuild in progress, ignoring Fail request");
            return Reply::Ok;
        }

        let current = member.raid_state();
        if matches!(
            current,
            RaidState::Unknown | RaidState::Recovery | RaidState::Spare | RaidState::Blocked
        ) {
            warn!(device = %device_name, state = %current, "ignoring Fail request in this state");
            return Reply::Ok;
        }
        let status = if current == RaidState::Timeout {
            RaidState::Timeout
        } else {
            RaidState::Faulty
        };
        let new_status = member.set_raid_state(status, member.slot());
        if new_status != RaidState::InSync {
            let _ = policy::fail_mirror(&member, new_status, self.fail_mode, &self.executor).await;
        }
        Reply::Ok
    }

    /// `Remove`: mark a component removed and stop its monitor task,
    /// grounded in `remove_md_component`.
    fn remove_device(&self, array: Option<&str>, device: Option<&str>) -> Reply {
        let (Some(array_name), Some(device_name)) = (array, device) else {
            return Reply::Errno(libc::EINVAL as u8);
        };
        let Some(array) = self.arrays.lookup(array_name) else { return Reply::Errno(libc::ENODEV as u8) };
        let Some(member) = array.find_child(device_name) else { return Reply::Errno(libc::ENODEV as u8) };
        member.force_raid_state(RaidState::Removed);
        if let Some(handle) = member.take_monitor() {
            handle.running.store(false, std::sync::atomic::Ordering::SeqCst);
            handle.recheck.notify_one();
        }
        Reply::Ok
    }

    fn spare_active(&self, array: Option<&str>, device: Option<&str>) -> Reply {
        let Some(array_name) = array else { return Reply::Errno(libc::EINVAL as u8) };
        let Some(array) = self.arrays.lookup(array_name) else { return Reply::Errno(libc::ENODEV as u8) };
        match device {
            Some(device_name) => match array.find_child(device_name) {
                Some(member) => {
                    policy::reset_component(&member);
                    Reply::Ok
                }
                None => Reply::Errno(libc::ENODEV as u8),
            },
            None => {
                let devnode = std::path::PathBuf::from(format!("/dev/{}", array.dev_name));
                let devices = self.devices.clone();
                match self.arrays.discover_members(&array, &devnode, &devices, |maj, min| {
                    Some((maj as u32, min as u32))
                }) {
                    Ok(()) => Reply::Ok,
                    Err(_) => Reply::Errno(libc::EIO as u8),
                }
            }
        }
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_verb() {
        let v = parse_verb("Shutdown").unwrap();
        assert_eq!(v.name, "Shutdown");
        assert!(v.array.is_none());
    }

    #[test]
    fn parses_verb_with_array() {
        let v = parse_verb("ArrayStatus:md0").unwrap();
        assert_eq!(v.array.as_deref(), Some("md0"));
        assert!(v.device.is_none());
    }

    #[test]
    fn parses_verb_with_array_and_device() {
        let v = parse_verb("Fail:md0@/dev/dasda").unwrap();
        assert_eq!(v.array.as_deref(), Some("md0"));
        assert_eq!(v.device.as_deref(), Some("/dev/dasda"));
    }
}
