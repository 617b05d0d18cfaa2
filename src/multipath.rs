//! C8: Multipath Status Poller. Talks to `multipathd`'s local control
//! socket, grounded in `mpath_util.c` (`socket_connect`/`send_packet`/
//! `recv_packet`/`mpath_status_thread`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::device::{IoState, RaidState};
use crate::core::error::{ConnectSnafu, MultipathError};
use crate::core::registry::{ArrayRegistry, DeviceRegistry};
use crate::executor::ManagementExecutor;
use crate::monitor::{device_monitor_update, MonitorConfig};
use crate::probe::IoOutcome;

/// `mpath_modify_queueing`'s two verbs, used by the executor to quiesce a
/// multipath member before a timeout-fail and restore it after a reset.
#[async_trait]
pub trait QueueingControl: Send + Sync {
    async fn disable_queueing(&self, map_name: &str) -> Result<(), MultipathError>;
    async fn restore_queueing(&self, map_name: &str) -> Result<(), MultipathError>;
}

pub struct MultipathSocket {
    path: PathBuf,
}

impl MultipathSocket {
    pub fn new(path: PathBuf) -> Self {
        MultipathSocket { path }
    }

    async fn connect(&self) -> Result<UnixStream, MultipathError> {
        UnixStream::connect(&self.path).await.context(ConnectSnafu {
            path: self.path.clone(),
        })
    }

    /// Length-prefixed request/response: a little-endian `u32` byte count
    /// followed by the text payload, the framing analogue of the raw
    /// `size_t` write/read pair in `send_packet`/`recv_packet`.
    async fn command(&self, command: &str) -> Result<String, MultipathError> {
        let mut stream = self.connect().await?;
        let payload = command.as_bytes();
        stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .context(ConnectSnafu { path: self.path.clone() })?;
        stream
            .write_all(payload)
            .await
            .context(ConnectSnafu { path: self.path.clone() })?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .context(ConnectSnafu { path: self.path.clone() })?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .context(ConnectSnafu { path: self.path.clone() })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[async_trait]
impl QueueingControl for MultipathSocket {
    async fn disable_queueing(&self, map_name: &str) -> Result<(), MultipathError> {
        self.command(&format!("disablequeueing map {}", map_name)).await?;
        Ok(())
    }

    async fn restore_queueing(&self, map_name: &str) -> Result<(), MultipathError> {
        self.command(&format!("restorequeueing map {}", map_name)).await?;
        Ok(())
    }
}

/// Parses one line of a bulk `show maps format "%d %N %Q"` reply:
/// active-path count, map name, queueing state.
fn parse_status_line(line: &str) -> Option<(String, IoState)> {
    let mut parts = line.trim().splitn(3, ' ');
    let count: i64 = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    let queueing = parts.next().unwrap_or("").trim();

    let io = if count > 0 {
        IoState::Ok
    } else if queueing == "off" {
        IoState::Failed
    } else if queueing.starts_with('-') {
        IoState::Pending
    } else {
        IoState::Retry
    };
    Some((name, io))
}

pub struct MultipathPoller {
    socket: MultipathSocket,
    devices: Arc<DeviceRegistry>,
    arrays: Arc<ArrayRegistry>,
    executor: Arc<ManagementExecutor>,
    monitor_cfg: Arc<MonitorConfig>,
    recheck: Arc<Notify>,
    poll_interval: Duration,
}

impl MultipathPoller {
    pub fn new(
        socket_path: PathBuf,
        devices: Arc<DeviceRegistry>,
        arrays: Arc<ArrayRegistry>,
        executor: Arc<ManagementExecutor>,
        monitor_cfg: Arc<MonitorConfig>,
        recheck: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        MultipathPoller {
            socket: MultipathSocket::new(socket_path),
            devices,
            arrays,
            executor,
            monitor_cfg,
            recheck,
            poll_interval,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut shutdown = shutdown;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "multipath status round failed");
            }
            tokio::select! {
                _ = self.recheck.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<(), MultipathError> {
        let reply = self.socket.command("show maps format \"%d %N %Q\"").await?;
        for line in reply.lines() {
            let Some((name, io)) = parse_status_line(line) else {
                continue;
            };
            let Some(member) = self.devices.lookup_by_name(&name) else {
                continue;
            };
            let observed = member.raid_state();
            debug!(device = %name, io = ?io, "multipath status update");
            if member.parent().is_some() {
                let outcome = match io {
                    IoState::Ok => IoOutcome::Ok,
                    IoState::Failed => IoOutcome::Failed,
                    IoState::Pending => IoOutcome::Pending,
                    IoState::Retry => IoOutcome::Failed,
                    IoState::Timeout => IoOutcome::Timeout,
                    IoState::Unknown | IoState::Error => IoOutcome::Error,
                };
                device_monitor_update(
                    &member,
                    outcome,
                    observed,
                    member.slot(),
                    &self.monitor_cfg,
                    &self.executor,
                )
                .await;
            }
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum QueueingCall {
        Disable(String),
        Restore(String),
    }

    #[derive(Default)]
    pub struct FakeQueueingControl {
        pub calls: Mutex<Vec<QueueingCall>>,
    }

    #[async_trait]
    impl QueueingControl for FakeQueueingControl {
        async fn disable_queueing(&self, map_name: &str) -> Result<(), MultipathError> {
            self.calls.lock().push(QueueingCall::Disable(map_name.to_string()));
            Ok(())
        }

        async fn restore_queueing(&self, map_name: &str) -> Result<(), MultipathError> {
            self.calls.lock().push(QueueingCall::Restore(map_name.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_active_paths_as_ok() {
        assert_eq!(
            parse_status_line("2 mpatha -"),
            Some(("mpatha".to_string(), IoState::Ok))
        );
    }

    #[test]
    fn parses_off_as_failed() {
        assert_eq!(
            parse_status_line("0 mpatha off"),
            Some(("mpatha".to_string(), IoState::Failed))
        );
    }

    #[test]
    fn parses_dash_prefixed_queueing_as_pending() {
        assert_eq!(
            parse_status_line("0 mpatha -5"),
            Some(("mpatha".to_string(), IoState::Pending))
        );
    }

    #[test]
    fn parses_other_queueing_as_retry() {
        assert_eq!(
            parse_status_line("0 mpatha on"),
            Some(("mpatha".to_string(), IoState::Retry))
        );
    }
}
