//! C7: Management Executor. The single serialized worker that actually
//! invokes the external array-management tool (`mdadm --manage ...`),
//! grounded in `mdadm_exec_thread`/`fail_md`/`reset_md`.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::core::array::Array;
use crate::core::dasd::DasdIoctl;
use crate::core::device::{IoState, RaidState};
use crate::core::error::{ExecutorError, SpawnSnafu, ToolFailedSnafu, ToolSignaledSnafu};
use crate::core::registry::ArrayRegistry;
use crate::core::sysfs::SysfsStore;
use crate::multipath::QueueingControl;
use crate::policy;
use snafu::ResultExt;

/// Exit-code contract with the external tool: 0 is success, `BUSY_CODE` is
/// also treated as success (mdadm can report "device or resource busy" on
/// a fail that already took effect), anything else is a real failure.
const BUSY_EXIT_CODE: i32 = 4;

#[async_trait]
pub trait ManagementTool: Send + Sync {
    async fn manage_fail(&self, array_name: &str, side: char) -> Result<(), ExecutorError>;
    async fn manage_reset(&self, array_name: &str) -> Result<(), ExecutorError>;
}

pub struct MdadmTool {
    binary: String,
}

impl MdadmTool {
    pub fn new(binary: impl Into<String>) -> Self {
        MdadmTool { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<(), ExecutorError> {
        let output = async_process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .context(SpawnSnafu {
                tool: self.binary.clone(),
            })?;
        classify_exit(&self.binary, output.status)
    }

    async fn manage(&self, array_name: &str, verb_args: &[&str]) -> Result<(), ExecutorError> {
        let devnode = format!("/dev/{}", array_name);
        let mut args = vec!["--manage", devnode.as_str()];
        args.extend_from_slice(verb_args);
        self.run(&args).await
    }
}

fn classify_exit(tool: &str, status: ExitStatus) -> Result<(), ExecutorError> {
    match status.code() {
        Some(0) | Some(BUSY_EXIT_CODE) => Ok(()),
        Some(code) => ToolFailedSnafu {
            tool: tool.to_string(),
            code,
        }
        .fail(),
        None => ToolSignaledSnafu { tool: tool.to_string() }.fail(),
    }
}

#[async_trait]
impl ManagementTool for MdadmTool {
    async fn manage_fail(&self, array_name: &str, side: char) -> Result<(), ExecutorError> {
        let arg = format!("set-{}", side);
        self.manage(array_name, &["--fail", arg.as_str()]).await
    }

    async fn manage_reset(&self, array_name: &str) -> Result<(), ExecutorError> {
        self.manage(array_name, &["--re-add", "faulty"]).await
    }
}

/// Drives `ManagementExecutor::run`'s shutdown and wakeup.
pub struct ExecutorHandle {
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
}

impl ExecutorHandle {
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

pub struct ManagementExecutor {
    registry: Arc<ArrayRegistry>,
    tool: Arc<dyn ManagementTool>,
    dasd: Arc<dyn DasdIoctl>,
    multipath: Arc<dyn QueueingControl>,
    failfast_timeout: Duration,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
}

impl ManagementExecutor {
    pub fn new(
        registry: Arc<ArrayRegistry>,
        tool: Arc<dyn ManagementTool>,
        dasd: Arc<dyn DasdIoctl>,
        multipath: Arc<dyn QueueingControl>,
        failfast_timeout: Duration,
    ) -> (Arc<Self>, ExecutorHandle) {
        let notify = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(ManagementExecutor {
            registry,
            tool,
            dasd,
            multipath,
            failfast_timeout,
            notify: notify.clone(),
            shutdown: shutdown.clone(),
        });
        (executor, ExecutorHandle { notify, shutdown })
    }

    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Single-worker loop: wait for a wakeup (new work, or the
    /// `failfast_timeout` poll interval), then drain every array with a
    /// pending action, processing each one serially.
    pub async fn run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(self.failfast_timeout, self.notify.notified()).await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut pending_arrays = Vec::new();
            self.registry.for_each(|array| {
                if array.pending().is_some() {
                    pending_arrays.push(array.clone());
                }
            });
            for array in pending_arrays {
                let started = Instant::now();
                self.process_one(&array).await;
                info!(array = %array.name, elapsed_ms = started.elapsed().as_millis() as u64, "pending action processed");
            }
        }
    }

    async fn process_one(&self, array: &Arc<Array>) {
        let action = match array.pending() {
            Some(a) => a,
            None => return,
        };
        let side_index = action.side.trailing_zeros() as u8;
        if array.is_side_degraded(side_index) {
            warn!(array = %array.name, "side already degraded, dropping pending action");
            array.clear_pending();
            return;
        }
        if action.status == RaidState::InSync {
            self.process_reset(array, side_index).await;
        } else {
            self.process_fail(array, action.status, side_index).await;
        }
    }

    async fn process_fail(&self, array: &Arc<Array>, status: RaidState, side_index: u8) {
        let children = array.children();
        let copies = array.mirror_copies().max(1);
        let (targeted, other): (Vec<_>, Vec<_>) = children.into_iter().partition(|c| {
            c.slot()
                .map(|s| (s as u32 % copies) as u8 == side_index)
                .unwrap_or(false)
        });

        if status == RaidState::Timeout {
            for member in &targeted {
                if crate::probe::devnode_is_dasd(&member.name) {
                    let _ = self.dasd.set_timeout(&member.devnode);
                } else {
                    let _ = self.multipath.disable_queueing(&member.name).await;
                }
            }
        }

        let side_letter = (b'A' + side_index) as char;
        match self.tool.manage_fail(&array.dev_name, side_letter).await {
            Ok(()) => {
                for member in &targeted {
                    policy::fail_component(member, status);
                }
                for member in &other {
                    let _ = SysfsStore::for_block_device(&member.name).clear_failfast();
                }
                array.set_side_degraded(side_index);
                array.clear_pending();
            }
            Err(e) => warn!(array = %array.name, error = %e, "fail-side tool invocation failed"),
        }
    }

    async fn process_reset(&self, array: &Arc<Array>, side_index: u8) {
        let children = array.children();
        for member in &children {
            if member.io_state() != IoState::Ok {
                let resolved = member.wait_io_resolved(Duration::from_millis(10)).await;
                if resolved != IoState::Ok {
                    warn!(array = %array.name, device = %member.name, "reset aborted, I/O status still unknown");
                    return;
                }
            }
            if crate::probe::devnode_is_dasd(&member.name) {
                let _ = self.dasd.clear_timeout(&member.devnode);
            } else {
                let _ = self.multipath.restore_queueing(&member.name).await;
            }
            let _ = SysfsStore::for_block_device(&member.name).set_failfast();
            policy::reset_component(member);
        }

        match self.tool.manage_reset(&array.dev_name).await {
            Ok(()) => {
                array.clear_degraded();
                array.clear_pending();
                let _ = side_index;
            }
            Err(e) => warn!(array = %array.name, error = %e, "reset tool invocation failed"),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Invocation {
        Fail { array: String, side: char },
        Reset { array: String },
    }

    #[derive(Default)]
    pub struct FakeManagementTool {
        pub calls: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl ManagementTool for FakeManagementTool {
        async fn manage_fail(&self, array_name: &str, side: char) -> Result<(), ExecutorError> {
            self.calls.lock().push(Invocation::Fail {
                array: array_name.to_string(),
                side,
            });
            Ok(())
        }

        async fn manage_reset(&self, array_name: &str) -> Result<(), ExecutorError> {
            self.calls.lock().push(Invocation::Reset {
                array: array_name.to_string(),
            });
            Ok(())
        }
    }
}
