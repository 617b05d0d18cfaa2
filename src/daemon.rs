//! Top-level wiring: builds every collaborator, spawns the C5/C7/C8/C9/C10
//! tasks, and drives them to a coordinated shutdown. Grounded in `main()`'s
//! startup/shutdown sequence in `md_monitor.c`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::dasd::RealDasdIoctl;
use crate::core::raid_ioctl::RealRaidIoctl;
use crate::core::registry::{ArrayRegistry, DeviceRegistry};
use crate::events::{self, EventRouter};
use crate::executor::{MdadmTool, ManagementExecutor};
use crate::monitor::{self, MonitorConfig};
use crate::multipath::{MultipathPoller, MultipathSocket};
use crate::oracle::IoctlOracle;
use crate::probe::UringProbe;

/// Everything the daemon needs for its lifetime, held so shutdown can walk
/// it deterministically.
pub struct Daemon {
    devices: Arc<DeviceRegistry>,
    arrays: Arc<ArrayRegistry>,
    executor: Arc<ManagementExecutor>,
    executor_handle: crate::executor::ExecutorHandle,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
    mpath_recheck: Arc<Notify>,
    monitor_cfg: Arc<MonitorConfig>,
    dasd: Arc<RealDasdIoctl>,
    oracle: Arc<IoctlOracle>,
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let raid_ioctl = Arc::new(RealRaidIoctl);
        let dasd = Arc::new(RealDasdIoctl);
        let arrays = Arc::new(ArrayRegistry::new(raid_ioctl.clone()));
        let devices = Arc::new(DeviceRegistry::new());
        let oracle = Arc::new(IoctlOracle::new(raid_ioctl));

        let tool = Arc::new(MdadmTool::new(config.mdadm_binary.clone()));
        let mpath_socket = Arc::new(MultipathSocket::new(config.mpath_socket.clone()));
        let (executor, executor_handle) = ManagementExecutor::new(
            arrays.clone(),
            tool,
            dasd.clone(),
            mpath_socket.clone(),
            config.failfast_timeout,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let monitor_cfg = Arc::new(MonitorConfig {
            failfast_timeout: config.failfast_timeout,
            failfast_retries: config.failfast_retries,
            checker_timeout: config.checker_timeout,
            stop_on_sync: config.stop_on_sync,
            fail_mode: config.fail_mode,
        });

        Daemon {
            devices,
            arrays,
            executor,
            executor_handle,
            shutdown_tx,
            shutdown_rx,
            mpath_recheck: Arc::new(Notify::new()),
            monitor_cfg,
            dasd,
            oracle,
            config,
        }
    }

    /// Starts every background task and blocks until a shutdown signal (a
    /// `SIGINT`/`SIGTERM`, or the control socket's `Shutdown` verb) fires.
    pub async fn run(mut self) -> Result<(), std::io::Error> {
        let signals = crate::signals::install()?;
        tokio::spawn({
            let mut signal_rx = signals.receiver.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            async move {
                if signal_rx.changed().await.is_ok() && *signal_rx.borrow() {
                    let _ = shutdown_tx.send(true);
                }
            }
        });

        let executor_task = tokio::spawn(self.executor.clone().run());

        let control = crate::control::ControlSocket::bind(
            &self.config.control_socket,
            self.devices.clone(),
            self.arrays.clone(),
            self.config.fail_mode,
            self.executor.clone(),
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let mut control_task = tokio::spawn(control.run(self.shutdown_rx.clone()));

        let mpath_task = tokio::spawn({
            let poller = Arc::new(MultipathPoller::new(
                self.config.mpath_socket.clone(),
                self.devices.clone(),
                self.arrays.clone(),
                self.executor.clone(),
                self.monitor_cfg.clone(),
                self.mpath_recheck.clone(),
                self.config.checker_timeout,
            ));
            let shutdown_rx = self.shutdown_rx.clone();
            async move { poller.run(shutdown_rx).await }
        });

        let mut hotplug = events::spawn_listener()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let router = EventRouter::new(self.devices.clone(), self.arrays.clone());

        loop {
            tokio::select! {
                Some(ev) = hotplug.recv() => {
                    router.handle(ev);
                    self.spawn_missing_monitors();
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                result = &mut control_task => {
                    // The control socket only returns on its own `Shutdown`
                    // verb or the watch flipping true; either way the
                    // daemon as a whole is going down.
                    if let Err(e) = result {
                        warn!(error = %e, "control socket task panicked");
                    }
                    let _ = self.shutdown_tx.send(true);
                    self.shutdown(executor_task, control_task, mpath_task).await;
                    return Ok(());
                }
                else => break,
            }
        }

        info!("shutdown signal received, draining supervised arrays");
        self.shutdown(executor_task, control_task, mpath_task).await;
        Ok(())
    }

    /// Starts (or re-signals) a monitor task for every currently attached
    /// device that belongs to an array, per `monitor_dasd`'s idempotent
    /// "thread already running" check.
    fn spawn_missing_monitors(&self) {
        let oracle = self.oracle.clone();
        let dasd = self.dasd.clone();
        let cfg = self.monitor_cfg.clone();
        let executor = self.executor.clone();
        self.devices.for_each(|device| {
            let Some(array) = device.parent() else { return };
            if device.has_monitor() {
                return;
            }
            let array_devnode = std::path::PathBuf::from(format!("/dev/{}", array.dev_name));
            let is_dasd = crate::probe::devnode_is_dasd(&device.name);
            let devnode = device.devnode.clone();
            let dasd = dasd.clone();
            monitor::start_or_restart(
                device.clone(),
                array_devnode,
                move |recheck| Box::new(UringProbe::new(devnode, is_dasd, dasd, recheck)),
                oracle.clone(),
                cfg.clone(),
                executor.clone(),
            );
        });
    }

    /// Shutdown sequence per the design notes: stop admitting new pending
    /// work by removing arrays (which detaches children), let the executor
    /// drain, then cancel the listener tasks.
    async fn shutdown(
        self,
        executor_task: tokio::task::JoinHandle<()>,
        control_task: tokio::task::JoinHandle<Result<(), crate::core::error::ControlError>>,
        mpath_task: tokio::task::JoinHandle<()>,
    ) {
        let mut names = Vec::new();
        self.arrays.for_each(|array| names.push(array.name.clone()));
        for name in names {
            self.arrays.remove(&name);
        }

        self.devices.for_each(|device| {
            if let Some(handle) = device.take_monitor() {
                handle.running.store(false, std::sync::atomic::Ordering::SeqCst);
                handle.recheck.notify_one();
            }
        });

        self.executor_handle.shutdown();
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), executor_task).await {
            warn!(error = %e, "management executor did not exit within the grace period");
        }

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), control_task).await {
            warn!(error = %e, "control socket task did not exit within the grace period");
        }

        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), mpath_task).await {
            warn!(error = %e, "multipath poller did not exit within the grace period");
        }

        info!("shutdown complete");
    }
}
