//! C5: Member Monitor Task. One loop per DASD member, driving C3 and C4
//! and dispatching into C6 on interesting outcomes. Grounded in
//! `dasd_monitor_thread`/`monitor_dasd`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::device::{Device, IoState, MonitorHandle, RaidState};
use crate::executor::ManagementExecutor;
use crate::oracle::RaidOracle;
use crate::policy::{self, FailMode};
use crate::probe::{IoOutcome, ProbeEngine};

pub struct MonitorConfig {
    pub failfast_timeout: Duration,
    pub failfast_retries: u32,
    pub checker_timeout: Duration,
    pub stop_on_sync: bool,
    pub fail_mode: FailMode,
}

impl MonitorConfig {
    pub fn monitor_timeout(&self) -> Duration {
        self.failfast_timeout * (self.failfast_retries + 1)
    }
}

/// Applies a freshly produced `(io_status, raid_state)` observation to a
/// member and, when warranted, calls into C6. Shared between the per-DASD
/// monitor loop below and `multipath::MultipathPoller`, matching
/// `device_monitor_update` being called from both `dasd_monitor_thread`
/// and `mpath_status_thread` in the original.
pub async fn device_monitor_update(
    member: &Arc<Device>,
    io: IoOutcome,
    observed: RaidState,
    slot: Option<i32>,
    cfg: &MonitorConfig,
    executor: &ManagementExecutor,
) {
    let reconciled = member.set_raid_state(observed, slot);
    member.set_io_state(match io {
        IoOutcome::Ok => IoState::Ok,
        IoOutcome::Failed => IoState::Failed,
        IoOutcome::Timeout => IoState::Timeout,
        IoOutcome::Pending => IoState::Pending,
        IoOutcome::Error => IoState::Error,
        IoOutcome::Unknown => IoState::Unknown,
    });

    if io != IoOutcome::Ok {
        let action = match reconciled {
            RaidState::Recovery => Some(RaidState::Faulty),
            RaidState::InSync => Some(RaidState::Faulty),
            RaidState::Faulty if io == IoOutcome::Timeout => Some(RaidState::Timeout),
            RaidState::Faulty | RaidState::Pending | RaidState::Timeout => Some(reconciled),
            RaidState::Unknown => None,
            other => {
                warn!(device = %member.name, state = %other, "invalid state for a non-ok outcome");
                None
            }
        };
        if let Some(status) = action {
            if let Err(e) = policy::fail_mirror(member, status, cfg.fail_mode, executor).await {
                warn!(device = %member.name, error = %e, "fail_mirror failed");
            }
        }
    } else {
        match reconciled {
            RaidState::InSync if cfg.stop_on_sync => {
                info!(device = %member.name, "in sync and stop_on_sync set, halting monitor");
            }
            RaidState::Recovery
            | RaidState::Blocked
            | RaidState::Faulty
            | RaidState::Timeout
            | RaidState::Spare => {
                if let Err(e) = policy::reset_mirror(member, executor).await {
                    warn!(device = %member.name, error = %e, "reset_mirror failed");
                }
            }
            _ => {}
        }
    }
}

/// Spawns (or re-signals) the monitor task for `member`. A no-op if a live
/// task is already attached, matching `monitor_dasd`'s "thread already
/// running" fast path.
pub fn start_or_restart(
    member: Arc<Device>,
    array_devnode: PathBuf,
    make_probe: impl FnOnce(Arc<Notify>) -> Box<dyn ProbeEngine>,
    oracle: Arc<dyn RaidOracle>,
    cfg: Arc<MonitorConfig>,
    executor: Arc<ManagementExecutor>,
) {
    if member.has_monitor() {
        member.recheck();
        return;
    }
    let recheck = Arc::new(Notify::new());
    let running = Arc::new(AtomicBool::new(true));
    let probe = make_probe(recheck.clone());
    let join = {
        let member = member.clone();
        let recheck = recheck.clone();
        let running = running.clone();
        tokio::spawn(async move {
            run_loop(member, array_devnode, probe, oracle, cfg, executor, recheck, running).await
        })
    };
    member.install_monitor(MonitorHandle { join, recheck, running });
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    member: Arc<Device>,
    array_devnode: PathBuf,
    mut probe: Box<dyn ProbeEngine>,
    oracle: Arc<dyn RaidOracle>,
    cfg: Arc<MonitorConfig>,
    executor: Arc<ManagementExecutor>,
    recheck: Arc<Notify>,
    running: Arc<AtomicBool>,
) {
    if let Err(e) = probe.setup().await {
        warn!(device = %member.name, error = %e, "probe setup failed, monitor exiting");
        return;
    }

    let mut aio_timeout = Duration::ZERO;
    while running.load(Ordering::SeqCst) {
        if member.raid_state() == RaidState::Timeout {
            member.force_raid_state(RaidState::Unknown);
        }

        let (outcome, _elapsed) = probe.probe(aio_timeout).await;
        debug!(device = %member.name, ?outcome, "probe outcome");

        if outcome == IoOutcome::Error {
            break;
        }

        let index = member.slot().unwrap_or(-1);
        let (observed, slot) = match oracle.check(&array_devnode, index) {
            Ok(pair) => pair,
            Err(_) => break,
        };
        let reconciled = crate::oracle::reconcile(member.raid_state(), observed);

        match outcome {
            IoOutcome::Pending => {
                if matches!(reconciled, RaidState::Faulty | RaidState::Timeout) {
                    let _ = policy::fail_mirror(&member, reconciled, cfg.fail_mode, &executor).await;
                }
                aio_timeout = cfg.monitor_timeout();
                continue;
            }
            IoOutcome::Unknown => {
                aio_timeout = cfg.monitor_timeout();
                continue;
            }
            _ => {}
        }

        device_monitor_update(&member, outcome, observed, Some(slot), &cfg, &executor).await;
        if outcome == IoOutcome::Ok && member.raid_state() == RaidState::InSync && cfg.stop_on_sync {
            break;
        }

        tokio::select! {
            _ = recheck.notified() => {
                aio_timeout = Duration::ZERO;
            }
            _ = tokio::time::sleep(cfg.checker_timeout) => {
                aio_timeout = cfg.monitor_timeout();
            }
        }
    }

    probe.teardown().await;
}
