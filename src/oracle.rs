//! C4: RAID State Oracle. Turns a `GET_DISK_INFO` observation into a
//! reconciled member state, applying the anti-flapping rule from
//! `md_rdev_update_state`.

use std::path::Path;
use std::sync::Arc;

use snafu::ResultExt;

use crate::core::error::{DiskInfoSnafu, OracleError};
use crate::core::raid_ioctl::RaidIoctl;
use crate::core::RaidState;

/// Merges a freshly observed state into the locally-held one. This is the
/// single place flap-prevention lives: once we've asked the management
/// tool to act on a member (`Pending`, `Recovery`), only certain
/// observations are allowed to override that intent.
pub fn reconcile(local: RaidState, observed: RaidState) -> RaidState {
    use RaidState::*;
    match local {
        Pending => match observed {
            Faulty | Spare | Timeout => observed,
            _ => Pending,
        },
        Recovery => match observed {
            Faulty | Timeout => Recovery,
            _ => observed,
        },
        Timeout => match observed {
            Faulty => Timeout,
            _ => observed,
        },
        _ => observed,
    }
}

#[async_trait::async_trait]
pub trait RaidOracle: Send + Sync {
    /// Opens the parent array device read-only/non-blocking and issues
    /// `GET_DISK_INFO` for this member's last known index.
    fn check(&self, array_devnode: &Path, index: i32) -> Result<(RaidState, i32), OracleError>;
}

pub struct IoctlOracle {
    raid_ioctl: Arc<dyn RaidIoctl>,
}

impl IoctlOracle {
    pub fn new(raid_ioctl: Arc<dyn RaidIoctl>) -> Self {
        IoctlOracle { raid_ioctl }
    }
}

#[async_trait::async_trait]
impl RaidOracle for IoctlOracle {
    fn check(&self, array_devnode: &Path, index: i32) -> Result<(RaidState, i32), OracleError> {
        let info = self
            .raid_ioctl
            .get_disk_info(array_devnode, index)
            .context(DiskInfoSnafu { slot: index })?;
        let state = if info.is_active_sync() {
            RaidState::InSync
        } else if info.is_faulty() {
            if info.is_timeout() {
                RaidState::Timeout
            } else {
                RaidState::Faulty
            }
        } else if info.is_removed() {
            RaidState::Removed
        } else {
            RaidState::Spare
        };
        Ok((state, info.raid_disk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RaidState::*;

    #[test]
    fn pending_only_overwritten_by_terminal_states() {
        assert_eq!(reconcile(Pending, InSync), Pending);
        assert_eq!(reconcile(Pending, Recovery), Pending);
        assert_eq!(reconcile(Pending, Faulty), Faulty);
        assert_eq!(reconcile(Pending, Spare), Spare);
        assert_eq!(reconcile(Pending, Timeout), Timeout);
    }

    #[test]
    fn recovery_ignores_residual_faulty() {
        assert_eq!(reconcile(Recovery, Faulty), Recovery);
        assert_eq!(reconcile(Recovery, Timeout), Recovery);
        assert_eq!(reconcile(Recovery, InSync), InSync);
        assert_eq!(reconcile(Recovery, Spare), Spare);
    }

    #[test]
    fn timeout_sticky_against_faulty_only() {
        assert_eq!(reconcile(Timeout, Faulty), Timeout);
        assert_eq!(reconcile(Timeout, InSync), InSync);
        assert_eq!(reconcile(Timeout, Spare), Spare);
    }

    #[test]
    fn other_states_always_overwritten() {
        assert_eq!(reconcile(InSync, Faulty), Faulty);
        assert_eq!(reconcile(Blocked, InSync), InSync);
        assert_eq!(reconcile(Unknown, Spare), Spare);
    }
}
