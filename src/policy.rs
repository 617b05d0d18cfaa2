//! C6: Mirror Policy. Decides whether a bad observation on one member
//! should fail a single component or a whole mirror side, grounded in
//! `fail_mirror`/`reset_mirror`/`count_ready_devices` in `md_monitor.c`.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::array::{Array, PendingAction};
use crate::core::device::{Device, IoState, RaidState};
use crate::core::error::{AmbiguousSideSnafu, PolicyError};
use crate::executor::ManagementExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Mirror,
    Disk,
}

/// Single-component transition used both for "fail one disk" mode and as
/// the terminal step of a whole-side fail once the tool has succeeded.
/// Mirrors `fail_component`/`reset_component`.
pub fn fail_component(member: &Device, status: RaidState) {
    member.force_raid_state(status);
    member.recheck();
    info!(device = %member.name, status = %status, "component failed");
}

pub fn reset_component(member: &Device) -> RaidState {
    let next = match member.raid_state() {
        RaidState::Faulty | RaidState::Timeout | RaidState::Removed | RaidState::Spare => {
            RaidState::Recovery
        }
        RaidState::Blocked => RaidState::InSync,
        other => other,
    };
    member.force_raid_state(next);
    next
}

fn side_of(member: &Device, array: &Array) -> Result<u8, PolicyError> {
    let copies = array.mirror_copies().max(1);
    if let Some(slot) = member.slot() {
        return Ok((slot as u32 % copies) as u8);
    }
    let children = array.children();
    let mut counts = vec![0u32; copies as usize];
    for child in &children {
        if let Some(slot) = child.slot() {
            let side = (slot as u32 % copies) as usize;
            counts[side] += 1;
        }
    }
    let min = counts.iter().copied().min().unwrap_or(0);
    let candidates: Vec<usize> = counts
        .iter()
        .enumerate()
        .filter(|(_, &c)| c == min)
        .map(|(i, _)| i)
        .collect();
    if candidates.len() != 1 {
        warn!(array = %array.name, device = %member.name, "cannot determine mirror side, sides are tied");
        return AmbiguousSideSnafu {
            array: array.name.clone(),
            device: member.name.clone(),
        }
        .fail();
    }
    Ok(candidates[0] as u8)
}

/// `fail_mirror(member, status)`. `fail_mode`/`fail_on_removed` select
/// single-component mode; otherwise a whole side is targeted.
pub async fn fail_mirror(
    member: &Arc<Device>,
    status: RaidState,
    fail_mode: FailMode,
    executor: &ManagementExecutor,
) -> Result<(), PolicyError> {
    let array = match member.parent() {
        Some(a) => a,
        None => return Ok(()),
    };
    if array.in_discovery() {
        return Ok(());
    }
    // Unlike the original's `fail_mirror`, which only guards on
    // `in_discovery`, a rebuild in progress also suppresses a fail: the
    // array's membership is in flux until `RebuildFinished` arrives.
    if array.in_recovery() {
        return Ok(());
    }
    if fail_mode == FailMode::Disk || status == RaidState::Removed {
        fail_component(member, status);
        return Ok(());
    }

    let side = side_of(member, &array)?;

    if array.pending().is_some() {
        info!(array = %array.name, "pending action already queued, dropping fail_mirror");
        return Ok(());
    }
    if array.is_side_degraded(side) {
        return Ok(());
    }
    if array.degraded_mask() != 0 {
        for child in array.children() {
            if side_of(&child, &array).ok() == Some(side) {
                child.force_raid_state(RaidState::Blocked);
            }
        }
        array.set_side_degraded(side);
        return Ok(());
    }

    let action = PendingAction { status, side: 1 << side };
    if array.try_set_pending(action) {
        executor.signal();
    }
    Ok(())
}

/// `reset_mirror(member)`.
pub async fn reset_mirror(member: &Arc<Device>, executor: &ManagementExecutor) -> Result<(), PolicyError> {
    let array = match member.parent() {
        Some(a) => a,
        None => return Ok(()),
    };
    if array.in_recovery() || array.pending().is_some() {
        return Ok(());
    }

    let side = if let Some(slot) = member.slot() {
        (slot as u32 % array.mirror_copies().max(1)) as u8
    } else {
        let mask = array.degraded_mask();
        if mask.count_ones() == 1 {
            mask.trailing_zeros() as u8
        } else {
            side_of(member, &array)?
        }
    };

    let children = array.children();
    let mut ready = 0u32;
    for child in &children {
        if child.raid_state() == RaidState::Recovery {
            continue;
        }
        let io = child.io_state();
        if matches!(io, IoState::Unknown | IoState::Failed | IoState::Retry) {
            continue;
        }
        let child_side = side_of(child, &array).unwrap_or(side);
        if child_side != side {
            ready += 1;
        } else if io == IoState::Ok {
            ready += 1;
            if child.slot().is_some() {
                child.recheck();
            }
        }
    }

    if ready != array.raid_disks() {
        return Ok(());
    }

    let action = PendingAction {
        status: RaidState::InSync,
        side: 1 << side,
    };
    if array.try_set_pending(action) {
        executor.signal();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_component_maps_terminal_states_to_recovery() {
        let dev = Device::new("dasda", "/dev/dasda".into());
        dev.force_raid_state(RaidState::Faulty);
        assert_eq!(reset_component(&dev), RaidState::Recovery);

        dev.force_raid_state(RaidState::Blocked);
        assert_eq!(reset_component(&dev), RaidState::InSync);

        dev.force_raid_state(RaidState::InSync);
        assert_eq!(reset_component(&dev), RaidState::InSync);
    }
}
