//! End-to-end coverage of spec §8's policy/executor scenarios (S2-S4) and
//! the invariants that depend on real executor wiring (1, 2, 4, 5, 6).

mod common;

use std::sync::Arc;
use std::time::Duration;

use raidguardd::core::array::Array;
use raidguardd::core::device::Device;
use raidguardd::core::{IoState, RaidState};
use raidguardd::executor::fake::{FakeManagementTool, Invocation};
use raidguardd::multipath::fake::FakeQueueingControl;
use raidguardd::core::dasd::fake::FakeDasdIoctl;
use raidguardd::core::raid_ioctl::fake::FakeRaidIoctl;
use raidguardd::core::raid_ioctl::ArrayInfo;
use raidguardd::core::registry::ArrayRegistry;
use raidguardd::executor::ManagementExecutor;
use raidguardd::policy::{self, FailMode};

fn mirror_status_string(array: &Arc<Array>) -> String {
    let disks = array.raid_disks() as usize;
    let mut buf = vec!['.'; disks];
    for child in array.children() {
        if let Some(slot) = child.slot() {
            if (slot as usize) < disks {
                buf[slot as usize] = child.raid_state().as_char();
            }
        }
    }
    buf.into_iter().collect()
}

/// S2 — a TIMEOUT on one mirror side fails the whole side exactly once.
#[tokio::test]
async fn s2_single_timeout_fails_one_side() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    common::drain_pending(&h).await;

    assert_eq!(
        *h.tool.calls.lock(),
        vec![Invocation::Fail {
            array: "md0".to_string(),
            side: 'B',
        }]
    );
    assert!(h.array.is_side_degraded(1));
    assert_eq!(mirror_status_string(&h.array), "ATAT");
}

/// S3 — a second TIMEOUT on the still-healthy side, with the mirror
/// already degraded, blocks that side's peers without a tool invocation.
#[tokio::test]
async fn s3_second_side_degraded_blocks_without_tool_call() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    common::drain_pending(&h).await;
    assert_eq!(h.tool.calls.lock().len(), 1);

    policy::fail_mirror(&h.members[0], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.tool.calls.lock().len(), 1, "no new tool invocation");
    assert!(h.array.pending().is_none(), "executor queue remains empty");
    assert_eq!(h.members[0].raid_state(), RaidState::Blocked);
    assert_eq!(h.members[2].raid_state(), RaidState::Blocked);
    assert!(h.array.is_side_degraded(0));
}

/// S4 — once the failed side's probe recovers, reset_mirror re-adds the
/// whole array and every terminal member transitions to RECOVERY.
#[tokio::test]
async fn s4_recovery_resets_the_array() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    common::drain_pending(&h).await;

    policy::reset_mirror(&h.members[1], &h.executor).await.unwrap();
    common::drain_pending(&h).await;

    assert_eq!(
        h.tool.calls.lock().last().cloned(),
        Some(Invocation::Reset { array: "md0".to_string() })
    );
    assert_eq!(h.array.degraded_mask(), 0);
    assert!(h.array.pending().is_none());
    assert_eq!(h.members[1].raid_state(), RaidState::Recovery);
    assert_eq!(h.members[3].raid_state(), RaidState::Recovery);
    assert_eq!(h.members[0].raid_state(), RaidState::InSync);
    assert_eq!(h.members[2].raid_state(), RaidState::InSync);
}

/// Invariant 2 — issuing fail_mirror twice for the same side before the
/// executor drains results in exactly one tool invocation.
#[tokio::test]
async fn invariant_degraded_side_idempotence() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    policy::fail_mirror(&h.members[3], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    common::drain_pending(&h).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(h.tool.calls.lock().len(), 1);
    assert_eq!(h.array.degraded_mask().count_ones(), 1);
}

/// Invariant 1 — concurrent fail_mirror calls on different sides never
/// leave more than one pending action queued at once.
#[tokio::test]
async fn invariant_single_flight_pending_action() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    let (a, b) = tokio::join!(
        policy::fail_mirror(&h.members[0], RaidState::Faulty, FailMode::Mirror, &h.executor),
        policy::fail_mirror(&h.members[1], RaidState::Faulty, FailMode::Mirror, &h.executor),
    );
    a.unwrap();
    b.unwrap();
    common::drain_pending(&h).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(h.tool.calls.lock().len(), 1, "only one side was actually failed");
    assert_eq!(h.array.degraded_mask().count_ones(), 1);
}

/// Invariant 4 — with no slot known, the side choice is the
/// minority-populated side, and ties are rejected.
#[tokio::test]
async fn invariant_side_choice_falls_back_to_minority() {
    let array = Arc::new(Array::new("md1", 3, 2));
    let side_a_1 = Arc::new(Device::new("dasda", "/dev/dasda".into()));
    side_a_1.set_raid_state(RaidState::InSync, Some(0));
    let side_a_2 = Arc::new(Device::new("dasdc", "/dev/dasdc".into()));
    side_a_2.set_raid_state(RaidState::InSync, Some(2));
    let unknown = Arc::new(Device::new("dasdb", "/dev/dasdb".into()));
    unknown.set_raid_state(RaidState::InSync, None);
    unknown.set_io_state(IoState::Ok);

    for dev in [&side_a_1, &side_a_2, &unknown] {
        dev.set_parent(Arc::downgrade(&array));
        array.add_child(dev.clone());
    }

    let tool = Arc::new(FakeManagementTool::default());
    let dasd = Arc::new(FakeDasdIoctl::default());
    let mpath = Arc::new(FakeQueueingControl::default());
    let raid_ioctl = Arc::new(FakeRaidIoctl::new(ArrayInfo::default()));
    let registry = Arc::new(ArrayRegistry::new(raid_ioctl));
    let (executor, _handle) =
        ManagementExecutor::new(registry, tool.clone(), dasd, mpath, Duration::from_millis(20));
    tokio::spawn(executor.clone().run());

    policy::fail_mirror(&unknown, RaidState::Faulty, FailMode::Mirror, &executor)
        .await
        .unwrap();
    for _ in 0..50 {
        if array.pending().is_none() && !tool.calls.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        tool.calls.lock().last().cloned(),
        Some(Invocation::Fail {
            array: "md1".to_string(),
            side: 'B',
        }),
        "side 1 (B) is the unoccupied minority side"
    );
}

/// Invariant 6 — while an array is in discovery, fail_mirror is a no-op:
/// no component mutation, no queued action.
#[tokio::test]
async fn invariant_no_action_while_in_discovery() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());
    h.array.set_in_discovery(true);

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(h.array.pending().is_none());
    assert!(h.tool.calls.lock().is_empty());
    assert_eq!(h.members[1].raid_state(), RaidState::InSync);
}

/// Invariant 5 — reset_mirror only enqueues once the ready count equals
/// raid_disks; a member stuck with unresolved I/O holds it back.
#[tokio::test]
async fn invariant_ready_count_law_blocks_reset() {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    policy::fail_mirror(&h.members[1], RaidState::Timeout, FailMode::Mirror, &h.executor)
        .await
        .unwrap();
    common::drain_pending(&h).await;

    // dasdd's I/O status is still unresolved, so the ready count can never
    // reach raid_disks even though dasdb itself looks fine.
    h.members[3].set_io_state(IoState::Unknown);

    policy::reset_mirror(&h.members[1], &h.executor).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(h.array.pending().is_none(), "ready count below raid_disks, nothing enqueued");
    assert_eq!(h.tool.calls.lock().len(), 1, "still just the original fail call");
}
