//! C10: end-to-end control-socket coverage over a real abstract-namespace
//! `AF_UNIX`/`SOCK_DGRAM` pair, covering S5, S6, and invariants 7 and 8.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{
    bind, connect, recv, send, socket, AddressFamily, MsgFlags, SockAddr, SockFlag, SockType,
    UnixAddr,
};
use raidguardd::control::ControlSocket;
use raidguardd::policy::FailMode;

fn client(peer: &str) -> i32 {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .unwrap();
    let local = UnixAddr::new_abstract(
        format!("raidguardd-test-client-{}-{}", std::process::id(), peer).as_bytes(),
    )
    .unwrap();
    bind(fd, &SockAddr::Unix(local)).unwrap();
    let peer_addr = UnixAddr::new_abstract(peer.as_bytes()).unwrap();
    connect(fd, &SockAddr::Unix(peer_addr)).unwrap();
    fd
}

fn roundtrip(fd: i32, verb: &str) -> Vec<u8> {
    send(fd, verb.as_bytes(), MsgFlags::empty()).unwrap();
    let mut buf = [0u8; 4096];
    let n = recv(fd, &mut buf, MsgFlags::empty()).unwrap();
    buf[..n].to_vec()
}

async fn bind_control(name: &str) -> (Arc<tokio::sync::watch::Sender<bool>>, tokio::task::JoinHandle<()>) {
    let h = common::two_by_two();
    tokio::spawn(h.executor.clone().run());

    let control = ControlSocket::bind(name, h.devices.clone(), h.arrays.clone(), FailMode::Mirror, h.executor.clone())
        .expect("bind control socket");
    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move {
        let _ = control.run(rx).await;
    });
    (Arc::new(tx), task)
}

/// S5 — a status query against an array the daemon has never heard of
/// replies with exactly one byte, the `ENODEV` errno value.
#[tokio::test]
async fn s5_unknown_array_replies_with_enodev() {
    let name = format!("raidguardd-test-s5-{}", std::process::id());
    let (shutdown, task) = bind_control(&name).await;
    let fd = client(&name);

    let reply = roundtrip(fd, "MirrorStatus:nope");
    assert_eq!(reply, vec![libc::ENODEV as u8]);

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

/// S6 — once a rebuild is marked in progress, Fail requests against that
/// array's members are accepted but leave state untouched until the
/// rebuild is marked finished.
#[tokio::test]
async fn s6_rebuild_suppresses_fail_mirror() {
    let name = format!("raidguardd-test-s6-{}", std::process::id());
    let (shutdown, task) = bind_control(&name).await;
    let fd = client(&name);

    let reply = roundtrip(fd, "RebuildStarted:md0");
    assert!(reply.is_empty(), "Ok replies carry no payload");

    let status_before = roundtrip(fd, "MirrorStatus:md0");
    let reply = roundtrip(fd, "Fail:md0@dasdb");
    assert!(reply.is_empty());
    let status_after = roundtrip(fd, "MirrorStatus:md0");
    assert_eq!(status_before, status_after, "in_recovery suppresses the fail");

    let reply = roundtrip(fd, "RebuildFinished:md0");
    assert!(reply.is_empty());

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

/// Invariant 7 — the three reply shapes: empty on success, one errno byte
/// on error, and >1 bytes of status text.
#[tokio::test]
async fn invariant_reply_framing_shapes() {
    let name = format!("raidguardd-test-framing-{}", std::process::id());
    let (shutdown, task) = bind_control(&name).await;
    let fd = client(&name);

    assert!(roundtrip(fd, "RebuildStarted:md0").is_empty());
    assert_eq!(roundtrip(fd, "ArrayStatus:nope"), vec![libc::ENODEV as u8]);
    let status = roundtrip(fd, "MirrorStatus:md0");
    assert!(status.len() > 1);

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

/// Invariant 8 — `MirrorStatus` renders exactly one character per slot
/// from the documented alphabet, all four slots populated here.
#[tokio::test]
async fn invariant_mirror_status_encoding() {
    let name = format!("raidguardd-test-encoding-{}", std::process::id());
    let (shutdown, task) = bind_control(&name).await;
    let fd = client(&name);

    let status = roundtrip(fd, "MirrorStatus:md0");
    let text = String::from_utf8(status).unwrap();
    assert_eq!(text.len(), 4);
    assert!(text.chars().all(|c| "AWTSRB-P.".contains(c)));
    assert_eq!(text, "AAAA");

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}
