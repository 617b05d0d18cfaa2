//! C3: Path Probe Engine. Exercises one member with a small direct-I/O read
//! and classifies the outcome, the `io_uring`-based analogue of the
//! original's `libaio` `io_submit`/`io_getevents` pair.

use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use io_uring::{opcode, types, IoUring};
use snafu::ResultExt;
use tokio::sync::Notify;

use crate::core::dasd::DasdIoctl;
use crate::core::error::{OpenSnafu, ProbeError, QueryBlockSizeSnafu, RingSetupSnafu};

const MAX_BLOCK_SIZE: usize = 4096;
const PROBE_USER_DATA: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Ok,
    Failed,
    Timeout,
    Pending,
    Error,
    Unknown,
}

#[async_trait]
pub trait ProbeEngine: Send {
    async fn setup(&mut self) -> Result<(), ProbeError>;
    async fn probe(&mut self, timeout: Duration) -> (IoOutcome, Option<Duration>);
    async fn teardown(&mut self);
}

/// Owns the open file, ring, and aligned buffer exclusively for the
/// lifetime of one member's monitor task (see the resource policy in
/// `SPEC_FULL.md`): nothing outside the owning task ever touches these.
pub struct UringProbe {
    devnode: PathBuf,
    is_dasd: bool,
    dasd: Arc<dyn DasdIoctl>,
    recheck: Arc<Notify>,
    file: Option<std::fs::File>,
    ring: Option<IoUring>,
    buf: Option<Box<[u8]>>,
    block_size: usize,
    outstanding: bool,
}

impl UringProbe {
    pub fn new(devnode: PathBuf, is_dasd: bool, dasd: Arc<dyn DasdIoctl>, recheck: Arc<Notify>) -> Self {
        UringProbe {
            devnode,
            is_dasd,
            dasd,
            recheck,
            file: None,
            ring: None,
            buf: None,
            block_size: MAX_BLOCK_SIZE,
            outstanding: false,
        }
    }

    fn query_block_size(file: &std::fs::File) -> std::io::Result<usize> {
        let mut size: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::BLKBSZGET, &mut size as *mut _) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((size as usize).min(MAX_BLOCK_SIZE).max(512))
    }
}

#[async_trait]
impl ProbeEngine for UringProbe {
    async fn setup(&mut self) -> Result<(), ProbeError> {
        let devnode = self.devnode.clone();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT | libc::O_NONBLOCK)
            .open(&devnode)
            .context(OpenSnafu { path: devnode.clone() })?;
        let block_size = Self::query_block_size(&file).context(QueryBlockSizeSnafu {
            path: devnode.clone(),
        })?;
        let ring = IoUring::new(1).context(RingSetupSnafu)?;
        let layout = std::alloc::Layout::from_size_align(block_size, block_size)
            .expect("block size is always a nonzero power of two");
        let buf = unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            Box::from_raw(std::slice::from_raw_parts_mut(ptr, block_size))
        };
        self.block_size = block_size;
        self.file = Some(file);
        self.ring = Some(ring);
        self.buf = Some(buf);
        self.outstanding = false;
        Ok(())
    }

    async fn probe(&mut self, timeout: Duration) -> (IoOutcome, Option<Duration>) {
        let (Some(file), Some(ring), Some(buf)) = (
            self.file.as_ref(),
            self.ring.as_mut(),
            self.buf.as_mut(),
        ) else {
            return (IoOutcome::Unknown, None);
        };

        if !self.outstanding {
            if timeout == Duration::ZERO {
                return (IoOutcome::Unknown, None);
            }
            let read_e = opcode::Read::new(types::Fd(file.as_raw_fd()), buf.as_mut_ptr(), buf.len() as u32)
                .offset(0)
                .build()
                .user_data(PROBE_USER_DATA);
            unsafe {
                if ring.submission().push(&read_e).is_err() {
                    return (IoOutcome::Error, None);
                }
            }
            if let Err(_) = ring.submit() {
                return (IoOutcome::Error, None);
            }
            self.outstanding = true;
        }

        let started = Instant::now();
        let recheck = self.recheck.clone();
        let reap = async {
            loop {
                if let Some(cqe) = ring.completion().next() {
                    return Some(cqe);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };

        tokio::select! {
            biased;
            _ = recheck.notified() => {
                let cancel_e = opcode::AsyncCancel::new(PROBE_USER_DATA).build().user_data(2);
                unsafe { let _ = ring.submission().push(&cancel_e); }
                let _ = ring.submit();
                self.outstanding = false;
                (IoOutcome::Pending, None)
            }
            cqe = reap => {
                match cqe {
                    Some(cqe) => {
                        self.outstanding = false;
                        let elapsed = started.elapsed();
                        let result = cqe.result();
                        if result < 0 {
                            (IoOutcome::Error, None)
                        } else if result as usize == buf.len() {
                            (IoOutcome::Ok, Some(elapsed))
                        } else {
                            (IoOutcome::Failed, None)
                        }
                    }
                    None => (IoOutcome::Timeout, None),
                }
            }
            _ = tokio::time::sleep(timeout), if timeout > Duration::ZERO => {
                (IoOutcome::Timeout, None)
            }
        }
    }

    async fn teardown(&mut self) {
        self.ring = None;
        self.file = None;
        self.buf = None;
        if self.is_dasd {
            let _ = self.dasd.clear_timeout(&self.devnode);
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted collaborator for monitor-task tests: returns queued
    /// outcomes in order, `Unknown` once exhausted.
    pub struct FakeProbeEngine {
        pub outcomes: VecDeque<(IoOutcome, Option<Duration>)>,
    }

    impl FakeProbeEngine {
        pub fn new(outcomes: Vec<(IoOutcome, Option<Duration>)>) -> Self {
            FakeProbeEngine {
                outcomes: outcomes.into(),
            }
        }
    }

    #[async_trait]
    impl ProbeEngine for FakeProbeEngine {
        async fn setup(&mut self) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn probe(&mut self, _timeout: Duration) -> (IoOutcome, Option<Duration>) {
            self.outcomes
                .pop_front()
                .unwrap_or((IoOutcome::Unknown, None))
        }

        async fn teardown(&mut self) {}
    }
}

pub fn devnode_is_dasd(name: &str) -> bool {
    name.starts_with("dasd")
}
