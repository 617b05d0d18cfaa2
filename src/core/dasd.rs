use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::{ioctl_none, Result as NixResult};

const DASD_IOCTL_LETTER: u8 = b'D';

ioctl_none!(biodasdtimeout, DASD_IOCTL_LETTER, 240);
ioctl_none!(biodasdresync, DASD_IOCTL_LETTER, 241);
ioctl_none!(biodasdquiesce, DASD_IOCTL_LETTER, 6);
ioctl_none!(biodasdresume, DASD_IOCTL_LETTER, 7);

/// The DASD ioctl surface used by `fail_component`/`reset_component`:
/// set/clear the per-path timeout flag and quiesce/resume I/O. Mirrors
/// `dasd_ioctl.c`'s four entry points one-for-one.
pub trait DasdIoctl: Send + Sync {
    fn set_timeout(&self, devnode: &Path) -> NixResult<()>;
    fn clear_timeout(&self, devnode: &Path) -> NixResult<()>;
    fn quiesce(&self, devnode: &Path) -> NixResult<()>;
    fn resume(&self, devnode: &Path) -> NixResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealDasdIoctl;

impl RealDasdIoctl {
    fn with_fd<F>(devnode: &Path, f: F) -> NixResult<()>
    where
        F: FnOnce(i32) -> nix::Result<libc::c_int>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(devnode)
            .map_err(|e| nix::Error::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))?;
        f(file.as_raw_fd()).map(|_| ())
    }
}

impl DasdIoctl for RealDasdIoctl {
    fn set_timeout(&self, devnode: &Path) -> NixResult<()> {
        Self::with_fd(devnode, |fd| unsafe { biodasdtimeout(fd) })
    }

    fn clear_timeout(&self, devnode: &Path) -> NixResult<()> {
        Self::with_fd(devnode, |fd| unsafe { biodasdresync(fd) })
    }

    fn quiesce(&self, devnode: &Path) -> NixResult<()> {
        Self::with_fd(devnode, |fd| unsafe { biodasdquiesce(fd) })
    }

    fn resume(&self, devnode: &Path) -> NixResult<()> {
        Self::with_fd(devnode, |fd| unsafe { biodasdresume(fd) })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DasdCall {
        SetTimeout,
        ClearTimeout,
        Quiesce,
        Resume,
    }

    /// Records every ioctl requested against every devnode, never fails.
    #[derive(Default)]
    pub struct FakeDasdIoctl {
        pub calls: Mutex<Vec<(String, DasdCall)>>,
    }

    impl FakeDasdIoctl {
        fn record(&self, devnode: &Path, call: DasdCall) -> NixResult<()> {
            self.calls
                .lock()
                .push((devnode.to_string_lossy().into_owned(), call));
            Ok(())
        }
    }

    impl DasdIoctl for FakeDasdIoctl {
        fn set_timeout(&self, devnode: &Path) -> NixResult<()> {
            self.record(devnode, DasdCall::SetTimeout)
        }

        fn clear_timeout(&self, devnode: &Path) -> NixResult<()> {
            self.record(devnode, DasdCall::ClearTimeout)
        }

        fn quiesce(&self, devnode: &Path) -> NixResult<()> {
            self.record(devnode, DasdCall::Quiesce)
        }

        fn resume(&self, devnode: &Path) -> NixResult<()> {
            self.record(devnode, DasdCall::Resume)
        }
    }
}
