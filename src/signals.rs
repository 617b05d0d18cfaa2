//! Process-wide shutdown plumbing. The original blocks a dedicated
//! real-time "recheck" signal and unblocks it narrowly around specific
//! blocking waits; per the design notes this reimplementation replaces
//! that with `tokio::sync::Notify` at each suspension point (see
//! `core::device::Device::recheck`) and keeps real Unix signal handling
//! only for process termination, via `signal-hook`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::sync::watch;
use tracing::info;

pub struct ShutdownHandle {
    pub receiver: watch::Receiver<bool>,
}

/// Installs handlers for `SIGINT`/`SIGTERM` that flip a shared flag and a
/// `watch` channel every suspension point can select on.
pub fn install() -> Result<ShutdownHandle, std::io::Error> {
    let (tx, rx) = watch::channel(false);
    let flag = Arc::new(AtomicBool::new(false));

    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("raidguardd-signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                info!(signal = sig, "termination signal received");
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(true);
                break;
            }
        })?;

    Ok(ShutdownHandle { receiver: rx })
}
