//! Command-line client for `raidguardd`'s control socket, grounded in
//! `cli_command()` in `md_monitor.c`.

use std::path::PathBuf;

use nix::sys::socket::{
    bind, connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "raidguardctl", about = "Control client for raidguardd")]
struct Opt {
    /// Abstract-namespace name the daemon is listening on.
    #[structopt(long, default_value = "raidguardd")]
    socket: String,

    #[structopt(subcommand)]
    cmd: Verb,
}

#[derive(Debug, StructOpt)]
enum Verb {
    /// Ask the daemon to shut down cleanly.
    Shutdown,
    /// Print the verbs the daemon understands.
    Help,
    /// Print per-slot RAID state for an array.
    ArrayStatus { array: String },
    /// Print the single-character RAID-state string for an array.
    MirrorStatus { array: String },
    /// Print the single-character I/O-state string for an array.
    MonitorStatus { array: String },
    /// Notify the daemon a rebuild of `array` has started.
    RebuildStarted { array: String },
    /// Notify the daemon a rebuild of `array` has finished.
    RebuildFinished { array: String },
    /// Notify the daemon `array` can no longer be found.
    DeviceDisappeared { array: String },
    /// Fail `device` out of `array`.
    Fail { array: String, device: PathBuf },
    /// Fail a spare `device` out of `array`.
    FailSpare { array: String, device: PathBuf },
    /// Mark `device` removed from `array`.
    Remove { array: String, device: PathBuf },
    /// Re-arm `device` (or, if omitted, rediscover all members of `array`).
    SpareActive { array: String, device: Option<PathBuf> },
}

impl Verb {
    fn to_wire(&self) -> String {
        match self {
            Verb::Shutdown => "Shutdown".to_string(),
            Verb::Help => "Help".to_string(),
            Verb::ArrayStatus { array } => format!("ArrayStatus:{array}"),
            Verb::MirrorStatus { array } => format!("MirrorStatus:{array}"),
            Verb::MonitorStatus { array } => format!("MonitorStatus:{array}"),
            Verb::RebuildStarted { array } => format!("RebuildStarted:{array}"),
            Verb::RebuildFinished { array } => format!("RebuildFinished:{array}"),
            Verb::DeviceDisappeared { array } => format!("DeviceDisappeared:{array}"),
            Verb::Fail { array, device } => format!("Fail:{}@{}", array, device.display()),
            Verb::FailSpare { array, device } => format!("FailSpare:{}@{}", array, device.display()),
            Verb::Remove { array, device } => format!("Remove:{}@{}", array, device.display()),
            Verb::SpareActive { array, device } => match device {
                Some(d) => format!("SpareActive:{}@{}", array, d.display()),
                None => format!("SpareActive:{array}"),
            },
        }
    }
}

fn main() -> std::process::ExitCode {
    let opt = Opt::from_args();
    match run(&opt) {
        Ok(reply) => {
            if !reply.is_empty() {
                println!("{reply}");
            }
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("raidguardctl: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(opt: &Opt) -> Result<String, Box<dyn std::error::Error>> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )?;

    let local_name = format!("/org/raidguardd/ctl/{}", std::process::id());
    let local_addr = UnixAddr::new_abstract(local_name.as_bytes())?;
    bind(fd, &nix::sys::socket::SockAddr::Unix(local_addr))?;

    let peer_addr = UnixAddr::new_abstract(opt.socket.as_bytes())?;
    connect(fd, &nix::sys::socket::SockAddr::Unix(peer_addr))?;

    let wire = opt.cmd.to_wire();
    send(fd, wire.as_bytes(), MsgFlags::empty())?;

    let mut buf = [0u8; 4096];
    let n = recv(fd, &mut buf, MsgFlags::empty())?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}
