use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use crate::policy::FailMode;

fn parse_fail_mode(src: &str) -> Result<FailMode, String> {
    match src {
        "mirror" => Ok(FailMode::Mirror),
        "disk" => Ok(FailMode::Disk),
        other => Err(format!("invalid fail-mode '{}', expected 'mirror' or 'disk'", other)),
    }
}

fn parse_seconds(src: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(src.parse()?))
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "raidguardd", about = "RAID-10/DASD/multipath supervisor daemon")]
pub struct Config {
    /// Base interval the management executor waits for new work, and the
    /// unit `monitor_timeout` is computed from.
    #[structopt(long, default_value = "4", parse(try_from_str = parse_seconds))]
    pub failfast_timeout: Duration,

    /// Retries folded into a member's aio timeout window; must be >= 2.
    #[structopt(long, default_value = "2")]
    pub failfast_retries: u32,

    /// How long a monitor task waits between iterations when idle.
    #[structopt(long, default_value = "60", parse(try_from_str = parse_seconds))]
    pub checker_timeout: Duration,

    /// `mirror` fails a whole side; `disk` fails only the affected
    /// component.
    #[structopt(long, default_value = "mirror", parse(try_from_str = parse_fail_mode))]
    pub fail_mode: FailMode,

    /// Stop monitoring a member once it settles in sync.
    #[structopt(long)]
    pub stop_on_sync: bool,

    #[structopt(long, default_value = "info")]
    pub log_priority: String,

    #[structopt(long, default_value = "default")]
    pub log_format: String,

    /// Stack size hint for monitor tasks; kept for parity with the
    /// original's `pthread_attr_setstacksize`, applied to the OS thread
    /// backing the blocking probe reap.
    #[structopt(long, default_value = "262144")]
    pub pthread_stack_size: usize,

    #[structopt(long)]
    pub foreground: bool,

    #[structopt(long, default_value = "raidguardd")]
    pub control_socket: String,

    #[structopt(long, default_value = "/var/run/multipathd.sock")]
    pub mpath_socket: PathBuf,

    #[structopt(long, default_value = "mdadm")]
    pub mdadm_binary: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.failfast_retries < 2 {
            return Err("failfast-retries must be >= 2".to_string());
        }
        Ok(())
    }

    pub fn monitor_timeout(&self) -> Duration {
        self.failfast_timeout * (self.failfast_retries + 1)
    }
}
