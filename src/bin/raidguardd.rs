use structopt::StructOpt;

use raidguardd::config::Config;
use raidguardd::daemon::Daemon;
use raidguardd::logger::{self, LogFormat};

fn main() -> std::process::ExitCode {
    let config = Config::from_args();
    if let Err(e) = config.validate() {
        eprintln!("raidguardd: invalid configuration: {e}");
        return std::process::ExitCode::FAILURE;
    }

    let format: LogFormat = config
        .log_format
        .parse()
        .unwrap_or_else(|e| panic!("invalid --log-format: {e}"));
    logger::init_ex(&config.log_priority, format);

    if !config.foreground {
        daemonize();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(config.pthread_stack_size)
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("raidguardd: failed to start async runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match rt.block_on(Daemon::new(config).run()) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("raidguardd: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Detaches from the controlling terminal, matching `daemonize()` in
/// `md_monitor.c` (double-fork, new session, redirect stdio to `/dev/null`).
fn daemonize() {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            eprintln!("raidguardd: first fork failed: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = setsid() {
        eprintln!("raidguardd: setsid failed: {e}");
        std::process::exit(1);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            eprintln!("raidguardd: second fork failed: {e}");
            std::process::exit(1);
        }
    }

    let _ = nix::unistd::chdir("/");
    unsafe {
        let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, 0);
            libc::dup2(devnull, 1);
            libc::dup2(devnull, 2);
            if devnull > 2 {
                libc::close(devnull);
            }
        }
    }
}
