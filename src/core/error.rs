use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display("array '{}' is already registered", name))]
    ArrayExists { name: String },

    #[snafu(display("array '{}' is not registered", name))]
    UnknownArray { name: String },

    #[snafu(display("device '{}' is already attached to array '{}'", device, array))]
    DeviceExists { array: String, device: String },

    #[snafu(display("device '{}' is not a member of array '{}'", device, array))]
    UnknownDevice { array: String, device: String },

    #[snafu(display("failed to enumerate members of '{}': {}", array, source))]
    Discover {
        array: String,
        source: std::io::Error,
    },

    #[snafu(display("'{}' does not look like a RAID-10 array", name))]
    NotRaid10 { name: String },

    #[snafu(display("cannot query array info for '{}': {}", name, source))]
    ArrayInfo { name: String, source: nix::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProbeError {
    #[snafu(display("cannot open '{}' for direct I/O: {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to query block size of '{}': {}", path.display(), source))]
    QueryBlockSize {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("io_uring setup failed: {}", source))]
    RingSetup { source: std::io::Error },

    #[snafu(display("io_uring submission failed: {}", source))]
    Submit { source: std::io::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OracleError {
    #[snafu(display("cannot open '{}' to query RAID state: {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("GET_DISK_INFO ioctl failed on slot {}: {}", slot, source))]
    DiskInfo {
        slot: i32,
        source: nix::Error,
    },

    #[snafu(display("GET_ARRAY_INFO ioctl failed: {}", source))]
    ArrayInfo { source: nix::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PolicyError {
    #[snafu(display("array '{}' has both sides degraded, refusing to act", array))]
    BothSidesDegraded { array: String },

    #[snafu(display("cannot determine mirror side for '{}' in array '{}'", device, array))]
    AmbiguousSide { array: String, device: String },

    #[snafu(display("array '{}' has no healthy side to reset onto", array))]
    NoHealthySide { array: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExecutorError {
    #[snafu(display("failed to spawn '{}': {}", tool, source))]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[snafu(display("'{}' exited with status {}", tool, code))]
    ToolFailed { tool: String, code: i32 },

    #[snafu(display("'{}' was terminated by a signal", tool))]
    ToolSignaled { tool: String },

    #[snafu(display("DASD ioctl failed on '{}': {}", device, source))]
    Dasd {
        device: String,
        source: nix::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MultipathError {
    #[snafu(display("cannot connect to multipathd socket '{}': {}", path.display(), source))]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("multipathd connection reset while {}", while_))]
    ConnectionReset { while_: String },

    #[snafu(display("malformed multipathd reply: {}", line))]
    MalformedReply { line: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControlError {
    #[snafu(display("cannot bind control socket '{}': {}", path, source))]
    Bind {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("peer credentials missing or not root (uid {})", uid))]
    NotPermitted { uid: u32 },

    #[snafu(display("malformed verb '{}'", verb))]
    MalformedVerb { verb: String },

    #[snafu(display("{}", source))]
    Registry { source: RegistryError },

    #[snafu(display("{}", source))]
    Policy { source: PolicyError },
}
