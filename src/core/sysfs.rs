use std::io;
use std::path::{Path, PathBuf};

/// Thin typed accessor over one device's `/sys/block/<dev>/md/...`
/// attribute directory. The original reaches into sysfs ad hoc with
/// `fopen`/`fscanf`; this gives the same reads/writes a single, testable
/// seam (`base` can point at a tmpdir fixture in tests).
#[derive(Debug, Clone)]
pub struct SysfsStore {
    base: PathBuf,
}

impl SysfsStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        SysfsStore { base: base.into() }
    }

    pub fn for_block_device(name: &str) -> Self {
        SysfsStore::new(Path::new("/sys/block").join(name).join("md"))
    }

    fn path(&self, attr: &str) -> PathBuf {
        self.base.join(attr)
    }

    pub fn read_string(&self, attr: &str) -> io::Result<String> {
        Ok(std::fs::read_to_string(self.path(attr))?.trim().to_string())
    }

    pub fn read_u32(&self, attr: &str) -> io::Result<u32> {
        self.read_string(attr)?
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "not a u32"))
    }

    pub fn write_string(&self, attr: &str, value: &str) -> io::Result<()> {
        std::fs::write(self.path(attr), value)
    }

    /// Clears the `failfast` flag on a mirror-side member, the sysfs side
    /// effect `fail_md()` applies to the surviving side once the faulty
    /// side has been failed out.
    pub fn clear_failfast(&self) -> io::Result<()> {
        self.write_string("failfast", "0")
    }

    pub fn set_failfast(&self) -> io::Result<()> {
        self.write_string("failfast", "1")
    }
}
