pub mod array;
pub mod dasd;
pub mod device;
pub mod error;
pub mod raid_ioctl;
pub mod registry;
pub mod sysfs;

pub use array::Array;
pub use device::{Device, IoState, RaidState};
