//! Per-unit identity provisioning and flashing through external programmers.

pub mod constants;
pub mod device;
pub mod eeprom;
pub mod error;
pub mod flashing;
pub mod format;
pub mod identity;
pub mod runner;

pub use self::device::{DeviceDb, DeviceDescriptor, Processor};
pub use self::error::{Error, Result};
pub use self::flashing::{Backend, BackendKind, FlashJob, FlashOptions, Flasher};
pub use self::format::Image;
pub use self::identity::Identity;
pub use self::runner::{ProcessRunner, ToolCommand, ToolRunner};
