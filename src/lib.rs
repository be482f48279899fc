pub mod audio;
pub mod log;

pub use audio::manager::{DeviceManager, PlaythroughStatus};
