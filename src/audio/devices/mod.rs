pub mod device;
pub mod registry;
pub mod simulated;
pub mod virtual_device;

pub use device::{AudioDevice, DeviceError, DeviceHandle, IoDirection};
