pub mod control_sync;
pub mod controls_list;

pub use control_sync::DeviceControlSync;
pub use controls_list::DeviceControlsList;
