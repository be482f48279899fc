pub mod controls;
pub mod devices;
pub mod manager;
pub mod playthrough;
pub mod ring_buffer;
pub mod rt_logger;
pub mod scheduler;
pub mod types;
