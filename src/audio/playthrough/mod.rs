pub mod engine;
pub mod io_state;

pub use engine::Playthrough;
pub use io_state::IoState;
