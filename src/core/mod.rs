pub mod circular_buffer;
pub mod config;
pub mod event;
pub mod frame;
pub mod health;
pub mod reconnect;
pub mod types;
pub mod wait;

pub use circular_buffer::*;
pub use config::*;
pub use event::*;
pub use frame::*;
pub use health::*;
pub use reconnect::*;
pub use types::*;
pub use wait::*;
