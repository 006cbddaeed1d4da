pub mod config;
pub mod disk;
pub mod log_buffer;
pub mod logging;

pub use config::{build_runner, load_points, Settings};
pub use log_buffer::{LogEntry, RunLog};
