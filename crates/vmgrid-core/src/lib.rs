pub mod config;
pub mod time;
pub mod types;

pub use config::VmGridConfig;
pub use time::{epoch_secs, parse_duration_secs};
pub use types::*;
