pub mod config;
pub mod error;

pub use config::{Config, LogConfig, TaskConfig};
pub use error::*;
