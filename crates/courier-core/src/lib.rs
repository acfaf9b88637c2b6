//! courier-core — the command model, result codes, and configuration.
//! All other Courier crates depend on this one.

pub mod command;
pub mod config;

pub use command::{codes, Command};
pub use config::{ConfigError, CourierConfig};
