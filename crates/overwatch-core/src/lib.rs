//! # Overwatch Core
//!
//! Pieces shared by every Overwatch crate:
//! - [`error`]: the error taxonomy and `Result` alias
//! - [`config`]: TOML configuration with per-field defaults

pub mod config;
pub mod error;

pub use config::{BotEngineConfig, GeneratorConfig, OverwatchConfig, SchedulerConfig};
pub use error::{OverwatchError, Result};
