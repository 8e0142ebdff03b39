//! Error taxonomy for Overwatch.
//!
//! Only configuration and validation errors reach callers as `Err`. Handler and
//! assignment failures are folded into task results and assignment state.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverwatchError {
    /// Unknown task type, priority or strategy, or a malformed submission.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No registered handler accepts the task.
    #[error("No handler registered for task type {0}")]
    NoHandler(String),

    /// The assignment strategy found zero eligible bots.
    #[error("No eligible bot for task {0}")]
    NoEligibleBot(String),

    /// A handler panicked or reported a failure.
    #[error("Handler execution failed: {0}")]
    HandlerExecution(String),

    /// The health monitor timed out a bot.
    #[error("Bot disconnected: {0}")]
    BotDisconnected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OverwatchError>;

impl OverwatchError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::HandlerExecution(msg.into())
    }

    /// Whether a task failing with this error may be attempted again.
    /// Missing handlers and validation failures will fail the same way next time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OverwatchError::HandlerExecution(_) | OverwatchError::BotDisconnected(_)
        )
    }
}

impl From<serde_json::Error> for OverwatchError {
    fn from(err: serde_json::Error) -> Self {
        OverwatchError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for OverwatchError {
    fn from(err: toml::de::Error) -> Self {
        OverwatchError::Config(format!("Failed to parse config: {err}"))
    }
}

impl From<toml::ser::Error> for OverwatchError {
    fn from(err: toml::ser::Error) -> Self {
        OverwatchError::Config(format!("Failed to serialize config: {err}"))
    }
}
