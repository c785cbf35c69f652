pub mod alerts;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod rate_limit;
pub mod server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub use alerts::{AlertConfigStore, AlertDefinition, Severity};
pub use dispatcher::{AlertDispatcher, AlertEvent, Dispatch, DispatchOutcome, DispatchResponse};
pub use executor::{ActionExecutor, ActionRunner, ExecutionHandle, ExecutionOutcome, ProcessRunner};
pub use rate_limit::{Clock, ManualClock, RateLimitKey, RateLimiter, SystemClock};
