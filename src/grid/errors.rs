//! Grid-specific error types

use thiserror::Error;

use super::types::{AccountKey, StrategyId};

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("Strategy not found: {0}")]
    StrategyNotFound(StrategyId),

    #[error("Grid level not found: index {0}")]
    LevelNotFound(u32),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Order resync failed for {account} after {attempts} attempts")]
    Reconciliation { account: AccountKey, attempts: usize },

    #[error("Order {client_order_id} of strategy {strategy_id} was canceled unexpectedly")]
    UnexpectedCancel {
        strategy_id: StrategyId,
        client_order_id: String,
    },

    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Settings error: {0}")]
    Config(String),
}

/// Coarse classification used by the engine to pick a failure path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, rate limit, store hiccup: retried on the fixed strategy delay
    Transient,
    /// Full resync failed for every strategy on an account
    Reconciliation,
    /// A grid order disappeared without the engine canceling it
    UnexpectedCancellation,
    /// Rejected synchronously, never retried
    Validation,
}

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::InvalidConfig(_)
            | GridError::InsufficientMargin { .. }
            | GridError::InvalidState(_)
            | GridError::Config(_) => ErrorKind::Validation,
            GridError::Reconciliation { .. } => ErrorKind::Reconciliation,
            GridError::UnexpectedCancel { .. } => ErrorKind::UnexpectedCancellation,
            _ => ErrorKind::Transient,
        }
    }

    pub fn is_unexpected_cancel(&self) -> bool {
        self.kind() == ErrorKind::UnexpectedCancellation
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Store(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Config(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
