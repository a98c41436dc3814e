//! Engine errors

use dynacall_config::ConfigError;
use thiserror::Error;

/// Errors surfaced by the FFI engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FfiError {
    #[error("Failed to open library '{path}': {message}")]
    Resolve { path: String, message: String },

    #[error("Symbol '{symbol}' not found")]
    SymbolNotFound { symbol: String },

    #[error("Cannot bind a null function address")]
    NullAddress,

    #[error("Unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("Too many arguments: {needed} stack slots needed, {capacity} available")]
    TooManyArguments { needed: usize, capacity: usize },

    #[error("Expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Value {value} out of range for {target}")]
    OutOfRange { value: String, target: String },

    #[error("Scheduler gate failure: {0}")]
    SchedulerGate(String),

    #[error("Registry already initialized with a different configuration")]
    AlreadyInitialized,

    #[error("Failed to close library: {0}")]
    Close(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ConfigError> for FfiError {
    fn from(e: ConfigError) -> Self {
        FfiError::Config(e.to_string())
    }
}

/// Result type for engine operations
pub type FfiResult<T> = Result<T, FfiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FfiError::ArityMismatch {
            expected: 2,
            got: 3,
        };
        assert_eq!(err.to_string(), "Expected 2 arguments, got 3");

        let err = FfiError::TooManyArguments {
            needed: 10,
            capacity: 9,
        };
        assert!(err.to_string().contains("9 available"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: FfiError = ConfigError::HomeNotFound.into();
        assert_eq!(err, FfiError::Config("Home directory not found".to_string()));
    }
}
