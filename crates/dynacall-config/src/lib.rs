//! dynacall configuration system
//!
//! Provides configuration for the dynacall FFI engine:
//! - Engine configuration (`dynacall.toml` / `~/.dynacall/config.toml`)
//! - Layering of the global file, the project file and the environment
//!
//! # Configuration Hierarchy
//!
//! Later sources override earlier ones:
//! 1. Built-in defaults
//! 2. Global config (~/.dynacall/config.toml)
//! 3. Project config (./dynacall.toml, searched upwards)
//! 4. Environment variables (DYNACALL_*)
//! 5. CLI flags (applied by the caller)
//!
//! # Example
//!
//! ```no_run
//! use dynacall_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("gate mode: {}", config.engine.gate_mode());
//! ```

pub mod engine;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result alias for the config crate
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use engine::{
    CallbacksConfig, EngineConfig, GateConfig, GateMode, OpenFlag, ResolverConfig,
    DEFAULT_NATIVE_STACK_SIZE, MIN_NATIVE_STACK_SIZE,
};
pub use loader::{Config, ConfigLoader, PROJECT_CONFIG_FILE};
