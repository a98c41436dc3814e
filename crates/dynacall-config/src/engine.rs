//! Engine configuration (dynacall.toml)
//!
//! Every section is optional; accessors fall back to built-in defaults so a
//! missing file and an empty file behave the same.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default stack size for threads that execute native calls (8 MiB, the
/// usual main-thread size on Unix).
pub const DEFAULT_NATIVE_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Smallest accepted native stack size.
pub const MIN_NATIVE_STACK_SIZE: usize = 64 * 1024;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Symbol resolver settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverConfig>,

    /// Scheduler-safe call gate settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateConfig>,

    /// Callback bridge settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbacksConfig>,
}

/// Resolver settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Open-mode flags used when the caller does not pass any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<Vec<OpenFlag>>,
}

/// Gate settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// How native calls are bracketed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<GateMode>,

    /// Stack size in bytes for threads running native code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_stack_size: Option<usize>,

    /// Worker threads of the engine-owned tokio runtime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

/// Callback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CallbacksConfig {
    /// Reuse one trampoline per (host function, signature) pair
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

/// Symbolic dynamic-linker open flags
///
/// Mapped to the native `RTLD_*` values by the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OpenFlag {
    Lazy,
    Now,
    Local,
    Global,
}

impl FromStr for OpenFlag {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lazy" => Ok(OpenFlag::Lazy),
            "now" => Ok(OpenFlag::Now),
            "local" => Ok(OpenFlag::Local),
            "global" => Ok(OpenFlag::Global),
            other => Err(ConfigError::InvalidValue {
                field: "resolver.default_mode".to_string(),
                reason: format!("unknown open flag '{}'", other),
            }),
        }
    }
}

/// How the gate brackets a native call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GateMode {
    /// `block_in_place` inside a multi-thread tokio runtime, inline otherwise
    #[default]
    Auto,
    /// Run each call on a dedicated thread with a native-sized stack
    ///
    /// The call runs on a different OS thread than its caller, so native
    /// state bound to the calling thread is not visible to it: `errno` read
    /// afterwards, a GL context made current by the caller, and APIs that
    /// must run on the main thread. Use `Auto` for such libraries.
    NativeThread,
    /// Like `Auto`, but never switches to a native thread
    ///
    /// The scheduler is still told about the blocking call.
    Direct,
}

impl FromStr for GateMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(GateMode::Auto),
            "native-thread" | "native_thread" => Ok(GateMode::NativeThread),
            "direct" => Ok(GateMode::Direct),
            other => Err(ConfigError::InvalidValue {
                field: "gate.mode".to_string(),
                reason: format!(
                    "must be 'auto', 'native-thread', or 'direct', got '{}'",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateMode::Auto => write!(f, "auto"),
            GateMode::NativeThread => write!(f, "native-thread"),
            GateMode::Direct => write!(f, "direct"),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(gate) = &self.gate {
            if let Some(size) = gate.native_stack_size {
                if size < MIN_NATIVE_STACK_SIZE {
                    return Err(ConfigError::InvalidValue {
                        field: "gate.native_stack_size".to_string(),
                        reason: format!(
                            "must be at least {} bytes, got {}",
                            MIN_NATIVE_STACK_SIZE, size
                        ),
                    });
                }
            }
            if gate.worker_threads == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "gate.worker_threads".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if let Some(flags) = self.resolver.as_ref().and_then(|r| r.default_mode.as_ref()) {
            if flags.contains(&OpenFlag::Lazy) && flags.contains(&OpenFlag::Now) {
                return Err(ConfigError::InvalidValue {
                    field: "resolver.default_mode".to_string(),
                    reason: "'lazy' and 'now' are mutually exclusive".to_string(),
                });
            }
            if flags.contains(&OpenFlag::Local) && flags.contains(&OpenFlag::Global) {
                return Err(ConfigError::InvalidValue {
                    field: "resolver.default_mode".to_string(),
                    reason: "'local' and 'global' are mutually exclusive".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Merge another config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &EngineConfig) {
        if let Some(resolver) = &other.resolver {
            let mine = self.resolver.get_or_insert_with(Default::default);
            if resolver.default_mode.is_some() {
                mine.default_mode = resolver.default_mode.clone();
            }
        }
        if let Some(gate) = &other.gate {
            let mine = self.gate.get_or_insert_with(Default::default);
            if gate.mode.is_some() {
                mine.mode = gate.mode;
            }
            if gate.native_stack_size.is_some() {
                mine.native_stack_size = gate.native_stack_size;
            }
            if gate.worker_threads.is_some() {
                mine.worker_threads = gate.worker_threads;
            }
        }
        if let Some(callbacks) = &other.callbacks {
            let mine = self.callbacks.get_or_insert_with(Default::default);
            if callbacks.cache.is_some() {
                mine.cache = callbacks.cache;
            }
        }
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Effective gate mode (default: auto)
    pub fn gate_mode(&self) -> GateMode {
        self.gate.as_ref().and_then(|g| g.mode).unwrap_or_default()
    }

    /// Effective native stack size in bytes
    pub fn native_stack_size(&self) -> usize {
        self.gate
            .as_ref()
            .and_then(|g| g.native_stack_size)
            .unwrap_or(DEFAULT_NATIVE_STACK_SIZE)
    }

    /// Worker thread count for the engine-owned runtime (None: tokio default)
    pub fn worker_threads(&self) -> Option<usize> {
        self.gate.as_ref().and_then(|g| g.worker_threads)
    }

    /// Effective default open flags (default: now + global)
    pub fn default_open_flags(&self) -> Vec<OpenFlag> {
        self.resolver
            .as_ref()
            .and_then(|r| r.default_mode.clone())
            .unwrap_or_else(|| vec![OpenFlag::Now, OpenFlag::Global])
    }

    /// Whether callback trampolines are cached (default: true)
    pub fn callback_cache(&self) -> bool {
        self.callbacks
            .as_ref()
            .and_then(|c| c.cache)
            .unwrap_or(true)
    }
}
