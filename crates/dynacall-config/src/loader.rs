//! Configuration Loader
//!
//! Layers the global file, the nearest dynacall.toml and DYNACALL_* variables.

use crate::engine::{EngineConfig, GateConfig, OpenFlag, ResolverConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// File name searched for when walking up from a start directory
pub const PROJECT_CONFIG_FILE: &str = "dynacall.toml";

/// Configuration loader
///
/// Sources, from lowest to highest precedence:
/// 1. Global config (~/.dynacall/config.toml) - lowest priority
/// 2. Project config (./dynacall.toml) - overrides global
/// 3. Environment variables (DYNACALL_*) - overrides project
/// 4. CLI flags - applied by the binary on top of the result
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Effective configuration and where it came from
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Effective engine configuration
    pub engine: EngineConfig,

    /// Directory where dynacall.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader using ~/.dynacall/config.toml as the global file
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config path instead of ~/.dynacall/config.toml
    pub fn with_global_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Effective configuration for commands run in `start_dir`
    ///
    /// Walks up the directory tree to find dynacall.toml, layers it over the
    /// global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let mut engine = self.load_global_config()?;

        let (project_root, project_config) = self.find_project_config(start_dir)?;
        engine.merge(&project_config);

        let engine = self.apply_env_overrides(engine)?;
        engine.validate()?;

        Ok(Config {
            engine,
            project_root,
        })
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let mut engine = self.load_global_config()?;
        engine.merge(&EngineConfig::load_from_file(config_path)?);

        let engine = self.apply_env_overrides(engine)?;
        engine.validate()?;

        Ok(Config {
            engine,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Nearest dynacall.toml at or above `start_dir`
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, EngineConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = EngineConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, EngineConfig::default())),
            }
        }
    }

    /// Load global configuration; a missing file is not an error
    fn load_global_config(&mut self) -> ConfigResult<EngineConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match Self::global_config_dir() {
                Ok(dir) => {
                    let path = dir.join("config.toml");
                    self.global_config_path = Some(path.clone());
                    path
                }
                // No home directory: nothing to layer
                Err(ConfigError::HomeNotFound) => return Ok(EngineConfig::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(EngineConfig::default());
        }

        EngineConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognized: DYNACALL_GATE_MODE, DYNACALL_NATIVE_STACK_SIZE,
    /// DYNACALL_WORKER_THREADS, DYNACALL_OPEN_MODE (comma separated flags)
    fn apply_env_overrides(&self, mut config: EngineConfig) -> ConfigResult<EngineConfig> {
        if let Ok(mode) = env::var("DYNACALL_GATE_MODE") {
            config.gate.get_or_insert_with(GateConfig::default).mode = Some(mode.parse()?);
        }

        if let Ok(size) = env::var("DYNACALL_NATIVE_STACK_SIZE") {
            let size = parse_usize("DYNACALL_NATIVE_STACK_SIZE", &size)?;
            config
                .gate
                .get_or_insert_with(GateConfig::default)
                .native_stack_size = Some(size);
        }

        if let Ok(threads) = env::var("DYNACALL_WORKER_THREADS") {
            let threads = parse_usize("DYNACALL_WORKER_THREADS", &threads)?;
            config.gate.get_or_insert_with(GateConfig::default).worker_threads = Some(threads);
        }

        if let Ok(mode) = env::var("DYNACALL_OPEN_MODE") {
            let flags = mode
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse::<OpenFlag>)
                .collect::<ConfigResult<Vec<_>>>()?;
            config
                .resolver
                .get_or_insert_with(ResolverConfig::default)
                .default_mode = Some(flags);
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.dynacall)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".dynacall"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Directory holding the dynacall.toml that was applied
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a dynacall.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

fn parse_usize(field: &str, value: &str) -> ConfigResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        })
}
