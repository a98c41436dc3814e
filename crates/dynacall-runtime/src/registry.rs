//! Process registry
//!
//! The one process-wide home of engine state: the effective configuration,
//! the call gate, the lock serializing library opens and closes, and the
//! callback trampolines created so far. Initialized once, either explicitly
//! with `Registry::init` / `Registry::init_with_gate` or lazily with
//! defaults by `Registry::global`.

use crate::error::{FfiError, FfiResult};
use crate::gate::CallGate;
use crate::loader::OpenMode;
use crate::types::Signature;
use dynacall_config::EngineConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tracing::debug;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// A trampoline handed out by the callback bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRecord {
    pub address: usize,
    pub signature: Signature,
}

/// Cache key: identity of the host function plus the native signature
type BridgeKey = (usize, Signature);

pub struct Registry {
    config: EngineConfig,
    gate: CallGate,
    resolver_lock: Mutex<()>,
    bridges: Mutex<Vec<BridgeRecord>>,
    bridge_cache: Mutex<HashMap<BridgeKey, usize>>,
}

impl Registry {
    fn new(config: EngineConfig, gate: CallGate) -> Self {
        Self {
            gate,
            config,
            resolver_lock: Mutex::new(()),
            bridges: Mutex::new(Vec::new()),
            bridge_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize the registry with `config`
    ///
    /// Called from inside a tokio runtime, that runtime becomes the host:
    /// foreign threads calling back in are attached to it instead of the
    /// engine runtime. Calling it again with an equal configuration returns
    /// the existing registry; a different one is `AlreadyInitialized`.
    pub fn init(config: EngineConfig) -> FfiResult<&'static Registry> {
        let host = Handle::try_current().ok();
        Self::install(config, move |config| CallGate::from_config(config, host))
    }

    /// Initialize the registry with a gate built by the host
    ///
    /// Every native call and callback re-entry goes through `gate`. A repeat
    /// call follows the same rule as `init` and drops the given gate.
    pub fn init_with_gate(config: EngineConfig, gate: CallGate) -> FfiResult<&'static Registry> {
        Self::install(config, move |_| gate)
    }

    fn install(
        config: EngineConfig,
        gate: impl FnOnce(&EngineConfig) -> CallGate,
    ) -> FfiResult<&'static Registry> {
        config.validate()?;

        let mut created = false;
        let registry = REGISTRY.get_or_init(|| {
            created = true;
            let gate = gate(&config);
            Registry::new(config.clone(), gate)
        });

        if created {
            debug!(
                gate = %registry.config.gate_mode(),
                hooks = registry.gate.hooks_name(),
                "initialized registry"
            );
        } else if registry.config != config {
            return Err(FfiError::AlreadyInitialized);
        }
        Ok(registry)
    }

    /// The registry, initialized with defaults if `init` was never called
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(|| {
            let config = EngineConfig::default();
            let gate = CallGate::from_config(&config, None);
            Registry::new(config, gate)
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gate(&self) -> &CallGate {
        &self.gate
    }

    /// Open mode used by `Library::open`
    pub fn default_open_mode(&self) -> OpenMode {
        OpenMode::from_flags(&self.config.default_open_flags())
    }

    pub(crate) fn with_resolver_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self
            .resolver_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Reuse the trampoline for `(host, signature)` or create one
    ///
    /// Creation runs under the cache lock so concurrent callers share one
    /// trampoline. With caching disabled every call creates a new one.
    pub(crate) fn bridge_for(
        &self,
        host: usize,
        signature: &Signature,
        create: impl FnOnce() -> FfiResult<usize>,
    ) -> FfiResult<usize> {
        if !self.config.callback_cache() {
            return create();
        }

        let mut cache = self
            .bridge_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = (host, signature.clone());
        if let Some(address) = cache.get(&key) {
            return Ok(*address);
        }
        let address = create()?;
        cache.insert(key, address);
        Ok(address)
    }

    pub(crate) fn record_bridge(&self, address: usize, signature: Signature) {
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BridgeRecord { address, signature });
    }

    /// Every trampoline created so far; they live until process exit
    pub fn bridges(&self) -> Vec<BridgeRecord> {
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("bridges", &self.bridge_count())
            .finish()
    }
}
