//! Engine-owned tokio runtime
//!
//! Used when there is no host runtime to borrow: foreign threads calling back
//! in are attached to it, and `call_async` outside any runtime runs its
//! blocking work on it. Built lazily from the `[gate]` configuration.

use crate::error::{FfiError, FfiResult};
use crate::registry::Registry;
use dynacall_config::EngineConfig;
use std::future::Future;
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::runtime::Runtime;
use tracing::debug;

static ENGINE_RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

fn build_runtime(config: &EngineConfig) -> FfiResult<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("dynacall-worker")
        .thread_stack_size(config.native_stack_size());
    if let Some(threads) = config.worker_threads() {
        builder.worker_threads(threads);
    }
    builder
        .build()
        .map_err(|e| FfiError::SchedulerGate(format!("failed to start engine runtime: {}", e)))
}

/// Get the engine runtime, starting it on first use
pub fn runtime() -> FfiResult<&'static Runtime> {
    if let Some(rt) = ENGINE_RUNTIME.get() {
        return Ok(rt);
    }

    let _init = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(rt) = ENGINE_RUNTIME.get() {
        return Ok(rt);
    }
    let rt = build_runtime(Registry::global().config())?;
    debug!("started engine runtime");
    Ok(ENGINE_RUNTIME.get_or_init(|| rt))
}

/// Block on a future using the engine runtime
///
/// Must not be called from inside another runtime.
pub fn block_on<F: Future>(future: F) -> FfiResult<F::Output> {
    Ok(runtime()?.block_on(future))
}
