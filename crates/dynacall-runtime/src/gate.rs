//! Scheduler-safe call gate
//!
//! Every native call and every callback re-entry passes through a
//! `CallGate`. The gate tells the host's scheduler that the current thread
//! is about to block in foreign code, and makes threads created by native
//! code able to run host code when they call back in.
//!
//! The hooks are a trait so a host can install its own with
//! `Registry::init_with_gate`. Configuration always selects `TokioHooks`;
//! `NoopHooks` is for hosts without cooperative scheduling and can only be
//! installed programmatically.

use crate::async_runtime;
use crate::error::{FfiError, FfiResult};
use dynacall_config::{EngineConfig, GateMode};
use std::fmt;
use tokio::runtime::{EnterGuard, Handle, RuntimeFlavor};
use tracing::debug;

/// Name of threads created for `GateMode::NativeThread`
pub const NATIVE_THREAD_NAME: &str = "dynacall-native";

/// Scheduler notifications around foreign code
pub trait SchedulerHooks: Send + Sync {
    /// Run `call` (a native call) with the scheduler told the thread blocks
    fn blocking(&self, call: &mut (dyn FnMut() + Send)) -> FfiResult<()>;

    /// Prepare the current thread to run host code
    ///
    /// The thread is detached again when the guard drops.
    fn attach(&self) -> FfiResult<AttachGuard<'_>>;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Keeps a foreign thread attached to the scheduler
pub struct AttachGuard<'a> {
    entered: Option<EnterGuard<'a>>,
}

impl AttachGuard<'_> {
    /// Guard for a thread that needed no attaching
    pub fn unchanged() -> Self {
        AttachGuard { entered: None }
    }

    /// Whether this guard attached the thread
    pub fn attached(&self) -> bool {
        self.entered.is_some()
    }
}

impl<'a> AttachGuard<'a> {
    pub fn entered(guard: EnterGuard<'a>) -> Self {
        AttachGuard {
            entered: Some(guard),
        }
    }
}

/// Hooks for hosts without a cooperative scheduler
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {
    fn blocking(&self, call: &mut (dyn FnMut() + Send)) -> FfiResult<()> {
        call();
        Ok(())
    }

    fn attach(&self) -> FfiResult<AttachGuard<'_>> {
        Ok(AttachGuard::unchanged())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Hooks for tokio hosts
///
/// Inside a multi-thread runtime the call runs in `block_in_place`, which
/// moves the worker's queued tasks to another thread. Every mode does this.
/// With `GateMode::NativeThread` the call additionally runs on a dedicated
/// thread with a native-sized stack, so state tied to the calling OS thread
/// (`errno`, thread-local contexts) does not carry over.
///
/// Foreign threads calling back in enter the registered host handle, or the
/// engine runtime when none is registered.
#[derive(Debug)]
pub struct TokioHooks {
    mode: GateMode,
    native_stack_size: usize,
    handle: Option<Handle>,
}

impl TokioHooks {
    pub fn new(mode: GateMode, native_stack_size: usize) -> Self {
        Self {
            mode,
            native_stack_size,
            handle: None,
        }
    }

    /// Attach foreign threads to `handle` instead of the engine runtime
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    fn on_native_thread(&self, call: &mut (dyn FnMut() + Send)) -> FfiResult<()> {
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name(NATIVE_THREAD_NAME.to_string())
                .stack_size(self.native_stack_size)
                .spawn_scoped(scope, move || call())
                .map_err(|e| FfiError::SchedulerGate(format!("failed to spawn native thread: {}", e)))?;
            match worker.join() {
                Ok(()) => Ok(()),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }
}

fn in_multi_thread_runtime() -> bool {
    Handle::try_current()
        .map(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
        .unwrap_or(false)
}

impl SchedulerHooks for TokioHooks {
    fn blocking(&self, call: &mut (dyn FnMut() + Send)) -> FfiResult<()> {
        let multi_thread = in_multi_thread_runtime();
        match self.mode {
            GateMode::Auto | GateMode::Direct if multi_thread => {
                tokio::task::block_in_place(call);
                Ok(())
            }
            GateMode::Auto | GateMode::Direct => {
                call();
                Ok(())
            }
            GateMode::NativeThread if multi_thread => {
                tokio::task::block_in_place(|| self.on_native_thread(call))
            }
            GateMode::NativeThread => self.on_native_thread(call),
        }
    }

    fn attach(&self) -> FfiResult<AttachGuard<'_>> {
        match Handle::try_current() {
            Ok(_) => Ok(AttachGuard::unchanged()),
            Err(e) if e.is_thread_local_destroyed() => Err(FfiError::SchedulerGate(
                "runtime context of this thread is already torn down".to_string(),
            )),
            Err(_) => {
                let handle = match &self.handle {
                    Some(handle) => handle,
                    None => async_runtime::runtime()?.handle(),
                };
                debug!(thread = ?std::thread::current().id(), "attaching foreign thread");
                Ok(AttachGuard::entered(handle.enter()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

/// Brackets native calls and callback re-entries
pub struct CallGate {
    hooks: Box<dyn SchedulerHooks>,
}

impl CallGate {
    pub fn new(hooks: impl SchedulerHooks + 'static) -> Self {
        Self {
            hooks: Box::new(hooks),
        }
    }

    /// Gate selected by the `[gate]` configuration section
    ///
    /// Foreign threads are attached to `host` when given.
    pub fn from_config(config: &EngineConfig, host: Option<Handle>) -> Self {
        let hooks = TokioHooks::new(config.gate_mode(), config.native_stack_size());
        match host {
            Some(handle) => Self::new(hooks.with_handle(handle)),
            None => Self::new(hooks),
        }
    }

    /// Run a native call inside the gate
    pub fn run<R, F>(&self, f: F) -> FfiResult<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let mut f = Some(f);
        let mut out = None;
        self.hooks.blocking(&mut || {
            if let Some(f) = f.take() {
                out = Some(f());
            }
        })?;
        out.ok_or_else(|| FfiError::SchedulerGate("gated call did not run".to_string()))
    }

    /// Run host code on behalf of native code
    pub fn reenter<R>(&self, f: impl FnOnce() -> R) -> FfiResult<R> {
        let guard = self.hooks.attach()?;
        let result = f();
        drop(guard);
        Ok(result)
    }

    pub fn hooks_name(&self) -> &'static str {
        self.hooks.name()
    }
}

impl fmt::Debug for CallGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGate")
            .field("hooks", &self.hooks.name())
            .finish()
    }
}
