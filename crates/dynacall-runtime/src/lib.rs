//! Dynacall Runtime - Calling native code at runtime
//!
//! This library lets a host call C functions it only knows about at run
//! time:
//! - Opening shared libraries and resolving symbols
//! - Marshaling host values, strings and structs to native slots
//! - Classifying signatures for the SysV, AAPCS64 and Win64 conventions
//! - Invoking bound functions, synchronously or on tokio's blocking pool
//! - Turning host closures into native function pointers
//! - Keeping the async scheduler healthy while native code blocks

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("dynacall supports x86_64 and aarch64 targets only");

/// Dynacall runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod abi;
pub mod async_runtime;
pub mod callbacks;
pub mod caller;
pub mod error;
pub mod gate;
pub mod loader;
pub mod marshal;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use abi::{
    CallImage, CallPlan, Convention, Location, Piece, Placement, RawReturn, ReturnClass,
};
pub use callbacks::make_callback;
pub use caller::{invoke, syscall_n, Callable};
pub use error::{FfiError, FfiResult};
pub use gate::{AttachGuard, CallGate, NoopHooks, SchedulerHooks, TokioHooks};
pub use loader::{Library, LibraryHandle, OpenMode};
pub use marshal::{str_from_native, str_to_native, KeepAlive};
pub use registry::Registry;
pub use types::{
    FieldKind, HostFn, IntWidth, ParamKind, ReturnKind, ScalarKind, Signature, StructLayout, Value,
};
