//! Host functions as native function pointers
//!
//! `make_callback` builds a trampoline that native code can call like any C
//! function. On entry it collects the raw argument slots into a `CallImage`,
//! decodes them with the same `CallPlan` a call in the other direction would
//! use, runs the host function inside the gate, and writes the encoded result
//! into the return register.
//!
//! Trampolines are never freed. Native code may keep a function pointer for
//! as long as it likes, so the trampoline and its state live until process
//! exit.

use crate::abi::{CallImage, CallPlan, ReturnClass};
use crate::caller::raw_cif;
use crate::error::{FfiError, FfiResult};
use crate::registry::Registry;
use crate::types::{HostFn, ParamKind, Signature};
use libffi::low::ffi_cif;
use libffi::middle::Closure;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

struct BridgeState {
    plan: CallPlan,
    host: HostFn,
}

/// Create a native function pointer that calls `host`
///
/// Native-string and struct returns are rejected: there is no owner that
/// could keep the returned memory alive after the trampoline returns.
pub fn make_callback(signature: Signature, host: HostFn) -> FfiResult<usize> {
    match signature.ret() {
        Some(kind @ (ParamKind::NativeString | ParamKind::Struct(_))) => {
            return Err(FfiError::UnsupportedKind(format!(
                "{} return value from a callback",
                kind
            )));
        }
        _ => {}
    }

    let plan = CallPlan::host(&signature)?;
    let cif = raw_cif(&plan);
    let state: &'static BridgeState = Box::leak(Box::new(BridgeState { plan, host }));
    let closure = Closure::new(cif, bridge_entry, state);
    let address = *closure.code_ptr() as usize;
    std::mem::forget(closure);

    debug!(address = format_args!("{:#x}", address), %signature, "created callback trampoline");
    Registry::global().record_bridge(address, signature);
    Ok(address)
}

/// Trampoline for a host callback passed as an argument
///
/// The same host function bridged for the same signature reuses one
/// trampoline unless the callback cache is disabled.
pub(crate) fn bridge_host_fn(signature: &Signature, host: &HostFn) -> FfiResult<usize> {
    let key = Arc::as_ptr(host) as *const () as usize;
    Registry::global().bridge_for(key, signature, || {
        make_callback(signature.clone(), Arc::clone(host))
    })
}

unsafe extern "C" fn bridge_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    state: &BridgeState,
) {
    let plan = &state.plan;
    let mut image = CallImage::new(plan.stack_slots());
    for (i, slot) in plan.lowering().iter().enumerate() {
        // Every raw slot is an 8-byte u64 or f64
        let word = *(*args.add(i) as *const u64);
        image.set(*slot, word);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Registry::global().gate().reenter(|| {
            let values = plan.decode_args(&image);
            let value = (state.host)(&values);
            plan.encode_return(&value)
        })
    }));

    let bits = match outcome {
        Ok(Ok(Ok(bits))) => bits,
        Ok(Ok(Err(e))) => {
            warn!(signature = %plan.signature(), error = %e, "callback returned an unusable value");
            0
        }
        Ok(Err(e)) => {
            error!(signature = %plan.signature(), error = %e, "cannot run callback on this thread");
            std::process::abort();
        }
        Err(_) => {
            // Unwinding into native frames is undefined behavior
            error!(signature = %plan.signature(), "callback panicked");
            std::process::abort();
        }
    };

    if plan.return_class() != ReturnClass::Void {
        *result = bits;
    }
}
