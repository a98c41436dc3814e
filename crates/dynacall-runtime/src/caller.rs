//! Native function invocation
//!
//! A `Callable` is a function address bound to a `Signature`. Binding
//! classifies the signature and builds the raw call interface once; each
//! call then only fills a fresh `CallImage`, runs the raw call inside the
//! gate, and decodes the return registers.
//!
//! The raw call goes through libffi with an argument list that mirrors the
//! register files (`CallPlan::lowering`): integer registers as `u64`, float
//! registers as `f64`, then the stack words. libffi places those exactly
//! where the classifier said the real arguments go.

use crate::abi::{CallImage, CallPlan, Location, RawReturn, RawSlot, ReturnClass};
use crate::async_runtime;
use crate::error::{FfiError, FfiResult};
use crate::marshal::KeepAlive;
use crate::registry::Registry;
use crate::types::{ParamKind, ReturnKind, Signature, Value};
use libffi::middle::{Arg, Cif, CodePtr, Type};
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace};

struct BoundFn {
    address: usize,
    plan: CallPlan,
    cif: Cif,
}

// Safety: the Cif is immutable after construction and only read by calls;
// the address is a plain function pointer.
unsafe impl Send for BoundFn {}
unsafe impl Sync for BoundFn {}

/// A native function bound to its signature
///
/// Cheap to clone and safe to share between threads and tasks.
#[derive(Clone)]
pub struct Callable {
    inner: Arc<BoundFn>,
}

impl Callable {
    /// Bind `address` to `signature`
    ///
    /// Fails with `NullAddress` for 0 and with the classifier's errors for
    /// signatures that cannot be passed.
    ///
    /// # Safety
    ///
    /// `address` must point to a function whose native signature matches
    /// `signature`, and it must stay valid while the `Callable` is used.
    pub unsafe fn bind(address: usize, signature: Signature) -> FfiResult<Self> {
        if address == 0 {
            return Err(FfiError::NullAddress);
        }
        let plan = CallPlan::host(&signature)?;
        let cif = raw_cif(&plan);
        debug!(address = format_args!("{:#x}", address), %signature, "bound function");
        Ok(Self {
            inner: Arc::new(BoundFn { address, plan, cif }),
        })
    }

    pub fn address(&self) -> usize {
        self.inner.address
    }

    pub fn signature(&self) -> &Signature {
        self.inner.plan.signature()
    }

    pub fn plan(&self) -> &CallPlan {
        &self.inner.plan
    }

    /// Call with host values and decode the declared return kind
    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        let raw = self.call_raw(args)?;
        Ok(self.inner.plan.decode_return(raw))
    }

    /// Call with host values and return both raw return registers
    pub fn call_raw(&self, args: &[Value]) -> FfiResult<RawReturn> {
        let bound = &*self.inner;
        let mut keep = KeepAlive::new();
        let image = bound.plan.build_image(args, &mut keep)?;
        trace!(
            address = format_args!("{:#x}", bound.address),
            args = args.len(),
            stack = image.stack().len(),
            "native call"
        );

        let raw = Registry::global().gate().run(|| unsafe {
            raw_call(
                &bound.cif,
                bound.address,
                &image,
                bound.plan.lowering(),
                bound.plan.return_class(),
            )
        })?;
        keep.release();
        Ok(raw)
    }

    /// Call on tokio's blocking pool
    ///
    /// Uses the current runtime when there is one, the engine runtime
    /// otherwise. The native call cannot be cancelled once started.
    pub async fn call_async(&self, args: Vec<Value>) -> FfiResult<Value> {
        let callable = self.clone();
        let work = move || callable.call(&args);
        let task = match Handle::try_current() {
            Ok(handle) => handle.spawn_blocking(work),
            Err(_) => async_runtime::runtime()?.spawn_blocking(work),
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(FfiError::SchedulerGate(e.to_string())),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("address", &format_args!("{:#x}", self.inner.address))
            .field("signature", &self.signature().to_string())
            .finish()
    }
}

/// Raw call interface for a plan's lowering
pub(crate) fn raw_cif(plan: &CallPlan) -> Cif {
    let args: Vec<Type> = plan
        .lowering()
        .iter()
        .map(|slot| match slot {
            Location::Float(_) => Type::f64(),
            Location::Int(_) | Location::Stack(_) => Type::u64(),
        })
        .collect();
    let ret = match plan.return_class() {
        ReturnClass::Void => Type::void(),
        ReturnClass::Int => Type::u64(),
        ReturnClass::F32 => Type::f32(),
        ReturnClass::F64 => Type::f64(),
    };
    Cif::new(args, ret)
}

/// Perform one raw call
///
/// # Safety
///
/// `cif` must have been built from `lowering`, and `address` must be a
/// function expecting the arguments `image` holds.
pub unsafe fn raw_call(
    cif: &Cif,
    address: usize,
    image: &CallImage,
    lowering: &[RawSlot],
    ret: ReturnClass,
) -> RawReturn {
    let args: Vec<Arg> = lowering
        .iter()
        .map(|slot| Arg::new(image.slot_ref(*slot)))
        .collect();
    let code = CodePtr::from_ptr(address as *const c_void);

    match ret {
        ReturnClass::Void => {
            cif.call::<()>(code, &args);
            RawReturn::default()
        }
        ReturnClass::Int => RawReturn {
            int: cif.call::<u64>(code, &args),
            float: 0,
        },
        ReturnClass::F32 => RawReturn {
            int: 0,
            float: cif.call::<f32>(code, &args).to_bits() as u64,
        },
        ReturnClass::F64 => RawReturn {
            int: 0,
            float: cif.call::<f64>(code, &args).to_bits(),
        },
    }
}

/// Call a function taking only integer-class arguments
///
/// Every argument is passed as a 64-bit integer; the function's integer
/// return register comes back in `RawReturn::int`.
///
/// # Safety
///
/// `address` must be a function taking `args.len()` integer or pointer
/// arguments.
pub unsafe fn syscall_n(address: usize, args: &[usize]) -> FfiResult<RawReturn> {
    let signature = Signature::new(vec![ParamKind::U64; args.len()], Some(ParamKind::U64));
    let values: Vec<Value> = args.iter().map(|arg| Value::UInt(*arg as u64)).collect();
    Callable::bind(address, signature)?.call_raw(&values)
}

/// Kind a value is passed as when no signature is declared
pub fn infer_kind(value: &Value) -> FfiResult<ParamKind> {
    match value {
        Value::Int(_) => Ok(ParamKind::I64),
        Value::UInt(_) => Ok(ParamKind::U64),
        Value::Bool(_) => Ok(ParamKind::Bool),
        Value::F32(_) => Ok(ParamKind::F32),
        Value::F64(_) => Ok(ParamKind::F64),
        Value::Pointer(_) => Ok(ParamKind::Pointer),
        Value::String(_) => Ok(ParamKind::NativeString),
        Value::Function(callable) => Ok(ParamKind::Callback(callable.signature().clone())),
        other => Err(FfiError::UnsupportedKind(format!(
            "cannot infer a native kind for a {} value",
            other.type_name()
        ))),
    }
}

/// Call `address` with argument kinds inferred from the values
///
/// # Safety
///
/// The function at `address` must accept the inferred kinds (64-bit
/// integers, doubles, pointers...) and return `ret`.
pub unsafe fn invoke(address: usize, args: &[Value], ret: Option<ReturnKind>) -> FfiResult<Value> {
    let params = args.iter().map(infer_kind).collect::<FfiResult<Vec<_>>>()?;
    Callable::bind(address, Signature::new(params, ret))?.call(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::ffi::CStr;
    use std::os::raw::c_char;

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn mixed(a: i8, b: f32, c: u16, d: f64) -> f64 {
        a as f64 + b as f64 + c as f64 + d
    }

    extern "C" fn half(x: f32) -> f32 {
        x / 2.0
    }

    extern "C" fn negate(b: bool) -> bool {
        !b
    }

    extern "C" fn count_bytes(s: *const c_char) -> usize {
        unsafe { CStr::from_ptr(s) }.to_bytes().len()
    }

    extern "C" fn greeting() -> *const c_char {
        b"hello\0".as_ptr() as *const c_char
    }

    extern "C" fn no_string() -> *const c_char {
        std::ptr::null()
    }

    extern "C" fn sum3(a: usize, b: usize, c: usize) -> usize {
        a + b + c
    }

    extern "C" fn minus_one() -> i8 {
        -1
    }

    #[allow(clippy::too_many_arguments)]
    extern "C" fn many(
        a: i64,
        b: i64,
        c: i64,
        d: i64,
        e: i64,
        f: i64,
        g: i64,
        h: i64,
        x: f64,
        y: f64,
        i: i32,
        z: f32,
    ) -> f64 {
        (a + b + c + d + e + f + g + h + i as i64) as f64 + x + y + z as f64
    }

    fn bind(address: usize, signature: Signature) -> Callable {
        unsafe { Callable::bind(address, signature) }.unwrap()
    }

    #[test]
    fn test_call_add() {
        let f = bind(
            add_i32 as *const () as usize,
            Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32),
        );
        assert_eq!(f.call(&[Value::Int(3), Value::Int(4)]).unwrap(), Value::Int(7));
        assert_eq!(f.call(&[Value::Int(-10), Value::Int(4)]).unwrap(), Value::Int(-6));
    }

    #[test]
    fn test_call_mixed_int_float() {
        let f = bind(
            mixed as *const () as usize,
            Signature::of([ParamKind::I8, ParamKind::F32, ParamKind::U16, ParamKind::F64])
                .returns(ParamKind::F64),
        );
        let result = f
            .call(&[
                Value::Int(-2),
                Value::F32(0.5),
                Value::UInt(1000),
                Value::F64(0.25),
            ])
            .unwrap();
        assert_eq!(result, Value::F64(998.75));
    }

    #[test]
    fn test_call_f32_return() {
        let f = bind(half as *const () as usize, Signature::of([ParamKind::F32]).returns(ParamKind::F32));
        assert_eq!(f.call(&[Value::F32(5.0)]).unwrap(), Value::F32(2.5));
    }

    #[test]
    fn test_call_bool() {
        let f = bind(negate as *const () as usize, Signature::of([ParamKind::Bool]).returns(ParamKind::Bool));
        assert_eq!(f.call(&[Value::Bool(false)]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_call_narrow_return_sign_extends() {
        let f = bind(minus_one as *const () as usize, Signature::of([]).returns(ParamKind::I8));
        assert_eq!(f.call(&[]).unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_string_argument() {
        let f = bind(
            count_bytes as *const () as usize,
            Signature::of([ParamKind::NativeString]).returns(ParamKind::U64),
        );
        assert_eq!(
            f.call(&[Value::String("dynacall".to_string())]).unwrap(),
            Value::UInt(8)
        );
        assert_eq!(
            f.call(&[Value::String("terminated\0".to_string())]).unwrap(),
            Value::UInt(10)
        );
    }

    #[test]
    fn test_string_return() {
        let f = bind(greeting as *const () as usize, Signature::of([]).returns(ParamKind::NativeString));
        assert_eq!(f.call(&[]).unwrap(), Value::String("hello".to_string()));

        let f = bind(no_string as *const () as usize, Signature::of([]).returns(ParamKind::NativeString));
        assert_eq!(f.call(&[]).unwrap(), Value::String(String::new()));
    }

    #[test]
    fn test_stack_arguments() {
        let mut params = vec![ParamKind::I64; 8];
        params.extend([ParamKind::F64, ParamKind::F64, ParamKind::I32, ParamKind::F32]);
        let f = bind(many as *const () as usize, Signature::of(params).returns(ParamKind::F64));

        let mut args: Vec<Value> = (1..=8).map(Value::Int).collect();
        args.extend([
            Value::F64(0.5),
            Value::F64(0.25),
            Value::Int(100),
            Value::F32(0.125),
        ]);
        assert_eq!(f.call(&args).unwrap(), Value::F64(136.875));
    }

    #[test]
    fn test_arity_mismatch() {
        let f = bind(
            add_i32 as *const () as usize,
            Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32),
        );
        assert_eq!(
            f.call(&[Value::Int(1)]),
            Err(FfiError::ArityMismatch {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_out_of_range_argument() {
        let f = bind(
            add_i32 as *const () as usize,
            Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32),
        );
        let result = f.call(&[Value::Int(1 << 40), Value::Int(0)]);
        assert!(matches!(result, Err(FfiError::OutOfRange { .. })));
    }

    #[test]
    fn test_null_address() {
        let result = unsafe { Callable::bind(0, Signature::of([])) };
        assert!(matches!(result, Err(FfiError::NullAddress)));
    }

    #[test]
    fn test_syscall_n() {
        let raw = unsafe { syscall_n(sum3 as *const () as usize, &[1, 2, 39]) }.unwrap();
        assert_eq!(raw.int, 42);
    }

    #[test]
    fn test_invoke_infers_kinds() {
        let result = unsafe {
            invoke(
                count_bytes as *const () as usize,
                &[Value::String("four".to_string())],
                Some(ParamKind::U64),
            )
        }
        .unwrap();
        assert_eq!(result, Value::UInt(4));
    }

    #[test]
    fn test_invoke_rejects_uninferable() {
        let result = unsafe {
            invoke(
                sum3 as *const () as usize,
                &[Value::Struct(vec![])],
                Some(ParamKind::U64),
            )
        };
        assert!(matches!(result, Err(FfiError::UnsupportedKind(_))));
    }

    #[test]
    fn test_callable_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Callable>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_async() {
        let f = bind(
            add_i32 as *const () as usize,
            Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32),
        );
        let result = f.call_async(vec![Value::Int(20), Value::Int(22)]).await;
        assert_eq!(result, Ok(Value::Int(42)));
    }
}
