// Host closures called from native code.

use dynacall_runtime::{
    make_callback, Callable, HostFn, ParamKind, Registry, ScalarKind, Signature, StructLayout,
    Value,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Point {
    x: i32,
    y: i32,
}

type BinaryFn = extern "C" fn(i32, i32) -> i32;

extern "C" fn fold(f: BinaryFn, values: *const i32, len: usize, init: i32) -> i32 {
    let values = unsafe { std::slice::from_raw_parts(values, len) };
    values.iter().fold(init, |acc, v| f(acc, *v))
}

extern "C" fn on_foreign_thread(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    std::thread::spawn(move || f(x))
        .join()
        .unwrap_or(-1)
}

extern "C" fn apply_point(f: extern "C" fn(Point) -> i32, x: i32, y: i32) -> i32 {
    f(Point { x, y })
}

extern "C" fn greet(f: extern "C" fn(*const std::os::raw::c_char) -> usize) -> usize {
    f(b"from native\0".as_ptr() as *const std::os::raw::c_char)
}

extern "C" fn twice(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(f(x))
}

fn binary_sig() -> Signature {
    Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32)
}

fn bind(f: usize, signature: Signature) -> Callable {
    unsafe { Callable::bind(f, signature) }.unwrap()
}

#[test]
fn test_callback_called_repeatedly() {
    let data = [1i32, 2, 3, 4, 5];
    let calls = Arc::new(AtomicI64::new(0));
    let counter = Arc::clone(&calls);
    let add = Value::callback(move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        match args {
            [Value::Int(acc), Value::Int(v)] => Value::Int(acc + v),
            _ => Value::Int(0),
        }
    });

    let f = bind(
        fold as *const () as usize,
        Signature::of([
            ParamKind::Callback(binary_sig()),
            ParamKind::Pointer,
            ParamKind::U64,
            ParamKind::I32,
        ])
        .returns(ParamKind::I32),
    );
    let result = f
        .call(&[
            add,
            Value::Pointer(data.as_ptr() as usize),
            Value::UInt(data.len() as u64),
            Value::Int(100),
        ])
        .unwrap();
    assert_eq!(result, Value::Int(115));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_callback_from_foreign_thread_runs_attached() {
    let sig = Signature::of([ParamKind::I32]).returns(ParamKind::I32);
    let host = Value::callback(|args| {
        let attached = tokio::runtime::Handle::try_current().is_ok();
        match args {
            [Value::Int(x)] if attached => Value::Int(x * 2),
            _ => Value::Int(-100),
        }
    });

    let f = bind(
        on_foreign_thread as *const () as usize,
        Signature::of([ParamKind::Callback(sig), ParamKind::I32]).returns(ParamKind::I32),
    );
    assert_eq!(f.call(&[host, Value::Int(21)]).unwrap(), Value::Int(42));
}

#[test]
fn test_struct_argument_in_callback() {
    let point = ParamKind::Struct(StructLayout::of_scalars(&[ScalarKind::I32, ScalarKind::I32]));
    let sig = Signature::of([point]).returns(ParamKind::I32);
    let host = Value::callback(|args| match args {
        [Value::Struct(fields)] => match fields.as_slice() {
            [Value::Int(x), Value::Int(y)] => Value::Int(x * 100 + y),
            _ => Value::Int(-1),
        },
        _ => Value::Int(-2),
    });

    let f = bind(
        apply_point as *const () as usize,
        Signature::of([ParamKind::Callback(sig), ParamKind::I32, ParamKind::I32])
            .returns(ParamKind::I32),
    );
    assert_eq!(
        f.call(&[host, Value::Int(3), Value::Int(7)]).unwrap(),
        Value::Int(307)
    );
}

#[test]
fn test_string_argument_in_callback() {
    let sig = Signature::of([ParamKind::NativeString]).returns(ParamKind::U64);
    let host = Value::callback(|args| match args {
        [Value::String(s)] if s == "from native" => Value::UInt(s.len() as u64),
        _ => Value::UInt(0),
    });
    let f = bind(
        greet as *const () as usize,
        Signature::of([ParamKind::Callback(sig)]).returns(ParamKind::U64),
    );
    assert_eq!(f.call(&[host]).unwrap(), Value::UInt(11));
}

#[test]
fn test_native_function_passed_back_as_callback() {
    extern "C" fn increment(x: i32) -> i32 {
        x + 1
    }

    let sig = Signature::of([ParamKind::I32]).returns(ParamKind::I32);
    let inc = bind(increment as *const () as usize, sig.clone());
    let f = bind(
        twice as *const () as usize,
        Signature::of([ParamKind::Callback(sig), ParamKind::I32]).returns(ParamKind::I32),
    );
    assert_eq!(
        f.call(&[Value::Function(inc), Value::Int(40)]).unwrap(),
        Value::Int(42)
    );
}

#[test]
fn test_callback_receives_callable() {
    extern "C" fn square(x: i32) -> i32 {
        x * x
    }
    extern "C" fn hand_over(f: extern "C" fn(extern "C" fn(i32) -> i32) -> i32) -> i32 {
        f(square)
    }

    let inner = Signature::of([ParamKind::I32]).returns(ParamKind::I32);
    let outer = Signature::of([ParamKind::Callback(inner)]).returns(ParamKind::I32);
    let host = Value::callback(|args| match args {
        [Value::Function(f)] => f.call(&[Value::Int(9)]).unwrap_or(Value::Int(-1)),
        _ => Value::Int(-2),
    });

    let f = bind(
        hand_over as *const () as usize,
        Signature::of([ParamKind::Callback(outer)]).returns(ParamKind::I32),
    );
    assert_eq!(f.call(&[host]).unwrap(), Value::Int(81));
}

#[test]
fn test_trampolines_are_recorded() {
    let sig = Signature::of([ParamKind::F64]).returns(ParamKind::F64);
    let host: HostFn = Arc::new(|args: &[Value]| args[0].clone());
    let address = make_callback(sig.clone(), host).unwrap();

    let records = Registry::global().bridges();
    assert!(records
        .iter()
        .any(|record| record.address == address && record.signature == sig));
}
