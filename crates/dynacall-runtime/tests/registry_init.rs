// Explicit registry initialization. Kept in its own test binary because
// the registry is process-wide and can only be initialized once.

use dynacall_config::{CallbacksConfig, EngineConfig, GateConfig, GateMode};
use dynacall_runtime::{make_callback, Callable, FfiError, ParamKind, Registry, Signature, Value};
use std::sync::Arc;

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

fn direct_config() -> EngineConfig {
    EngineConfig {
        gate: Some(GateConfig {
            mode: Some(GateMode::Direct),
            ..Default::default()
        }),
        callbacks: Some(CallbacksConfig { cache: Some(false) }),
        ..Default::default()
    }
}

#[test]
fn test_registry_lifecycle() {
    let invalid = EngineConfig {
        gate: Some(GateConfig {
            native_stack_size: Some(1024),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(matches!(Registry::init(invalid), Err(FfiError::Config(_))));

    let registry = Registry::init(direct_config()).unwrap();
    assert_eq!(registry.gate().hooks_name(), "tokio");
    assert_eq!(registry.config().gate_mode(), GateMode::Direct);

    // Same configuration again is fine, a different one is not
    assert!(Registry::init(direct_config()).is_ok());
    assert_eq!(
        Registry::init(EngineConfig::default()).unwrap_err(),
        FfiError::AlreadyInitialized
    );
    assert!(std::ptr::eq(Registry::global(), registry));

    // Outside a runtime the direct gate runs calls inline
    let f = unsafe {
        Callable::bind(
            add as *const () as usize,
            Signature::of([ParamKind::I32, ParamKind::I32]).returns(ParamKind::I32),
        )
    }
    .unwrap();
    assert_eq!(f.call(&[Value::Int(40), Value::Int(2)]), Ok(Value::Int(42)));

    // With the cache off every bridge gets its own trampoline
    let sig = Signature::of([ParamKind::I32]).returns(ParamKind::I32);
    let before = registry.bridge_count();
    let host = Arc::new(|args: &[Value]| args[0].clone());
    let a = make_callback(sig.clone(), host.clone()).unwrap();
    let b = make_callback(sig, host).unwrap();
    assert_ne!(a, b);
    assert_eq!(registry.bridge_count(), before + 2);
}
