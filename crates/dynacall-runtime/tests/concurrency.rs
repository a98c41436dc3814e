// Native calls from async tasks and from many threads at once.

use dynacall_runtime::{Callable, ParamKind, Signature, Value};
use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::time::Duration;

extern "C" fn mul(a: i64, b: i64) -> i64 {
    a * b
}

extern "C" fn sleep_ms(ms: u32) -> u32 {
    std::thread::sleep(Duration::from_millis(ms as u64));
    ms
}

fn mul_fn() -> Callable {
    unsafe {
        Callable::bind(
            mul as *const () as usize,
            Signature::of([ParamKind::I64, ParamKind::I64]).returns(ParamKind::I64),
        )
    }
    .unwrap()
}

#[test]
fn test_shared_callable_across_threads() {
    let f = mul_fn();
    let handles: Vec<_> = (0..8i64)
        .map(|i| {
            let f = f.clone();
            std::thread::spawn(move || {
                (0..200i64)
                    .map(|j| match f.call(&[Value::Int(i), Value::Int(j)]) {
                        Ok(Value::Int(v)) if v == i * j => 0,
                        _ => 1,
                    })
                    .sum::<i64>()
            })
        })
        .collect();

    let failures: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_blocking_call_does_not_starve_worker() {
    let f = unsafe {
        Callable::bind(
            sleep_ms as *const () as usize,
            Signature::of([ParamKind::U32]).returns(ParamKind::U32),
        )
    }
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let blocker = tokio::spawn(async move {
        // Queued behind this task on the single worker
        tokio::spawn(async move {
            let _ = tx.send(());
        });
        f.call(&[Value::UInt(1500)])
    });

    let ran = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_millis(1000)))
        .await
        .unwrap();
    assert!(ran.is_ok());
    assert_eq!(blocker.await.unwrap(), Ok(Value::UInt(1500)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_async_concurrently() {
    let f = mul_fn();
    let tasks: Vec<_> = (1..=16i64)
        .map(|i| {
            let f = f.clone();
            tokio::spawn(async move { f.call_async(vec![Value::Int(i), Value::Int(i)]).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    let expected: Vec<Value> = (1..=16i64).map(|i| Value::Int(i * i)).collect();
    assert_eq!(results, expected);
}

#[tokio::test(flavor = "current_thread")]
async fn test_call_on_current_thread_runtime() {
    let f = mul_fn();
    assert_eq!(
        f.call(&[Value::Int(6), Value::Int(7)]),
        Ok(Value::Int(42))
    );
    assert_eq!(
        f.call_async(vec![Value::Int(-3), Value::Int(5)]).await,
        Ok(Value::Int(-15))
    );
}
