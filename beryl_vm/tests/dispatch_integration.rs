//! End-to-end dispatch behavior: concurrent internalization, executor
//! routing through the specialization cache, and primitive fallback.

use beryl_core::{intern, Value};
use beryl_runtime::ClassData;
use beryl_vm::{
    Arguments, BytecodeBuilder, CompiledCode, RuntimeError, VmEnv, VmResult, VmThread,
    verify_bytecode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

// Helper to create a code object returning literal 42
fn answer_code() -> CompiledCode {
    let mut builder = BytecodeBuilder::new();
    builder.push_literal(0).ret();
    let mut code = CompiledCode::new(intern("answer"), intern("test.brl"));
    code.set_bytecode(builder.build());
    code.set_literals(vec![Value::fixnum(42)]);
    code.set_stack_size(1);
    code
}

/// Receivers encode their class data directly in the object handle so
/// tests can pick any (class_id, serial) pair.
fn class_data_env() -> VmEnv {
    VmEnv {
        class_of: Box::new(|value| match value.as_object() {
            Some(handle) => ClassData::from_raw(handle),
            None => ClassData::new(0, 0),
        }),
        ..VmEnv::new()
    }
}

fn receiver(class_id: u32, serial: u32) -> Value {
    Value::object(ClassData::new(class_id, serial).raw())
}

fn call(env: &Arc<VmEnv>, code: &CompiledCode, recv: Value) -> VmResult<Value> {
    let mut thread = VmThread::new(Arc::clone(env));
    let mut args = Arguments::new(intern("call"), recv, &[]);
    code.execute(&mut thread, &mut args)
}

// =============================================================================
// Internalization
// =============================================================================

#[test]
fn test_concurrent_internalize_runs_verifier_once() {
    let verifier_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&verifier_calls);
    let env = Arc::new(VmEnv {
        verify: Box::new(move |code| {
            counter.fetch_add(1, Ordering::SeqCst);
            verify_bytecode(code)
        }),
        ..VmEnv::new()
    });
    let code = Arc::new(answer_code());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let code = Arc::clone(&code);
            let env = Arc::clone(&env);
            thread::spawn(move || code.internalize(&env).unwrap() as *const _ as usize)
        })
        .collect();

    let identities: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(identities.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(verifier_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rejected_code_never_internalizes() {
    let env = Arc::new(VmEnv::new());
    let mut code = CompiledCode::new(intern("bad"), intern("test.brl"));
    code.set_bytecode(vec![0xAB]);
    let code = Arc::new(code);

    for _ in 0..3 {
        assert!(code.internalize(&env).is_err());
        assert!(code.machine_code().is_none());
    }

    // Dispatch surfaces the failure as a runtime error.
    let err = call(&env, &code, Value::nil()).unwrap_err();
    assert!(matches!(err, RuntimeError::Code(_)));
}

// =============================================================================
// Specialization routing
// =============================================================================

fn specialized_e1(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
    Ok(Value::fixnum(111))
}

fn unspecialized_exec(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
    Ok(Value::fixnum(222))
}

#[test]
fn test_specialization_routing() {
    let env = Arc::new(class_data_env());
    let code = answer_code();
    code.internalize(&env).unwrap();

    code.set_unspecialized(unspecialized_exec, Value::nil());
    code.add_specialized(7, 1, specialized_e1, Value::nil());

    // Exact class data match runs the specialized variant.
    assert_eq!(
        call(&env, &code, receiver(7, 1)).unwrap().as_fixnum(),
        Some(111)
    );
    // Same class, newer shape serial: miss, unspecialized runs.
    assert_eq!(
        call(&env, &code, receiver(7, 2)).unwrap().as_fixnum(),
        Some(222)
    );
    // Different class: miss, unspecialized runs.
    assert_eq!(
        call(&env, &code, receiver(8, 1)).unwrap().as_fixnum(),
        Some(222)
    );
}

#[test]
fn test_specialization_miss_without_unspecialized_uses_fallback() {
    let env = Arc::new(class_data_env());
    let code = answer_code();
    code.internalize(&env).unwrap();

    code.add_specialized(7, 1, specialized_e1, Value::nil());

    // Hit still routes to the specialization.
    assert_eq!(
        call(&env, &code, receiver(7, 1)).unwrap().as_fixnum(),
        Some(111)
    );
    // Miss with no unspecialized executor lands in the fallback, which
    // runs the interpreter over the real body.
    assert_eq!(
        call(&env, &code, receiver(9, 9)).unwrap().as_fixnum(),
        Some(42)
    );
}

#[test]
fn test_cache_eviction_overwrites_slot_zero() {
    let env = Arc::new(class_data_env());
    let code = answer_code();
    code.internalize(&env).unwrap();

    for class_id in 1..=8u32 {
        code.add_specialized(class_id, 1, specialized_e1, Value::nil());
    }
    assert!(!code.can_specialize());

    code.add_specialized(99, 1, specialized_e1, Value::nil());
    assert!(code.find_specialized(ClassData::new(1, 1)).is_none());
    assert!(code.find_specialized(ClassData::new(99, 1)).is_some());
    // The remaining seven entries survive.
    for class_id in 2..=8u32 {
        assert!(
            code.find_specialized(ClassData::new(class_id, 1)).is_some(),
            "class {}",
            class_id
        );
    }
}

// =============================================================================
// Primitives
// =============================================================================

fn counting_primitive(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    // Fast path only for fixnum receivers; anything else falls back
    // through the specialization cache.
    if args.recv().is_fixnum() {
        Ok(Value::fixnum(999))
    } else {
        beryl_vm::primitive_failed(thread, code, args)
    }
}

fn primitive_env() -> VmEnv {
    VmEnv {
        resolve_primitive: Box::new(|code| {
            code.primitive()
                .map(|_| counting_primitive as beryl_vm::Executor)
        }),
        ..class_data_env()
    }
}

#[test]
fn test_primitive_becomes_executor() {
    let env = Arc::new(primitive_env());
    let mut code = answer_code();
    code.set_primitive(intern("fixnum_identity"));

    // Internalization binds the primitive as the fallback executor.
    assert_eq!(
        call(&env, &code, Value::fixnum(5)).unwrap().as_fixnum(),
        Some(999)
    );
}

#[test]
fn test_primitive_failure_routes_through_cache() {
    let env = Arc::new(primitive_env());
    let mut code = answer_code();
    code.set_primitive(intern("fixnum_identity"));
    code.internalize(&env).unwrap();

    code.add_specialized(7, 1, specialized_e1, Value::nil());
    // A primitive code never switches to specialized dispatch at the
    // top level; the primitive stays installed.
    assert_eq!(
        call(&env, &code, Value::fixnum(5)).unwrap().as_fixnum(),
        Some(999)
    );
    // Fast-path bail with a matching specialization runs it.
    assert_eq!(
        call(&env, &code, receiver(7, 1)).unwrap().as_fixnum(),
        Some(111)
    );
    // Fast-path bail with no match falls through to the interpreter.
    assert_eq!(
        call(&env, &code, receiver(8, 1)).unwrap().as_fixnum(),
        Some(42)
    );
}

// =============================================================================
// Argument shapes
// =============================================================================

#[test]
fn test_argument_count_enforced_by_fallback() {
    let env = Arc::new(VmEnv::new());
    let mut code = answer_code();
    code.set_arity(2, 2, None);
    let code = Arc::new(code);

    let mut thread = VmThread::new(Arc::clone(&env));
    let mut args = Arguments::new(intern("call"), Value::nil(), &[Value::fixnum(1)]);
    let err = code.execute(&mut thread, &mut args).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ArgumentCount {
            given: 1,
            required: 2,
            ..
        }
    ));

    let mut args = Arguments::new(
        intern("call"),
        Value::nil(),
        &[Value::fixnum(1), Value::fixnum(2)],
    );
    assert_eq!(
        code.execute(&mut thread, &mut args).unwrap().as_fixnum(),
        Some(42)
    );
}
