//! Load-time patching: installing patched images into a running host.

mod common;

use std::sync::{Arc, Mutex};

use cilsplice::{
    prelude::*,
    runtime::{native_fn, MethodKey},
};
use common::{host, COMPUTE, MODULE};

/// Route the result of `Bar.Compute` through the `Mods.Hooks::OnCompute` chain.
fn compute_hook() -> PatchDescriptor {
    PatchDescriptor::instruction_patch(
        "compute-hook",
        "Bar",
        "Compute",
        Pattern::new().then(OpcodeMatcher::new("add")),
        PatchAction::InsertAfter(vec![CallbackRef::new("Mods.Hooks", "OnCompute")
            .params(vec![TypeDescriptor::int32()])
            .returns(TypeDescriptor::int32())
            .into()]),
    )
}

#[test]
fn test_callback_chain_runs_each_delegate_once() -> Result<()> {
    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let chain = Arc::new(CallbackChain::with_base(native_fn(|call| {
        Ok(Some(call.arg(0)?.clone()))
    })));
    for name in ["first", "second"] {
        let calls = Arc::clone(&calls);
        chain.add(move |_| {
            calls.lock().unwrap().push(name);
            Ok(None)
        });
    }

    let runtime = Runtime::new();
    runtime.natives().register("Mods.Hooks::OnCompute", chain.clone());
    runtime.load(host())?;
    assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(42)));

    let report = PatchCoordinator::with_config(PatchConfig::in_memory()).install(
        &runtime,
        MODULE,
        &[compute_hook()],
    )?;
    assert!(report.changed());

    for round in 1..=2 {
        assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(42)));
        assert_eq!(calls.lock().unwrap().len(), 2 * round);
    }
    assert_eq!(*calls.lock().unwrap(), ["first", "second", "first", "second"]);
    Ok(())
}

#[test]
fn test_delegate_added_after_install() -> Result<()> {
    let chain = Arc::new(CallbackChain::with_base(native_fn(|call| {
        Ok(Some(call.arg(0)?.clone()))
    })));
    let runtime = Runtime::new();
    runtime.natives().register("Mods.Hooks::OnCompute", chain.clone());
    runtime.load(host())?;
    PatchCoordinator::with_config(PatchConfig::in_memory()).install(
        &runtime,
        MODULE,
        &[compute_hook()],
    )?;

    chain.add(|call| Ok(Some(Value::I32(call.result().map_or(Ok(0), Value::as_i32)? + 1))));
    assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(43)));
    Ok(())
}

#[test]
fn test_install_replaces_only_patched_bodies() -> Result<()> {
    let runtime = Runtime::new();
    runtime.natives().register_fn("Mods.Hooks::OnCompute", |call| Ok(Some(call.arg(0)?.clone())));
    runtime.load(host())?;

    let key = MethodKey::new(MODULE, Token::new(COMPUTE));
    let original = runtime.method_body(&key).unwrap();

    let mut coordinator = PatchCoordinator::with_config(PatchConfig::in_memory());
    coordinator.install(&runtime, MODULE, &[compute_hook()])?;
    let patched = runtime.method_body(&key).unwrap();
    assert_ne!(original, patched);
    assert_eq!(patched.code.len(), original.code.len() + 1);

    // the coordinator remembers the module, nothing is installed twice
    let again = coordinator.install(&runtime, MODULE, &[compute_hook()])?;
    assert!(!again.changed());
    assert!(Arc::ptr_eq(&patched, &runtime.method_body(&key).unwrap()));
    Ok(())
}

#[test]
fn test_unbound_callback_fails_at_call() -> Result<()> {
    let runtime = Runtime::new();
    runtime.load(host())?;
    PatchCoordinator::with_config(PatchConfig::in_memory()).install(
        &runtime,
        MODULE,
        &[compute_hook()],
    )?;

    assert!(matches!(
        runtime.invoke(MODULE, "Bar", "Compute", &[]),
        Err(Error::NativeNotFound(name)) if name == "Mods.Hooks::OnCompute"
    ));
    Ok(())
}

#[test]
fn test_install_requires_loaded_module() {
    let runtime = Runtime::new();
    let result = PatchCoordinator::new().install(&runtime, MODULE, &[compute_hook()]);
    assert!(matches!(result, Err(Error::ModuleNotLoaded(_))));
}

#[test]
fn test_limits_apply_to_patched_code() -> Result<()> {
    // the unpatched body runs exactly four instructions
    let runtime = Runtime::new().with_limits(RuntimeLimits::default().with_max_instructions(4));
    runtime.natives().register_fn("Mods.Hooks::OnCompute", |call| Ok(Some(call.arg(0)?.clone())));
    runtime.load(host())?;
    assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(42)));

    PatchCoordinator::with_config(PatchConfig::in_memory()).install(
        &runtime,
        MODULE,
        &[compute_hook()],
    )?;
    assert!(matches!(
        runtime.invoke(MODULE, "Bar", "Compute", &[]),
        Err(Error::LimitExceeded(_))
    ));
    Ok(())
}

#[test]
fn test_aborted_install_can_be_retried() -> Result<()> {
    // leaves an extra value on the stack at `ret`
    let broken = PatchDescriptor::instruction_patch(
        "compute-extra",
        "Bar",
        "Compute",
        Pattern::new().then(OpcodeMatcher::new("ret")),
        PatchAction::InsertBefore(vec![Instruction::ldc_i4(1).unwrap().into()]),
    );

    let runtime = Runtime::new();
    runtime.natives().register_fn("Mods.Hooks::OnCompute", |call| {
        Ok(Some(Value::I32(call.arg(0)?.as_i32()? + 1)))
    });
    runtime.load(host())?;

    let mut coordinator = PatchCoordinator::with_config(PatchConfig::in_memory());
    let result = coordinator.install(&runtime, MODULE, &[compute_hook(), broken]);
    assert!(matches!(result, Err(Error::InvalidInstructionStream { .. })));
    assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(42)));

    let retry = coordinator.install(&runtime, MODULE, &[compute_hook()])?;
    assert_eq!(retry.applied.len(), 1);
    assert!(retry.skipped.is_empty());
    assert_eq!(runtime.invoke(MODULE, "Bar", "Compute", &[])?, Some(Value::I32(43)));
    Ok(())
}
