//! Runs alone in its own binary: it changes the process-wide thread budget.

mod common;

use common::{runtime, ADD};
use wasm_embed::{CallError, ModuleInstance, DEFAULT_THREAD_STACK_BUDGET};

#[test]
fn unspawnable_call_thread_keeps_module_loaded() {
    let runtime = runtime(128 * 1024);
    let mut module = ModuleInstance::new(&runtime);
    module.load(ADD.as_bytes()).unwrap();

    ModuleInstance::set_thread_stack_budget(usize::MAX / 2);
    let err = module.call("add", &mut [1, 2]).unwrap_err();
    ModuleInstance::set_thread_stack_budget(DEFAULT_THREAD_STACK_BUDGET);

    assert!(matches!(err, CallError::ExecutionUnitCreationFailed(_)));
    assert!(module.is_loaded());
    assert!(module
        .error()
        .unwrap()
        .starts_with("failed to create call thread"));
    assert_eq!(module.result(), 0);

    module.call("add", &mut [1, 2]).unwrap();
    assert_eq!(module.result(), 3);
}
