//! Guest module lifecycle and the per-call execution protocol.
//!
//! A [`ModuleInstance`] owns one loaded guest program. Every call creates a
//! fresh execution environment sized by the stack budget recorded at load,
//! runs the guest function, and destroys the environment before returning.
//! [`ModuleInstance::call`] additionally moves that whole sequence onto a
//! dedicated thread so the guest never runs on the caller's stack.

use std::path::Path;

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::LoadOptions;
use crate::engine::{GuestInstance, GuestModule};
use crate::error::{bounded, CallError, CallResult, LoadError, LoadResult};
use crate::isolate;
use crate::runtime::Runtime;

/// Unique identifier for a module instance, used to correlate log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random InstanceId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handles held while a module is loaded.
///
/// Fields drop in declaration order: the instance is released before the
/// module it was created from.
struct Loaded {
    instance: GuestInstance,
    module: GuestModule,
}

/// A loaded guest program.
///
/// `load`, `unload` and the call methods take `&mut self`, so operations on
/// one instance are serialized by the borrow checker. Distinct instances can
/// be called from different threads at the same time.
pub struct ModuleInstance<'rt> {
    runtime: &'rt Runtime,
    id: InstanceId,
    handles: Option<Loaded>,
    stack_budget: usize,
    last_result: u32,
    last_error: Option<String>,
}

impl<'rt> ModuleInstance<'rt> {
    /// Create an unloaded instance bound to `runtime`.
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            id: InstanceId::new(),
            handles: None,
            stack_budget: LoadOptions::default().stack_budget,
            last_result: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Load with the default stack and heap budgets.
    pub fn load(&mut self, bytes: &[u8]) -> LoadResult<()> {
        self.load_with(bytes, LoadOptions::default())
    }

    /// Load a module from a file.
    pub fn load_file(&mut self, path: impl AsRef<Path>, options: LoadOptions) -> LoadResult<()> {
        let bytes = match std::fs::read(path.as_ref()) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.record_load_error(LoadError::Io(err))),
        };
        self.load_with(&bytes, options)
    }

    /// Parse, validate and instantiate `bytes`, replacing any module already
    /// held by this instance.
    ///
    /// On failure the instance is left unloaded.
    pub fn load_with(&mut self, bytes: &[u8], options: LoadOptions) -> LoadResult<()> {
        let _span = info_span!("load", instance = %self.id).entered();

        let runtime = self.runtime;
        let Some(engine) = runtime.engine() else {
            return Err(self.record_load_error(LoadError::RuntimeNotReady));
        };

        self.unload();

        info!(size = bytes.len(), "loading module");
        let module = match engine.load(bytes, options.stack_budget) {
            Ok(module) => module,
            Err(err) => return Err(self.record_load_error(err)),
        };
        info!("module loaded");

        info!(
            stack = options.stack_budget,
            heap = options.heap_budget,
            "instantiating module"
        );
        let instance = match engine.instantiate(&module, options.heap_budget) {
            Ok(instance) => instance,
            Err(err) => {
                drop(module);
                return Err(self.record_load_error(err));
            }
        };

        self.stack_budget = options.stack_budget;
        self.handles = Some(Loaded { instance, module });
        info!("module ready for execution");
        Ok(())
    }

    /// Call the exported function `name` on an isolated thread.
    ///
    /// `args` carries the argument cells in and the result cells out (i32 and
    /// f32 take one cell, i64 and f64 take two, low word first). The thread's
    /// stack covers [`thread_stack_budget`](Self::thread_stack_budget) plus
    /// the guest stack budget recorded at load. Blocks until the call
    /// completes; must not be called from an async runtime's worker thread.
    pub fn call(&mut self, name: &str, args: &mut [u32]) -> CallResult<()> {
        let stack_size = isolate::thread_stack_budget().saturating_add(self.stack_budget);
        let outcome = isolate::run_isolated(stack_size, || self.call_internal(name, args));
        match outcome {
            Ok(result) => result,
            Err(err) => {
                let err = CallError::ExecutionUnitCreationFailed(err);
                warn!(instance = %self.id, error = %err, "could not isolate call");
                self.last_error = Some(bounded(&err));
                Err(err)
            }
        }
    }

    /// Call the exported function `name` on the current thread.
    ///
    /// Same protocol as [`call`](Self::call) without the isolating thread.
    /// If this reports a [`CallError::GuestException`], unload and reload the
    /// module before calling it again.
    ///
    /// # Safety
    ///
    /// The current thread must have enough free stack for its own frames plus
    /// the guest stack budget recorded at load. Running out of stack inside
    /// guest code is not recoverable.
    pub unsafe fn call_unchecked(&mut self, name: &str, args: &mut [u32]) -> CallResult<()> {
        self.call_internal(name, args)
    }

    fn call_internal(&mut self, name: &str, args: &mut [u32]) -> CallResult<()> {
        let _span = info_span!("call", instance = %self.id, function = name).entered();
        let result = self.invoke(name, args);
        match &result {
            Ok(()) => {
                if let Some(&first) = args.first() {
                    self.last_result = first;
                    debug!(result = first, "function returned");
                }
                debug!("function completed successfully");
            }
            Err(err) => {
                warn!(error = %err, "call failed");
                self.last_error = Some(bounded(err));
            }
        }
        result
    }

    fn invoke(&mut self, name: &str, args: &mut [u32]) -> CallResult<()> {
        let Some(loaded) = self.handles.as_mut() else {
            return Err(CallError::ModuleNotLoaded);
        };
        let instance = &mut loaded.instance;

        let env = instance
            .create_exec_env(self.stack_budget)
            .ok_or(CallError::ExecutionContextCreationFailed)?;

        let Some(func) = instance.lookup_function(name) else {
            drop(env);
            return Err(CallError::FunctionNotFound(name.to_string()));
        };

        debug!(argc = args.len(), "calling function");
        let ok = instance.call(&env, func, args);
        drop(env);

        if ok {
            return Ok(());
        }
        match instance.exception() {
            Some(text) => Err(CallError::GuestException(text.to_string())),
            None => Err(CallError::CallFailed),
        }
    }

    /// Host-side stack reserved for each isolated call, on top of the guest
    /// stack budget. Shared by every instance in the process.
    pub fn thread_stack_budget() -> usize {
        isolate::thread_stack_budget()
    }

    /// Set the host-side stack reserved for each isolated call.
    ///
    /// Process-wide; takes effect for calls that start after it returns.
    pub fn set_thread_stack_budget(bytes: usize) {
        isolate::set_thread_stack_budget(bytes);
    }

    /// Release the instance, then the module. Idempotent.
    pub fn unload(&mut self) {
        if let Some(Loaded { instance, module }) = self.handles.take() {
            drop(instance);
            drop(module);
            info!(instance = %self.id, "module unloaded");
        }
        self.last_error = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.handles.is_some()
    }

    /// First return cell of the most recent successful call.
    pub fn result(&self) -> u32 {
        self.last_result
    }

    /// Most recent failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Stack budget recorded by the last load.
    pub fn stack_budget(&self) -> usize {
        self.stack_budget
    }

    /// Names of the functions the loaded module exports.
    pub fn exports(&self) -> Vec<String> {
        self.handles
            .as_ref()
            .map(|loaded| loaded.module.function_exports())
            .unwrap_or_default()
    }

    fn record_load_error(&mut self, err: LoadError) -> LoadError {
        warn!(instance = %self.id, error = %err, "load failed");
        self.last_error = Some(bounded(&err));
        err
    }
}

impl Drop for ModuleInstance<'_> {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for ModuleInstance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("loaded", &self.is_loaded())
            .field("stack_budget", &self.stack_budget)
            .field("last_result", &self.last_result)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }

    #[test]
    fn new_instance_is_unloaded() {
        let runtime = Runtime::default();
        let module = ModuleInstance::new(&runtime);
        assert!(!module.is_loaded());
        assert_eq!(module.result(), 0);
        assert!(module.error().is_none());
        assert!(module.exports().is_empty());
    }

    #[test]
    fn unload_never_loaded_is_noop() {
        let runtime = Runtime::default();
        let mut module = ModuleInstance::new(&runtime);
        module.unload();
        module.unload();
        assert!(!module.is_loaded());
    }

    #[test]
    fn call_unloaded_fails_without_context() {
        let mut runtime = Runtime::default();
        runtime.initialize(16 * 1024).unwrap();
        let mut module = ModuleInstance::new(&runtime);

        let err = module.call("add", &mut [1, 2]).unwrap_err();
        assert!(matches!(err, CallError::ModuleNotLoaded));
        assert_eq!(module.error(), Some("module not loaded"));
        assert_eq!(runtime.memory_usage().unwrap().peak, 0);
    }
}
