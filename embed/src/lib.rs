//! # wasm-embed
//!
//! An embedding layer for running sandboxed WebAssembly guests inside a
//! resource-constrained host process. The engine (Wasmtime) is treated as a
//! black box; this crate owns the parts around it that a device firmware or
//! small host needs to get right.
//!
//! ## Core Concepts
//!
//! ### Runtime
//!
//! A [`Runtime`] owns one fixed-size memory pool. The pool is allocated once
//! at [`Runtime::initialize`], preferring a high-capacity memory region and
//! falling back to a smaller one, and every byte the engine keeps for guests
//! is charged against it: module images, linear memory, and per-call
//! execution stacks. When the pool is full, loads and calls fail with an
//! error instead of growing the host. Guest linear memory lives inside the
//! pool buffer itself.
//!
//! ### Module instances
//!
//! A [`ModuleInstance`] holds one loaded guest program. It borrows the
//! runtime, so the runtime cannot be shut down underneath it. Loading is
//! re-entrant: loading again replaces the previous module.
//!
//! ### Isolated calls
//!
//! Each [`ModuleInstance::call`] runs on its own short-lived thread with a
//! stack sized for the host call machinery plus the guest's stack budget.
//! The execution environment for the call is created and destroyed on that
//! thread. The caller blocks until the result comes back, so the call is
//! synchronous but never runs guest code on the caller's own stack.
//!
//! [`ModuleInstance::call_unchecked`] runs the same protocol in place for
//! callers that already manage suitably sized threads.
//!
//! ## Example
//!
//! ```ignore
//! use wasm_embed::{ModuleInstance, Runtime, RuntimeConfig};
//!
//! let mut runtime = Runtime::new(RuntimeConfig::default());
//! runtime.initialize(128 * 1024)?;
//!
//! let mut module = ModuleInstance::new(&runtime);
//! module.load(ADD_WASM)?;
//!
//! let mut args = [3, 4];
//! module.call("add", &mut args)?;
//! assert_eq!(module.result(), 7);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Runtime                                                   │
//! │  pool (one buffer, one arena, one ledger)                 │
//! │   ├ module images                                         │
//! │   ├ linear memory ◄── MemoryCreator + ResourceLimiter     │
//! │   └ exec stacks   ◄── ExecEnv per call                    │
//! └──────────────────────────────────────────────────────────┘
//!        ▲ &Runtime                ▲ &Runtime
//! ┌──────┴──────────┐      ┌───────┴─────────┐
//! │ ModuleInstance  │      │ ModuleInstance  │
//! │  call() ─► wasm-call thread (own stack)   │
//! └─────────────────┘      └─────────────────┘
//! ```
//!
//! ## Logging
//!
//! Lifecycle milestones and failures are emitted through `tracing`; the host
//! installs whatever subscriber it uses for diagnostics.

pub mod config;
mod engine;
pub mod error;
mod isolate;
pub mod module;
pub mod pool;
pub mod runtime;

pub use config::{
    LoadOptions, OptLevel, RuntimeConfig, DEFAULT_HEAP_BUDGET, DEFAULT_POOL_SIZE,
    DEFAULT_STACK_BUDGET, DEFAULT_THREAD_STACK_BUDGET, MAX_POOL_SIZE, MIN_POOL_SIZE,
};
pub use error::{
    CallError, CallResult, LoadError, LoadResult, Result, RuntimeError, MAX_ERROR_LEN,
};
pub use module::{InstanceId, ModuleInstance};
pub use pool::{MemoryRegion, PoolUsage, RegionAllocator, SystemAllocator};
pub use runtime::Runtime;
