//! Runtime and load-time configuration.

use serde::{Deserialize, Serialize};

/// Default size of the runtime's memory pool.
pub const DEFAULT_POOL_SIZE: usize = 128 * 1024;

/// Smallest pool the engine can operate in.
pub const MIN_POOL_SIZE: usize = 16 * 1024;

/// Soft upper bound on the pool. Larger requests are allowed but logged.
pub const MAX_POOL_SIZE: usize = 512 * 1024;

/// Default guest execution stack budget, recorded at load time.
pub const DEFAULT_STACK_BUDGET: usize = 16 * 1024;

/// Default guest heap budget: how far linear memory may grow past its
/// declared initial size.
pub const DEFAULT_HEAP_BUDGET: usize = 64 * 1024;

/// Default host-side stack reserved for the call machinery of an isolated call.
pub const DEFAULT_THREAD_STACK_BUDGET: usize = 32 * 1024;

/// Code generation effort for guest modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl From<OptLevel> for wasmtime::OptLevel {
    fn from(level: OptLevel) -> Self {
        match level {
            OptLevel::None => wasmtime::OptLevel::None,
            OptLevel::Speed => wasmtime::OptLevel::Speed,
            OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        }
    }
}

/// Configuration for the runtime.
///
/// Can be deserialized from a host's configuration file; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pool size used by [`Runtime::initialize_default`](crate::Runtime::initialize_default).
    pub default_pool_size: usize,

    /// Code generation effort for every module loaded through this runtime.
    pub opt_level: OptLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_pool_size: DEFAULT_POOL_SIZE,
            opt_level: OptLevel::default(),
        }
    }
}

/// Per-load budgets for a guest module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Guest execution stack, reused for every call's execution context.
    pub stack_budget: usize,

    /// Linear memory growth allowed beyond the module's initial size.
    pub heap_budget: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            stack_budget: DEFAULT_STACK_BUDGET,
            heap_budget: DEFAULT_HEAP_BUDGET,
        }
    }
}
