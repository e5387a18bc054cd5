//! Runtime bring-up and teardown.
//!
//! The Runtime is responsible for:
//! - Allocating the fixed memory pool from the preferred region
//! - Handing the pool to the engine
//! - Gating every module operation on readiness

use std::fmt;

use crate::config::{RuntimeConfig, MAX_POOL_SIZE, MIN_POOL_SIZE};
use crate::engine::GuestEngine;
use crate::error::{bounded, Result, RuntimeError};
use crate::pool::{Pool, PoolUsage, RegionAllocator, SystemAllocator};

/// The embedded WebAssembly runtime.
///
/// A Runtime is constructed uninitialized. [`Runtime::initialize`] allocates
/// the pool and brings up the engine; [`ModuleInstance`](crate::ModuleInstance)s
/// borrow the runtime, so it cannot be shut down while any of them is alive.
///
/// # Example
///
/// ```ignore
/// let mut runtime = Runtime::new(RuntimeConfig::default());
/// runtime.initialize(128 * 1024)?;
/// assert!(runtime.is_ready());
///
/// let mut module = ModuleInstance::new(&runtime);
/// module.load(&wasm_bytes)?;
/// ```
pub struct Runtime {
    /// Runtime configuration.
    config: RuntimeConfig,

    /// Source of pool memory.
    allocator: Box<dyn RegionAllocator>,

    /// Present exactly while the runtime is ready; owns the pool.
    engine: Option<GuestEngine>,

    /// Last bring-up failure.
    last_error: Option<String>,
}

impl Runtime {
    /// Create an uninitialized runtime that allocates from the global heap.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_allocator(config, SystemAllocator)
    }

    /// Create an uninitialized runtime that allocates its pool from `allocator`.
    pub fn with_allocator(config: RuntimeConfig, allocator: impl RegionAllocator + 'static) -> Self {
        Self {
            config,
            allocator: Box::new(allocator),
            engine: None,
            last_error: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Initialize with the configured default pool size.
    pub fn initialize_default(&mut self) -> Result<()> {
        self.initialize(self.config.default_pool_size)
    }

    /// Allocate a pool of exactly `pool_size` bytes and bring up the engine.
    ///
    /// Succeeds without reallocating if the runtime is already initialized.
    pub fn initialize(&mut self, pool_size: usize) -> Result<()> {
        if self.engine.is_some() {
            tracing::info!("runtime already initialized");
            return Ok(());
        }

        tracing::info!(pool_size, "initializing runtime");
        let result = self.bring_up(pool_size);
        match &result {
            Ok(()) => {
                tracing::info!(pool_size, "runtime initialized");
                self.log_memory_usage();
            }
            Err(err) => {
                tracing::warn!(error = %err, "runtime initialization failed");
                self.last_error = Some(bounded(err));
            }
        }
        result
    }

    fn bring_up(&mut self, pool_size: usize) -> Result<()> {
        if pool_size < MIN_POOL_SIZE {
            return Err(RuntimeError::PoolTooSmall {
                requested: pool_size,
                minimum: MIN_POOL_SIZE,
            });
        }
        if pool_size > MAX_POOL_SIZE {
            tracing::warn!(
                pool_size,
                max = MAX_POOL_SIZE,
                "pool size exceeds recommended maximum"
            );
        }

        let pool = Pool::allocate(self.allocator.as_ref(), pool_size)
            .ok_or(RuntimeError::AllocationFailed { size: pool_size })?;
        tracing::info!(region = %pool.region(), "allocated runtime pool");

        let engine =
            GuestEngine::with_pool(pool, &self.config).map_err(RuntimeError::RuntimeInitFailed)?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Tear down the engine and release the pool.
    ///
    /// Does nothing if the runtime is not initialized.
    pub fn shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            tracing::info!("shutting down runtime");
            drop(engine);
            tracing::info!("runtime shutdown complete");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    /// Last initialization failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Pool occupancy, or `None` if the runtime is not initialized.
    pub fn memory_usage(&self) -> Option<PoolUsage> {
        self.engine.as_ref().map(|engine| engine.pool().usage())
    }

    /// Emit pool occupancy as a tracing event.
    pub fn log_memory_usage(&self) {
        match self.memory_usage() {
            Some(usage) => tracing::info!(
                region = %usage.region,
                capacity = usage.capacity,
                in_use = usage.in_use,
                peak = usage.peak,
                linear_memory = usage.linear_memory,
                available = usage.available(),
                "pool memory status"
            ),
            None => tracing::info!("pool memory status: runtime not initialized"),
        }
    }

    pub(crate) fn engine(&self) -> Option<&GuestEngine> {
        self.engine.as_ref()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .field("usage", &self.memory_usage())
            .field("last_error", &self.last_error)
            .finish()
    }
}
