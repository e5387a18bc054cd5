//! Error types for the embedding layer.
//!
//! Every failure is non-fatal: it is returned to the immediate caller and
//! a bounded copy of its text is kept for the `last_error`/`error` queries.

use thiserror::Error;

/// Longest diagnostic kept for the query API, in bytes.
pub const MAX_ERROR_LEN: usize = 128;

/// Errors raised while bringing up the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The requested pool is below the minimum the engine can operate in.
    #[error("heap pool size too small: {requested} bytes (min {minimum})")]
    PoolTooSmall { requested: usize, minimum: usize },

    /// Neither memory region could supply the pool.
    #[error("failed to allocate global heap ({size} bytes)")]
    AllocationFailed { size: usize },

    /// The engine rejected its configuration.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInitFailed(String),
}

/// Errors raised by `ModuleInstance::load`.
#[derive(Debug, Error)]
pub enum LoadError {
    /// `Runtime::initialize` has not succeeded.
    #[error("runtime not initialized")]
    RuntimeNotReady,

    /// The module file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes did not parse or validate.
    #[error("failed to load module: {0}")]
    ParseFailed(String),

    /// The parsed module could not be instantiated.
    #[error("failed to instantiate module: {0}")]
    InstantiationFailed(String),
}

/// Errors raised by `ModuleInstance::call` and `call_unchecked`.
///
/// None of these unload the instance.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("module not loaded")]
    ModuleNotLoaded,

    /// The pool could not cover the execution stack for this call.
    #[error("failed to create execution environment")]
    ExecutionContextCreationFailed,

    #[error("function '{0}' not found")]
    FunctionNotFound(String),

    /// The guest trapped or raised an exception.
    #[error("exception: {0}")]
    GuestException(String),

    #[error("function call failed")]
    CallFailed,

    /// The worker thread for an isolated call could not be spawned.
    #[error("failed to create call thread: {0}")]
    ExecutionUnitCreationFailed(#[source] std::io::Error),
}

/// Result type alias for runtime bring-up.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type alias for module loading.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Result type alias for guest calls.
pub type CallResult<T> = std::result::Result<T, CallError>;

/// Render `err` for the query API, cut to [`MAX_ERROR_LEN`] on a char boundary.
pub(crate) fn bounded(err: &impl std::fmt::Display) -> String {
    let mut text = err.to_string();
    if text.len() > MAX_ERROR_LEN {
        let mut end = MAX_ERROR_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
