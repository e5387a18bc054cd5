#![allow(dead_code)]

use wasm_embed::{Runtime, RuntimeConfig};

pub const ADD: &str = include_str!("../../guests/add.wat");
pub const MATH: &str = include_str!("../../guests/math.wat");
pub const NATIVE_CALLS: &str = include_str!("../../guests/native_calls.wat");
pub const FAULTS: &str = include_str!("../../guests/faults.wat");
pub const WIDE: &str = include_str!("../../guests/wide.wat");
pub const TABLES: &str = include_str!("../../guests/tables.wat");

/// An initialized runtime with a pool of `pool_size` bytes.
pub fn runtime(pool_size: usize) -> Runtime {
    let mut runtime = Runtime::new(RuntimeConfig::default());
    runtime.initialize(pool_size).expect("runtime initializes");
    runtime
}

/// Bytes of the pool currently charged.
pub fn in_use(runtime: &Runtime) -> usize {
    runtime.memory_usage().expect("runtime is ready").in_use
}

/// Bytes of the pool buffer holding guest linear memory.
pub fn linear_memory(runtime: &Runtime) -> usize {
    runtime.memory_usage().expect("runtime is ready").linear_memory
}
