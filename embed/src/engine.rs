//! Adapter over the Wasmtime engine.
//!
//! This is the only module that talks to Wasmtime. It exposes the handful
//! of operations the embedding layer needs: initialize over a pool, load,
//! instantiate, create and destroy an execution environment, look up, call,
//! and read back a pending exception.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use wasmtime::{
    Config, Engine, ExternType, Func, Instance, LinearMemory, MemoryCreator, MemoryType, Module,
    ResourceLimiter, Store, Trap, Val, ValType,
};

use crate::config::{RuntimeConfig, DEFAULT_STACK_BUDGET};
use crate::error::{LoadError, LoadResult};
use crate::pool::{ArenaBlock, Pool, PoolArena, PoolLedger, Reservation};

/// Pool bytes charged per table element.
const TABLE_ELEMENT_BYTES: usize = std::mem::size_of::<usize>();

/// The engine side of an initialized runtime. Owns the pool.
pub(crate) struct GuestEngine {
    config: RuntimeConfig,
    pool: Pool,
}

impl GuestEngine {
    /// Hand `pool` to the engine. On failure the pool is dropped with the error.
    pub fn with_pool(pool: Pool, config: &RuntimeConfig) -> Result<Self, String> {
        let engine = Self {
            config: config.clone(),
            pool,
        };
        Engine::new(&engine.wasm_config(DEFAULT_STACK_BUDGET)).map_err(|e| format!("{e:#}"))?;
        Ok(engine)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn ledger(&self) -> &Arc<PoolLedger> {
        self.pool.ledger()
    }

    /// Core-module feature set: no threads, no multi-memory, no memory64, no
    /// GC, no components.
    ///
    /// Linear memories are placed in the pool buffer. Without a reservation
    /// or guard region the compiled code bounds-checks every access.
    fn wasm_config(&self, stack_budget: usize) -> Config {
        let mut config = Config::new();
        config
            .max_wasm_stack(stack_budget)
            .wasm_threads(false)
            .wasm_multi_memory(false)
            .wasm_memory64(false)
            .wasm_gc(false)
            .wasm_component_model(false)
            .memory_reservation(0)
            .memory_guard_size(0)
            .memory_reservation_for_growth(0)
            .memory_init_cow(false)
            .with_host_memory(Arc::new(PoolMemoryCreator {
                arena: Arc::clone(self.pool.arena()),
            }))
            .cranelift_opt_level(self.config.opt_level.into());
        config
    }

    /// Parse and validate `bytes` (binary or text format).
    ///
    /// Each module gets its own engine so that the guest stack limit matches
    /// the budget it was loaded with.
    pub fn load(&self, bytes: &[u8], stack_budget: usize) -> LoadResult<GuestModule> {
        if stack_budget == 0 {
            return Err(LoadError::InstantiationFailed(
                "stack budget must be non-zero".to_string(),
            ));
        }
        let engine = Engine::new(&self.wasm_config(stack_budget))
            .map_err(|e| LoadError::InstantiationFailed(format!("{e:#}")))?;
        let image = self.ledger().reserve(bytes.len()).ok_or_else(|| {
            LoadError::InstantiationFailed(format!(
                "pool exhausted: module image needs {} bytes, {} available",
                bytes.len(),
                self.pool.usage().available()
            ))
        })?;
        let module =
            Module::new(&engine, bytes).map_err(|e| LoadError::ParseFailed(format!("{e:#}")))?;
        Ok(GuestModule {
            module,
            engine,
            _image: image,
        })
    }

    /// Instantiate `module` with linear memory placed in and charged to the pool.
    pub fn instantiate(
        &self,
        module: &GuestModule,
        heap_budget: usize,
    ) -> LoadResult<GuestInstance> {
        let state = GuestState {
            limiter: PoolLimiter::new(Arc::clone(self.ledger()), heap_budget),
            exception: None,
        };
        let mut store = Store::new(&module.engine, state);
        store.limiter(|state| &mut state.limiter);
        let instance = Instance::new(&mut store, &module.module, &[])
            .map_err(|e| LoadError::InstantiationFailed(format!("{e:#}")))?;
        Ok(GuestInstance {
            instance,
            store,
            ledger: Arc::clone(self.ledger()),
        })
    }
}

/// A parsed, validated module.
pub(crate) struct GuestModule {
    module: Module,
    engine: Engine,
    _image: Reservation,
}

impl GuestModule {
    /// Names of exported functions, in export order.
    pub fn function_exports(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect()
    }
}

struct GuestState {
    limiter: PoolLimiter,
    exception: Option<String>,
}

/// Places linear memories in the pool buffer.
struct PoolMemoryCreator {
    arena: Arc<PoolArena>,
}

// SAFETY: every memory is a block of the pool buffer that no other memory
// overlaps, zeroed when carved, and moved only by `grow_to`.
unsafe impl MemoryCreator for PoolMemoryCreator {
    fn new_memory(
        &self,
        _ty: MemoryType,
        minimum: usize,
        _maximum: Option<usize>,
        _reserved_size_in_bytes: Option<usize>,
        _guard_size_in_bytes: usize,
    ) -> Result<Box<dyn LinearMemory>, String> {
        let block = self.arena.carve(minimum).ok_or_else(|| {
            format!("pool has no room to place {minimum} bytes of linear memory")
        })?;
        Ok(Box::new(PoolMemory { block }))
    }
}

/// A linear memory living in one pool block; its size is the block's size.
struct PoolMemory {
    block: ArenaBlock,
}

// SAFETY: `as_ptr` always points at `byte_size` bytes owned by this memory.
// Growth beyond the capacity may move the block, which the engine allows
// because memories are configured without a reservation.
unsafe impl LinearMemory for PoolMemory {
    fn byte_size(&self) -> usize {
        self.block.len()
    }

    fn byte_capacity(&self) -> usize {
        self.block.len()
    }

    fn grow_to(&mut self, new_size: usize) -> wasmtime::Result<()> {
        let keep = self.block.len();
        if !self.block.resize(new_size, keep) {
            return Err(wasmtime::Error::msg(format!(
                "pool has no room to grow linear memory to {new_size} bytes"
            )));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }
}

/// Charges linear memory and tables to the pool and caps memory growth at
/// the heap budget.
struct PoolLimiter {
    ledger: Arc<PoolLedger>,
    heap_budget: usize,
    initial: Option<usize>,
    memory: Option<Reservation>,
    tables: Option<Reservation>,
    pending_memory: usize,
    pending_tables: usize,
}

impl PoolLimiter {
    fn new(ledger: Arc<PoolLedger>, heap_budget: usize) -> Self {
        Self {
            ledger,
            heap_budget,
            initial: None,
            memory: None,
            tables: None,
            pending_memory: 0,
            pending_tables: 0,
        }
    }
}

/// Charge `extra` bytes to `slot`, opening the reservation on first use.
fn charge(ledger: &Arc<PoolLedger>, slot: &mut Option<Reservation>, extra: usize) -> bool {
    match slot {
        Some(reservation) => reservation.grow(extra),
        None => match ledger.reserve(extra) {
            Some(reservation) => {
                *slot = Some(reservation);
                true
            }
            None => false,
        },
    }
}

impl ResourceLimiter for PoolLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        // The first request is the memory's initial allocation.
        let initial = *self.initial.get_or_insert(desired);
        if desired > initial.saturating_add(self.heap_budget) {
            return Ok(false);
        }
        let extra = desired.saturating_sub(current);
        let granted = charge(&self.ledger, &mut self.memory, extra);
        self.pending_memory = if granted { extra } else { 0 };
        Ok(granted)
    }

    fn memory_grow_failed(&mut self, error: wasmtime::Error) -> wasmtime::Result<()> {
        if let Some(reservation) = &mut self.memory {
            reservation.shrink(self.pending_memory);
        }
        self.pending_memory = 0;
        tracing::debug!(error = %format!("{error:#}"), "memory growth failed");
        Ok(())
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let extra = desired
            .saturating_sub(current)
            .saturating_mul(TABLE_ELEMENT_BYTES);
        let granted = charge(&self.ledger, &mut self.tables, extra);
        self.pending_tables = if granted { extra } else { 0 };
        Ok(granted)
    }

    fn table_grow_failed(&mut self, error: wasmtime::Error) -> wasmtime::Result<()> {
        if let Some(reservation) = &mut self.tables {
            reservation.shrink(self.pending_tables);
        }
        self.pending_tables = 0;
        tracing::debug!(error = %format!("{error:#}"), "table growth failed");
        Ok(())
    }

    fn memories(&self) -> usize {
        1
    }
}

/// A live instance: guest memory and globals.
pub(crate) struct GuestInstance {
    instance: Instance,
    store: Store<GuestState>,
    ledger: Arc<PoolLedger>,
}

/// Per-call execution environment.
///
/// Holds the guest stack budget against the pool and remembers the thread
/// that created it; it must be used and dropped on that same thread.
pub(crate) struct ExecEnv {
    _stack: Reservation,
    thread: ThreadId,
}

impl GuestInstance {
    pub fn create_exec_env(&self, stack_size: usize) -> Option<ExecEnv> {
        Some(ExecEnv {
            _stack: self.ledger.reserve(stack_size)?,
            thread: thread::current().id(),
        })
    }

    pub fn lookup_function(&mut self, name: &str) -> Option<Func> {
        self.instance.get_func(&mut self.store, name)
    }

    /// Exception raised by the most recent failed call, if any.
    pub fn exception(&self) -> Option<&str> {
        self.store.data().exception.as_deref()
    }

    /// Call `func` with `argv` as argument cells; results overwrite the
    /// leading cells. Returns `false` on failure, with the guest exception
    /// (if any) available from [`GuestInstance::exception`].
    pub fn call(&mut self, env: &ExecEnv, func: Func, argv: &mut [u32]) -> bool {
        debug_assert_eq!(
            env.thread,
            thread::current().id(),
            "execution environment used off its creating thread"
        );
        self.store.data_mut().exception = None;

        let ty = func.ty(&self.store);
        let params = match decode_params(ty.params(), argv) {
            Ok(params) => params,
            Err(msg) => {
                self.store.data_mut().exception = Some(msg);
                return false;
            }
        };
        let mut results = match result_slots(ty.results(), argv.len()) {
            Ok(results) => results,
            Err(msg) => {
                self.store.data_mut().exception = Some(msg);
                return false;
            }
        };

        match func.call(&mut self.store, &params, &mut results) {
            Ok(()) => {
                encode_results(&results, argv);
                true
            }
            Err(err) => {
                match err.downcast_ref::<Trap>() {
                    Some(trap) => self.store.data_mut().exception = Some(trap.to_string()),
                    None => tracing::debug!(error = %format!("{err:#}"), "call failed without a trap"),
                }
                false
            }
        }
    }
}

/// Number of 32-bit cells a value of `ty` occupies.
fn cells(ty: &ValType) -> Option<usize> {
    match ty {
        ValType::I32 | ValType::F32 => Some(1),
        ValType::I64 | ValType::F64 => Some(2),
        _ => None,
    }
}

fn total_cells(types: impl Iterator<Item = ValType>) -> Result<(Vec<ValType>, usize), String> {
    let types: Vec<ValType> = types.collect();
    let mut total = 0;
    for ty in &types {
        total += cells(ty).ok_or_else(|| format!("unsupported value type {ty:?}"))?;
    }
    Ok((types, total))
}

fn join(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

fn decode_params(
    types: impl Iterator<Item = ValType>,
    argv: &[u32],
) -> Result<Vec<Val>, String> {
    let (types, needed) = total_cells(types)?;
    if argv.len() < needed {
        return Err(format!(
            "invalid argument count {}, must be no smaller than {needed}",
            argv.len()
        ));
    }
    let mut cell = 0;
    let mut params = Vec::with_capacity(types.len());
    for ty in types {
        let width = cells(&ty).unwrap_or(0);
        let val = match ty {
            ValType::I32 => Val::I32(argv[cell] as i32),
            ValType::F32 => Val::F32(argv[cell]),
            ValType::I64 => Val::I64(join(argv[cell], argv[cell + 1]) as i64),
            ValType::F64 => Val::F64(join(argv[cell], argv[cell + 1])),
            other => return Err(format!("unsupported value type {other:?}")),
        };
        cell += width;
        params.push(val);
    }
    Ok(params)
}

fn result_slots(types: impl Iterator<Item = ValType>, argc: usize) -> Result<Vec<Val>, String> {
    let (types, needed) = total_cells(types)?;
    if argc < needed {
        return Err(format!("invalid argument count {argc}, results need {needed}"));
    }
    Ok(types
        .iter()
        .map(|ty| match ty {
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => Val::I32(0),
        })
        .collect())
}

fn encode_results(results: &[Val], argv: &mut [u32]) {
    let mut cell = 0;
    for val in results {
        match *val {
            Val::I32(v) => {
                argv[cell] = v as u32;
                cell += 1;
            }
            Val::F32(bits) => {
                argv[cell] = bits;
                cell += 1;
            }
            Val::I64(v) => {
                argv[cell] = v as u32;
                argv[cell + 1] = ((v as u64) >> 32) as u32;
                cell += 2;
            }
            Val::F64(bits) => {
                argv[cell] = bits as u32;
                argv[cell + 1] = (bits >> 32) as u32;
                cell += 2;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_per_type() {
        assert_eq!(cells(&ValType::I32), Some(1));
        assert_eq!(cells(&ValType::F32), Some(1));
        assert_eq!(cells(&ValType::I64), Some(2));
        assert_eq!(cells(&ValType::F64), Some(2));
        assert_eq!(cells(&ValType::V128), None);
    }

    #[test]
    fn decode_mixed_params() {
        let argv = [7, 0xdead_beef, 0x1, 2.5f32.to_bits()];
        let params =
            decode_params([ValType::I32, ValType::I64, ValType::F32].into_iter(), &argv).unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].i32(), Some(7));
        assert_eq!(params[1].i64(), Some(0x1_dead_beef));
        assert_eq!(params[2].f32(), Some(2.5));
    }

    #[test]
    fn decode_rejects_short_argv() {
        let err = decode_params([ValType::I32, ValType::I32].into_iter(), &[1]).unwrap_err();
        assert!(err.contains("invalid argument count 1"));
    }

    #[test]
    fn extra_cells_are_ignored() {
        let params = decode_params([ValType::I32].into_iter(), &[1, 2, 3]).unwrap();
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn result_slots_need_room() {
        assert!(result_slots([ValType::I64].into_iter(), 1).is_err());
        assert_eq!(result_slots([ValType::I64].into_iter(), 2).unwrap().len(), 1);
        assert!(result_slots(std::iter::empty(), 0).unwrap().is_empty());
    }

    #[test]
    fn limiter_charges_memory_up_to_heap_budget() {
        let ledger = Arc::new(PoolLedger::new(1024 * 1024));
        let mut limiter = PoolLimiter::new(Arc::clone(&ledger), 64 * 1024);

        assert!(limiter.memory_growing(0, 64 * 1024, None).unwrap());
        assert_eq!(ledger.in_use(), 64 * 1024);
        assert!(limiter.memory_growing(64 * 1024, 128 * 1024, None).unwrap());
        assert_eq!(ledger.in_use(), 128 * 1024);
        assert!(!limiter.memory_growing(128 * 1024, 192 * 1024, None).unwrap());
        assert_eq!(ledger.in_use(), 128 * 1024);
    }

    #[test]
    fn failed_memory_growth_is_refunded() {
        let ledger = Arc::new(PoolLedger::new(1024 * 1024));
        let mut limiter = PoolLimiter::new(Arc::clone(&ledger), 256 * 1024);

        assert!(limiter.memory_growing(0, 64 * 1024, None).unwrap());
        assert!(limiter.memory_growing(64 * 1024, 192 * 1024, None).unwrap());
        limiter
            .memory_grow_failed(wasmtime::Error::msg("no room"))
            .unwrap();
        assert_eq!(ledger.in_use(), 64 * 1024);
    }

    #[test]
    fn limiter_charges_table_elements() {
        let ledger = Arc::new(PoolLedger::new(1024));
        let mut limiter = PoolLimiter::new(Arc::clone(&ledger), 0);

        assert!(limiter.table_growing(0, 10, None).unwrap());
        assert_eq!(ledger.in_use(), 10 * TABLE_ELEMENT_BYTES);
        assert!(!limiter.table_growing(10, 10_000, None).unwrap());
        assert_eq!(ledger.in_use(), 10 * TABLE_ELEMENT_BYTES);

        assert!(limiter.table_growing(10, 12, None).unwrap());
        limiter
            .table_grow_failed(wasmtime::Error::msg("over maximum"))
            .unwrap();
        assert_eq!(ledger.in_use(), 10 * TABLE_ELEMENT_BYTES);

        drop(limiter);
        assert_eq!(ledger.in_use(), 0);
    }

    #[test]
    fn encode_splits_wide_results() {
        let mut argv = [0u32; 3];
        encode_results(&[Val::I64(-2), Val::I32(9)], &mut argv);
        assert_eq!(argv, [0xffff_fffe, 0xffff_ffff, 9]);
    }
}
