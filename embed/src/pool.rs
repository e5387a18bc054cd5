//! The runtime's fixed memory pool.
//!
//! The pool is one contiguous buffer allocated at bring-up. Guest linear
//! memories live inside it, carved out by a [`PoolArena`]. Everything the
//! engine keeps on behalf of guests (module images, linear memory, per-call
//! execution stacks) is also charged against a [`PoolLedger`]; once the
//! ledger is full, further loads and calls fail instead of growing the host.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Memory region a pool can be carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRegion {
    /// High-capacity region (external RAM on devices that have it). Preferred.
    External,
    /// Smaller, always-present region.
    Internal,
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegion::External => write!(f, "external"),
            MemoryRegion::Internal => write!(f, "internal"),
        }
    }
}

/// Source of pool memory.
///
/// Hosts with distinct memory regions implement this to route each region to
/// the right heap. Returning `None` reports that the region cannot supply the
/// buffer.
pub trait RegionAllocator: Send + Sync {
    /// Allocate exactly `size` zeroed bytes from `region`.
    fn allocate(&self, region: MemoryRegion, size: usize) -> Option<Box<[u8]>>;
}

/// Serves both regions from the global allocator.
///
/// Allocation failure is reported rather than aborting the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RegionAllocator for SystemAllocator {
    fn allocate(&self, _region: MemoryRegion, size: usize) -> Option<Box<[u8]>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf.into_boxed_slice())
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub region: MemoryRegion,
    pub capacity: usize,
    pub in_use: usize,
    pub peak: usize,
    /// Bytes of the buffer currently holding guest linear memory.
    pub linear_memory: usize,
}

impl PoolUsage {
    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }
}

/// Byte accounting over the pool.
#[derive(Debug)]
pub struct PoolLedger {
    capacity: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `bytes`, or `None` if the pool cannot cover them.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Option<Reservation> {
        self.charge(bytes)?;
        Some(Reservation {
            ledger: Arc::clone(self),
            bytes,
        })
    }

    fn charge(&self, bytes: usize) -> Option<()> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(bytes)?;
            if next > self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Some(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Bytes held against a [`PoolLedger`]; returned to the pool on drop.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<PoolLedger>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Extend the reservation by `extra` bytes. Leaves it unchanged on failure.
    pub fn grow(&mut self, extra: usize) -> bool {
        if self.ledger.charge(extra).is_none() {
            return false;
        }
        self.bytes += extra;
        true
    }

    /// Give back up to `bytes` of the reservation.
    pub fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.bytes);
        self.ledger.release(bytes);
        self.bytes -= bytes;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

/// Offsets of carved blocks are rounded up to this many bytes.
const BLOCK_ALIGN: usize = 16;

fn align_up(offset: usize) -> Option<usize> {
    Some(offset.checked_add(BLOCK_ALIGN - 1)? & !(BLOCK_ALIGN - 1))
}

/// The pool buffer, carved into blocks for guest linear memory.
///
/// Placement is first-fit over a list of live blocks sorted by offset.
pub struct PoolArena {
    base: NonNull<u8>,
    len: usize,
    blocks: Mutex<Vec<(usize, usize)>>,
}

// SAFETY: the buffer is only reached through the disjoint blocks handed out
// by `carve`, and the block list is guarded by a mutex.
unsafe impl Send for PoolArena {}
unsafe impl Sync for PoolArena {}

impl PoolArena {
    fn new(buf: Box<[u8]>) -> Self {
        let len = buf.len();
        let base = NonNull::from(Box::leak(buf)).cast::<u8>();
        Self {
            base,
            len,
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes currently held by live blocks.
    pub fn placed(&self) -> usize {
        self.lock().iter().map(|&(_, len)| len).sum()
    }

    /// Carve a zeroed block of `len` bytes, or `None` if no gap is large enough.
    pub fn carve(self: &Arc<Self>, len: usize) -> Option<ArenaBlock> {
        let mut blocks = self.lock();
        let offset = self.place(&blocks, len)?;
        insert_sorted(&mut blocks, (offset, len));
        // SAFETY: `offset..offset + len` lies inside the buffer and overlaps
        // no other live block.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), 0, len) };
        Some(ArenaBlock {
            arena: Arc::clone(self),
            offset,
            len,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(usize, usize)>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn place(&self, blocks: &[(usize, usize)], len: usize) -> Option<usize> {
        let mut cursor = 0;
        for &(offset, size) in blocks {
            let start = align_up(cursor)?;
            if start.checked_add(len)? <= offset {
                return Some(start);
            }
            cursor = offset + size;
        }
        let start = align_up(cursor)?;
        (start.checked_add(len)? <= self.len).then_some(start)
    }
}

impl Drop for PoolArena {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` came from the leaked box in `new`, and
        // every block holds an `Arc` to the arena, so none are left.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.len,
            )));
        }
    }
}

impl fmt::Debug for PoolArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolArena")
            .field("len", &self.len)
            .field("blocks", &*self.lock())
            .finish()
    }
}

fn insert_sorted(blocks: &mut Vec<(usize, usize)>, block: (usize, usize)) {
    let at = blocks.partition_point(|&listed| listed < block);
    blocks.insert(at, block);
}

/// A block of the pool buffer; returned to the arena on drop.
pub struct ArenaBlock {
    arena: Arc<PoolArena>,
    offset: usize,
    len: usize,
}

impl ArenaBlock {
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: `offset <= arena.len`.
        unsafe { self.arena.base.as_ptr().add(self.offset) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resize to `new_len` bytes, keeping the first `keep` bytes.
    ///
    /// Grows in place when the bytes after the block are free, otherwise
    /// moves to a new gap. Added bytes are zeroed. Returns `false`, leaving
    /// the block untouched, if no gap is large enough.
    pub fn resize(&mut self, new_len: usize, keep: usize) -> bool {
        let keep = keep.min(self.len).min(new_len);
        let arena = Arc::clone(&self.arena);
        let mut blocks = arena.lock();
        let Ok(at) = blocks.binary_search(&(self.offset, self.len)) else {
            return false;
        };
        let limit = blocks.get(at + 1).map_or(arena.len, |&(offset, _)| offset);

        let in_place = self.offset.checked_add(new_len).is_some_and(|end| end <= limit);
        if in_place {
            if new_len > self.len {
                // SAFETY: `offset + len..offset + new_len` is free and inside
                // the buffer.
                unsafe {
                    ptr::write_bytes(self.as_ptr().add(self.len), 0, new_len - self.len);
                }
            }
            blocks[at].1 = new_len;
            self.len = new_len;
            return true;
        }

        let Some(offset) = arena.place(&blocks, new_len) else {
            return false;
        };
        // SAFETY: the new block is free and disjoint from the old one, which
        // is still listed while the gap was chosen.
        unsafe {
            let dst = arena.base.as_ptr().add(offset);
            ptr::copy_nonoverlapping(self.as_ptr(), dst, keep);
            ptr::write_bytes(dst.add(keep), 0, new_len - keep);
        }
        blocks.remove(at);
        insert_sorted(&mut blocks, (offset, new_len));
        self.offset = offset;
        self.len = new_len;
        true
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        let mut blocks = self.arena.lock();
        if let Ok(at) = blocks.binary_search(&(self.offset, self.len)) {
            blocks.remove(at);
        }
    }
}

impl fmt::Debug for ArenaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// The pool buffer and its ledger.
///
/// Owned exclusively by the runtime between bring-up and shutdown.
pub struct Pool {
    arena: Arc<PoolArena>,
    region: MemoryRegion,
    ledger: Arc<PoolLedger>,
}

impl Pool {
    /// Allocate exactly `size` bytes, preferring the external region.
    pub fn allocate(allocator: &dyn RegionAllocator, size: usize) -> Option<Self> {
        let (buf, region) = match allocator.allocate(MemoryRegion::External, size) {
            Some(buf) => (buf, MemoryRegion::External),
            None => {
                tracing::info!("external memory not available, using internal RAM");
                (allocator.allocate(MemoryRegion::Internal, size)?, MemoryRegion::Internal)
            }
        };
        if buf.len() != size {
            tracing::warn!(
                region = %region,
                expected = size,
                actual = buf.len(),
                "region allocator returned a buffer of the wrong size"
            );
            return None;
        }
        Some(Self {
            ledger: Arc::new(PoolLedger::new(buf.len())),
            arena: Arc::new(PoolArena::new(buf)),
            region,
        })
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn ledger(&self) -> &Arc<PoolLedger> {
        &self.ledger
    }

    pub fn arena(&self) -> &Arc<PoolArena> {
        &self.arena
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            region: self.region,
            capacity: self.ledger.capacity(),
            in_use: self.ledger.in_use(),
            peak: self.ledger.peak(),
            linear_memory: self.arena.placed(),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("arena", &self.arena)
            .field("region", &self.region)
            .field("ledger", &self.ledger)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InternalOnly;

    impl RegionAllocator for InternalOnly {
        fn allocate(&self, region: MemoryRegion, size: usize) -> Option<Box<[u8]>> {
            match region {
                MemoryRegion::External => None,
                MemoryRegion::Internal => SystemAllocator.allocate(region, size),
            }
        }
    }

    struct Nothing;

    impl RegionAllocator for Nothing {
        fn allocate(&self, _region: MemoryRegion, _size: usize) -> Option<Box<[u8]>> {
            None
        }
    }

    struct ShortChanged;

    impl RegionAllocator for ShortChanged {
        fn allocate(&self, _region: MemoryRegion, size: usize) -> Option<Box<[u8]>> {
            Some(vec![0; size / 2].into_boxed_slice())
        }
    }

    #[test]
    fn allocate_prefers_external() {
        let pool = Pool::allocate(&SystemAllocator, 4096).unwrap();
        assert_eq!(pool.len(), 4096);
        assert_eq!(pool.region(), MemoryRegion::External);
    }

    #[test]
    fn allocate_falls_back_to_internal() {
        let pool = Pool::allocate(&InternalOnly, 4096).unwrap();
        assert_eq!(pool.region(), MemoryRegion::Internal);
        assert_eq!(pool.usage().capacity, 4096);
    }

    #[test]
    fn allocate_fails_when_both_regions_fail() {
        assert!(Pool::allocate(&Nothing, 4096).is_none());
    }

    #[test]
    fn allocate_rejects_wrong_sized_buffer() {
        assert!(Pool::allocate(&ShortChanged, 4096).is_none());
    }

    #[test]
    fn reservation_released_on_drop() {
        let ledger = Arc::new(PoolLedger::new(100));
        let r = ledger.reserve(60).unwrap();
        assert_eq!(ledger.in_use(), 60);
        assert!(ledger.reserve(50).is_none());
        drop(r);
        assert_eq!(ledger.in_use(), 0);
        assert_eq!(ledger.peak(), 60);
    }

    #[test]
    fn reservation_grow_is_bounded() {
        let ledger = Arc::new(PoolLedger::new(100));
        let mut r = ledger.reserve(10).unwrap();
        assert!(r.grow(80));
        assert_eq!(r.bytes(), 90);
        assert!(!r.grow(20));
        assert_eq!(r.bytes(), 90);
        assert_eq!(ledger.in_use(), 90);
        drop(r);
        assert_eq!(ledger.in_use(), 0);
    }

    #[test]
    fn reserve_exact_capacity() {
        let ledger = Arc::new(PoolLedger::new(100));
        let _r = ledger.reserve(100).unwrap();
        assert!(ledger.reserve(1).is_none());
        assert!(ledger.reserve(0).is_some());
    }

    #[test]
    fn usage_reports_available() {
        let pool = Pool::allocate(&SystemAllocator, 1000).unwrap();
        let _r = pool.ledger().reserve(250).unwrap();
        let usage = pool.usage();
        assert_eq!(usage.in_use, 250);
        assert_eq!(usage.available(), 750);
    }

    #[test]
    fn reservation_shrink_returns_bytes() {
        let ledger = Arc::new(PoolLedger::new(100));
        let mut r = ledger.reserve(40).unwrap();
        r.shrink(15);
        assert_eq!(r.bytes(), 25);
        assert_eq!(ledger.in_use(), 25);
        r.shrink(100);
        assert_eq!(r.bytes(), 0);
        assert_eq!(ledger.in_use(), 0);
    }

    fn arena(len: usize) -> Arc<PoolArena> {
        Arc::new(PoolArena::new(vec![0xaa; len].into_boxed_slice()))
    }

    fn bytes(block: &ArenaBlock) -> &[u8] {
        unsafe { std::slice::from_raw_parts(block.as_ptr(), block.len()) }
    }

    #[test]
    fn carved_blocks_are_zeroed_and_disjoint() {
        let arena = arena(256);
        let a = arena.carve(100).unwrap();
        let b = arena.carve(100).unwrap();
        assert!(bytes(&a).iter().all(|&byte| byte == 0));
        assert!(bytes(&b).iter().all(|&byte| byte == 0));
        let (a_start, b_start) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a_start + 100 <= b_start || b_start + 100 <= a_start);
        assert_eq!(arena.placed(), 200);
        assert!(arena.carve(100).is_none());
    }

    #[test]
    fn dropped_block_frees_its_gap() {
        let arena = arena(128);
        let a = arena.carve(64).unwrap();
        let _b = arena.carve(64).unwrap();
        assert!(arena.carve(16).is_none());
        drop(a);
        assert_eq!(arena.placed(), 64);
        assert!(arena.carve(64).is_some());
    }

    #[test]
    fn resize_grows_in_place_when_followed_by_free_space() {
        let arena = arena(256);
        let mut block = arena.carve(32).unwrap();
        unsafe { block.as_ptr().write(7) };
        let before = block.as_ptr();
        assert!(block.resize(128, 32));
        assert_eq!(block.as_ptr(), before);
        assert_eq!(bytes(&block)[0], 7);
        assert!(bytes(&block)[32..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn resize_moves_and_keeps_contents() {
        let arena = arena(256);
        let mut block = arena.carve(32).unwrap();
        let _neighbour = arena.carve(32).unwrap();
        unsafe { block.as_ptr().add(31).write(9) };
        let before = block.as_ptr();
        assert!(block.resize(96, 32));
        assert_ne!(block.as_ptr(), before);
        assert_eq!(bytes(&block)[31], 9);
        assert!(bytes(&block)[32..].iter().all(|&byte| byte == 0));
        assert_eq!(arena.placed(), 128);
    }

    #[test]
    fn resize_without_room_leaves_block() {
        let arena = arena(64);
        let mut block = arena.carve(32).unwrap();
        let _neighbour = arena.carve(32).unwrap();
        assert!(!block.resize(48, 32));
        assert_eq!(block.len(), 32);
        assert_eq!(arena.placed(), 64);
    }

    #[test]
    fn pool_len_is_arena_len() {
        let pool = Pool::allocate(&SystemAllocator, 4096).unwrap();
        assert_eq!(pool.arena().len(), 4096);
        assert_eq!(pool.arena().placed(), 0);
    }
}
