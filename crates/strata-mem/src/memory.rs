//! Memory manager facade over the system allocator.
//!
//! Everything that needs individually growable or freeable memory outside
//! a region goes through a [`MemoryManager`]: region chunks, bucket arrays,
//! and associative-array nodes. The manager runs one of two strategies,
//! fixed at construction:
//!
//! - [`AllocStrategy::Tracked`]: live-block accounting, double/foreign free
//!   detection, optional byte budget
//! - [`AllocStrategy::Raw`]: no bookkeeping
//!
//! # Block layout
//!
//! Every block is preceded by a header holding its size and alignment, so
//! [`MemoryManager::free`] needs only the pointer. User pointers are at
//! least 16-byte aligned; over-aligned blocks pad the header out to their
//! alignment.
//!
//! ```text
//! base                          user pointer
//! | pad ... | size | align      | payload ...            |
//!           \__ last 16 bytes __/
//! ```
//!
//! # Examples
//!
//! ```
//! use strata_mem::config::MemoryConfig;
//! use strata_mem::memory::MemoryManager;
//!
//! let mm = MemoryManager::new(MemoryConfig::tracked());
//! let block = mm.allocate(64).unwrap();
//! assert_eq!(mm.stats().live_bytes, 64);
//!
//! unsafe { mm.free(block) };
//! assert_eq!(mm.stats().live_blocks, 0);
//! ```

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;

use hashbrown::HashMap;
use strata_log::{error, warn};

use crate::config::{AllocStrategy, MemoryConfig, process_config};
use crate::error::{MemError, Result};

/// Minimum alignment of every block handed out by the manager.
pub const BLOCK_ALIGN: usize = 16;

/// Bytes directly in front of the user pointer holding `[size, align]`.
const HEADER_SIZE: usize = BLOCK_ALIGN;

/// Distance from the base of a block to its user pointer.
const fn header_offset(align: usize) -> usize {
    if align > BLOCK_ALIGN { align } else { BLOCK_ALIGN }
}

/// Smallest capacity [`grow_capacity`] returns.
pub const MIN_ARRAY_CAPACITY: usize = 8;

/// Allocation counters. All zero under [`AllocStrategy::Raw`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Blocks currently allocated.
    pub live_blocks: usize,
    /// Payload bytes currently allocated.
    pub live_bytes: usize,
    /// Highest `live_bytes` observed.
    pub peak_bytes: usize,
    /// Successful allocations and reallocations since construction.
    pub total_allocations: u64,
}

struct Inner {
    config: MemoryConfig,
    stats: Cell<MemStats>,
    /// user address -> payload size, tracked strategy only
    live: RefCell<HashMap<usize, usize>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let stats = self.stats.get();
        if stats.live_blocks > 0 {
            warn!(
                "memory manager dropped with {} live blocks ({} bytes)",
                stats.live_blocks, stats.live_bytes
            );
        }
    }
}

/// Shared handle to a memory manager.
///
/// Cloning is cheap and yields a handle to the same manager and counters.
/// The handle is single-threaded (`!Send`); concurrent workers use
/// independent managers.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.stats.get())
            .finish()
    }
}

impl MemoryManager {
    /// Creates a manager with an explicit configuration.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                stats: Cell::new(MemStats::default()),
                live: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Creates a manager using the process-wide configuration.
    #[must_use]
    pub fn from_process() -> Self {
        Self::new(process_config())
    }

    /// The strategy this manager was built with.
    #[must_use]
    pub fn strategy(&self) -> AllocStrategy {
        self.inner.config.strategy
    }

    /// Current allocation counters.
    #[must_use]
    pub fn stats(&self) -> MemStats {
        self.inner.stats.get()
    }

    fn tracked(&self) -> bool {
        self.inner.config.strategy == AllocStrategy::Tracked
    }

    fn check_budget(&self, releasing: usize, requested: usize) -> Result<()> {
        let Some(limit) = self.inner.config.byte_limit else {
            return Ok(());
        };
        let live = self.inner.stats.get().live_bytes - releasing;
        if live.saturating_add(requested) > limit {
            error!(
                "allocation of {requested} bytes exceeds budget ({live} of {limit} bytes live)"
            );
            return Err(MemError::OutOfMemory { requested });
        }
        Ok(())
    }

    fn layout_for(size: usize, align: usize) -> Result<Layout> {
        let offset = header_offset(align);
        size.checked_add(offset)
            .and_then(|total| Layout::from_size_align(total, offset).ok())
            .ok_or(MemError::OutOfMemory { requested: size })
    }

    /// Writes the header for a block whose base is `base` and returns the
    /// user pointer.
    ///
    /// # Safety
    ///
    /// `base` must come from `layout_for(size, align)`.
    unsafe fn finish_block(base: NonNull<u8>, size: usize, align: usize) -> NonNull<u8> {
        // SAFETY: the header lies in the offset bytes in front of the user
        // pointer; user is aligned to at least BLOCK_ALIGN, so the header
        // is usize-aligned.
        unsafe {
            let user = base.add(header_offset(align));
            let header = user.sub(HEADER_SIZE).cast::<usize>();
            header.write(size);
            header.add(1).write(align);
            user
        }
    }

    /// Reads `(size, align)` from a block's header.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this manager.
    unsafe fn block_header(ptr: NonNull<u8>) -> (usize, usize) {
        // SAFETY: forwarded caller contract; see finish_block.
        unsafe {
            let header = ptr.sub(HEADER_SIZE).cast::<usize>();
            (header.read(), header.add(1).read())
        }
    }

    fn record(&self, released: usize, acquired: usize, blocks_delta: isize) {
        let mut stats = self.inner.stats.get();
        stats.live_bytes = stats.live_bytes - released + acquired;
        stats.live_blocks = stats.live_blocks.wrapping_add_signed(blocks_delta);
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        if acquired > 0 || blocks_delta > 0 {
            stats.total_allocations += 1;
        }
        self.inner.stats.set(stats);
    }

    /// Looks up the payload size of a tracked block, panicking on a pointer
    /// this manager does not own.
    fn live_size(&self, ptr: NonNull<u8>, op: &str) -> usize {
        match self.inner.live.borrow().get(&ptr.addr().get()) {
            Some(&size) => size,
            None => panic!(
                "{op} of unknown or already-freed block {:#x}",
                ptr.addr().get()
            ),
        }
    }

    /// Allocates `size` bytes, 16-byte aligned, uninitialized.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if the system allocator fails or the
    /// tracked byte budget would be exceeded. Never retries.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, BLOCK_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align` (at least
    /// [`BLOCK_ALIGN`]), uninitialized. Released with [`free`](Self::free)
    /// like any other block.
    ///
    /// # Errors
    ///
    /// - [`MemError::InvalidAlignment`] unless `align` is a power of two
    /// - [`MemError::OutOfMemory`] as for [`allocate`](Self::allocate)
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(MemError::InvalidAlignment { alignment: align });
        }
        if self.tracked() {
            self.check_budget(0, size)?;
        }
        let layout = Self::layout_for(size, align)?;

        // SAFETY: layout has non-zero size (it always includes the header).
        let base = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            error!("system allocator failed for {size} bytes");
            return Err(MemError::OutOfMemory { requested: size });
        };
        // SAFETY: base was allocated with layout_for(size, align).
        let user = unsafe { Self::finish_block(base, size, align) };

        if self.tracked() {
            self.inner.live.borrow_mut().insert(user.addr().get(), size);
            self.record(0, size, 1);
        }
        Ok(user)
    }

    /// Resizes a block, preserving the first `min(old_size, new_size)`
    /// bytes and its alignment. The block may move.
    ///
    /// On failure the original block is untouched and still owned by the
    /// caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this manager (or a clone of
    /// it) and `old_size` its current size. The tracked strategy verifies
    /// both and panics on mismatch.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] as for [`allocate`](Self::allocate).
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        if self.tracked() {
            let recorded = self.live_size(ptr, "reallocate");
            assert_eq!(
                recorded, old_size,
                "reallocate: block holds {recorded} bytes, caller passed {old_size}"
            );
            self.check_budget(old_size, new_size)?;
        }
        // SAFETY: the caller guarantees ptr is a live block of ours.
        let (_, align) = unsafe { Self::block_header(ptr) };
        let old_layout = Self::layout_for(old_size, align)?;
        let new_layout = Self::layout_for(new_size, align)?;

        // SAFETY: old_layout describes the base allocation, which starts
        // header_offset(align) bytes before ptr.
        let new_base = unsafe {
            let base = ptr.sub(header_offset(align));
            alloc::realloc(base.as_ptr(), old_layout, new_layout.size())
        };
        let Some(new_base) = NonNull::new(new_base) else {
            error!("system allocator failed to grow block to {new_size} bytes");
            return Err(MemError::OutOfMemory {
                requested: new_size,
            });
        };

        // SAFETY: realloc keeps the layout's alignment, so new_base
        // matches layout_for(new_size, align).
        let user = unsafe { Self::finish_block(new_base, new_size, align) };

        if self.tracked() {
            let mut live = self.inner.live.borrow_mut();
            live.remove(&ptr.addr().get());
            live.insert(user.addr().get(), new_size);
            drop(live);
            self.record(old_size, new_size, 0);
        }
        Ok(user)
    }

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this manager (or a clone of
    /// it), and must not be used afterwards. The tracked strategy panics on
    /// double or foreign frees instead of corrupting the heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        if self.tracked() {
            let size = self.live_size(ptr, "free");
            self.inner.live.borrow_mut().remove(&ptr.addr().get());
            self.record(size, 0, -1);
        }

        // SAFETY: the header written by finish_block precedes ptr and
        // holds the size and alignment the base layout was built from.
        unsafe {
            let (size, align) = Self::block_header(ptr);
            let offset = header_offset(align);
            let layout = Layout::from_size_align_unchecked(size + offset, offset);
            alloc::dealloc(ptr.sub(offset).as_ptr(), layout);
        }
    }

    fn array_bytes<T>(count: usize) -> Result<usize> {
        size_of::<T>()
            .checked_mul(count)
            .ok_or(MemError::OutOfMemory {
                requested: usize::MAX,
            })
    }

    /// Allocates uninitialized storage for `count` values of `T`, aligned
    /// for `T`.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`], including on size overflow.
    pub fn allocate_array<T>(&self, count: usize) -> Result<NonNull<T>> {
        let bytes = Self::array_bytes::<T>(count)?;
        self.allocate_aligned(bytes, align_of::<T>())
            .map(NonNull::cast)
    }

    /// Resizes an array allocated by [`allocate_array`](Self::allocate_array).
    ///
    /// # Safety
    ///
    /// As for [`reallocate`](Self::reallocate), with `old_count` the
    /// element count the array was allocated with.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`]; the original array is left intact.
    pub unsafe fn reallocate_array<T>(
        &self,
        ptr: NonNull<T>,
        old_count: usize,
        new_count: usize,
    ) -> Result<NonNull<T>> {
        let old_bytes = Self::array_bytes::<T>(old_count)?;
        let new_bytes = Self::array_bytes::<T>(new_count)?;
        // SAFETY: forwarded caller contract.
        unsafe {
            self.reallocate(ptr.cast(), old_bytes, new_bytes)
                .map(NonNull::cast)
        }
    }

    /// Releases an array. Element destructors are not run.
    ///
    /// # Safety
    ///
    /// As for [`free`](Self::free).
    pub unsafe fn free_array<T>(&self, ptr: NonNull<T>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.free(ptr.cast()) }
    }
}

/// Next capacity for a growing array.
///
/// Doubles `current` (starting from [`MIN_ARRAY_CAPACITY`]); the result is
/// never less than `required`.
///
/// ```
/// use strata_mem::memory::grow_capacity;
///
/// assert_eq!(grow_capacity(0, 1), 8);
/// assert_eq!(grow_capacity(8, 9), 16);
/// assert_eq!(grow_capacity(8, 100), 100);
/// ```
#[must_use]
pub const fn grow_capacity(current: usize, required: usize) -> usize {
    let doubled = current.saturating_mul(2);
    let cap = if doubled > MIN_ARRAY_CAPACITY {
        doubled
    } else {
        MIN_ARRAY_CAPACITY
    };
    if cap > required { cap } else { required }
}

/// Fixed-length array of `Copy` values backed by a [`MemoryManager`].
///
/// Released to the manager when dropped. Tables use it for their bucket
/// arrays.
pub struct ManagedArray<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    mm: MemoryManager,
}

impl<T: Copy> ManagedArray<T> {
    /// Allocates `len` elements, each set to `fill`.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] from the manager.
    pub fn new(mm: &MemoryManager, len: usize, fill: T) -> Result<Self> {
        let ptr = mm.allocate_array::<T>(len)?;
        for i in 0..len {
            // SAFETY: ptr is valid for len elements of T.
            unsafe { ptr.add(i).write(fill) };
        }
        Ok(Self {
            ptr,
            len,
            mm: mm.clone(),
        })
    }

    /// Resizes in place through [`MemoryManager::reallocate_array`],
    /// setting new trailing elements to `fill`.
    ///
    /// Hash tables never resize their bucket arrays this way; they rehash
    /// into a fresh array. This is for dense arrays whose indices survive
    /// growth.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`]; the array is unchanged on failure.
    pub fn resize(&mut self, new_len: usize, fill: T) -> Result<()> {
        // SAFETY: self.ptr is a live array of self.len elements from self.mm.
        let ptr =
            unsafe { self.mm.reallocate_array(self.ptr, self.len, new_len)? };
        for i in self.len..new_len {
            // SAFETY: ptr is valid for new_len elements.
            unsafe { ptr.add(i).write(fill) };
        }
        self.ptr = ptr;
        self.len = new_len;
        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }

    /// Borrows the elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr holds len initialized elements for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutably borrows the elements.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> Deref for ManagedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> DerefMut for ManagedArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Copy> Drop for ManagedArray<T> {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated from mm and is released exactly once.
        unsafe { self.mm.free_array(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_free() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let ptr = mm.allocate(32).unwrap();
        assert_eq!(ptr.addr().get() % BLOCK_ALIGN, 0);

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 32);
            assert_eq!(*ptr.as_ptr().add(31), 0xAB);
            mm.free(ptr);
        }
        assert_eq!(mm.stats().live_blocks, 0);
        assert_eq!(mm.stats().peak_bytes, 32);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let ptr = mm.allocate(0).unwrap();
        assert_eq!(mm.stats().live_blocks, 1);
        unsafe { mm.free(ptr) };
    }

    #[test]
    fn test_reallocate_preserves_contents() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let ptr = mm.allocate(4).unwrap();
        unsafe {
            ptr.as_ptr().copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4);
            let grown = mm.reallocate(ptr, 4, 4096).unwrap();
            assert_eq!(std::slice::from_raw_parts(grown.as_ptr(), 4), &[1, 2, 3, 4]);
            assert_eq!(mm.stats().live_bytes, 4096);
            mm.free(grown);
        }
        assert_eq!(mm.stats().live_bytes, 0);
        assert_eq!(mm.stats().total_allocations, 2);
    }

    #[test]
    fn test_byte_limit_reports_oom() {
        let mm = MemoryManager::new(MemoryConfig::tracked().with_byte_limit(100));
        let a = mm.allocate(60).unwrap();
        assert_eq!(
            mm.allocate(60).unwrap_err(),
            MemError::OutOfMemory { requested: 60 }
        );
        // A failed reallocate leaves the block usable.
        assert!(unsafe { mm.reallocate(a, 60, 200) }.is_err());
        assert_eq!(mm.stats().live_bytes, 60);
        unsafe { mm.free(a) };
        let b = mm.allocate(100).unwrap();
        unsafe { mm.free(b) };
    }

    #[test]
    fn test_raw_strategy_keeps_no_stats() {
        let mm = MemoryManager::new(MemoryConfig::raw().with_byte_limit(1));
        let ptr = mm.allocate(1024).unwrap();
        assert_eq!(mm.stats(), MemStats::default());
        unsafe { mm.free(ptr) };
    }

    #[test]
    #[should_panic(expected = "already-freed")]
    fn test_double_free_is_detected() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let ptr = mm.allocate(8).unwrap();
        unsafe {
            mm.free(ptr);
            mm.free(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "caller passed")]
    fn test_reallocate_size_mismatch_is_detected() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let ptr = mm.allocate(8).unwrap();
        let _ = unsafe { mm.reallocate(ptr, 16, 32) };
    }

    #[test]
    fn test_clones_share_counters() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        let other = mm.clone();
        let ptr = other.allocate(10).unwrap();
        assert_eq!(mm.stats().live_blocks, 1);
        unsafe { mm.free(ptr) };
        assert_eq!(other.stats().live_blocks, 0);
    }

    #[test]
    fn test_grow_capacity_contract() {
        for current in [0, 1, 7, 8, 1000] {
            for required in [0, 1, 9, 5000] {
                assert!(grow_capacity(current, required) >= required);
            }
        }
        assert_eq!(grow_capacity(16, 17), 32);
        assert_eq!(grow_capacity(usize::MAX, 1), usize::MAX);
    }

    #[test]
    fn test_array_overflow_is_oom() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        assert!(mm.allocate_array::<u64>(usize::MAX).is_err());
    }

    #[repr(align(64))]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Line([u8; 64]);

    #[test]
    fn test_over_aligned_blocks() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        assert!(matches!(
            mm.allocate_aligned(8, 24),
            Err(MemError::InvalidAlignment { alignment: 24 })
        ));

        let ptr = mm.allocate_aligned(100, 4096).unwrap();
        assert_eq!(ptr.addr().get() % 4096, 0);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 100);
            let grown = mm.reallocate(ptr, 100, 10_000).unwrap();
            assert_eq!(grown.addr().get() % 4096, 0);
            assert_eq!(*grown.as_ptr().add(99), 0x5A);
            mm.free(grown);
        }
        assert_eq!(mm.stats().live_blocks, 0);
    }

    #[test]
    fn test_managed_array_of_over_aligned_elements() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        {
            let mut lines = ManagedArray::new(&mm, 3, Line([1; 64])).unwrap();
            assert_eq!(lines.as_ptr().addr() % 64, 0);
            lines.resize(40, Line([2; 64])).unwrap();
            assert_eq!(lines.as_ptr().addr() % 64, 0);
            assert_eq!(lines[2], Line([1; 64]));
            assert_eq!(lines[39], Line([2; 64]));
        }
        assert_eq!(mm.stats().live_blocks, 0);
    }

    #[test]
    fn test_managed_array_fill_resize_drop() {
        let mm = MemoryManager::new(MemoryConfig::tracked());
        {
            let mut arr = ManagedArray::new(&mm, 4, 7u32).unwrap();
            assert_eq!(&arr[..], &[7, 7, 7, 7]);

            arr[1] = 9;
            arr.resize(6, 0).unwrap();
            assert_eq!(&arr[..], &[7, 9, 7, 7, 0, 0]);

            arr.fill(1);
            assert!(arr.iter().all(|&v| v == 1));
            assert_eq!(mm.stats().live_bytes, 24);
        }
        assert_eq!(mm.stats().live_blocks, 0);
    }
}
