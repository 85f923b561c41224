//! Region (arena) allocator for compiler data with a shared lifetime.
//!
//! A [`RegionAllocator`] hands out memory by bumping an offset inside its
//! current chunk. There is no per-object free: everything allocated from a
//! region is reclaimed at once, by [`RegionAllocator::reset`] (pages kept)
//! or by dropping/destroying the region (pages returned to the
//! [`MemoryManager`]).
//!
//! - **Fast allocation** through a bump offset
//! - **Stable addresses**: chunks never move, so earlier allocations stay
//!   valid regardless of later ones
//! - **Epochs**: `reset` bumps a generation counter; [`RegionSlice`]
//!   handles from earlier generations are rejected instead of aliasing
//!   recycled memory
//!
//! # Examples
//!
//! ```
//! use strata_mem::arena::RegionAllocator;
//! use strata_mem::memory::MemoryManager;
//!
//! let mut region = RegionAllocator::create(MemoryManager::from_process(), 4096).unwrap();
//!
//! let name = region.alloc_bytes(b"identifier").unwrap();
//! assert_eq!(region.get(name).unwrap(), b"identifier");
//!
//! region.reset();
//! assert!(region.get(name).is_err());
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use strata_log::{debug, trace};

use crate::error::{MemError, Result};
use crate::memory::MemoryManager;

/// Smallest chunk a region will request from the memory manager.
pub const MIN_CHUNK_SIZE: usize = 256;

/// Chunk size suited to per-compilation-unit syntax data.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Byte written over rewound memory in debug builds.
const RESET_POISON: u8 = 0xDD;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Region allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes handed out since the last reset, excluding alignment padding.
    pub total_allocated: usize,
    /// Number of chunks owned by the region.
    pub chunk_count: usize,
    /// Total capacity of all chunks in bytes.
    pub total_capacity: usize,
}

/// Generation-stamped handle to bytes stored in a region.
///
/// Resolved with [`RegionAllocator::get`]. A handle outlives its data only
/// as a value: resolving it after a reset yields
/// [`MemError::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct RegionSlice {
    region: u64,
    generation: u64,
    chunk: u32,
    offset: usize,
    len: usize,
}

impl RegionSlice {
    /// The region generation this handle was issued in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One contiguous buffer with a high-water mark.
///
/// Memory belongs to the owning region's memory manager and is released
/// by the region, never by the chunk.
struct Chunk {
    start: NonNull<u8>,
    /// Bytes in use from `start`.
    offset: usize,
    capacity: usize,
}

impl Chunk {
    fn new(mm: &MemoryManager, capacity: usize) -> Result<Self> {
        let start = mm.allocate(capacity)?;
        debug!("region chunk of {capacity} bytes at {:#x}", start.addr().get());
        Ok(Chunk {
            start,
            offset: 0,
            capacity,
        })
    }

    /// Bumps the offset for an aligned range, returning its start offset.
    #[inline(always)]
    fn try_alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        let base = self.start.addr().get();
        let current = base + self.offset;
        let aligned = current.checked_add(align - 1)? & !(align - 1);
        let start = aligned - base;
        let end = start.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.offset = end;
        Some(start)
    }

    fn remaining(&self) -> usize {
        self.capacity - self.offset
    }
}

/// Bump allocator over a chain of chunks obtained from a [`MemoryManager`].
///
/// Chunks are kept in creation order; `current` is the allocation target.
/// After a reset, allocation walks the existing chunks again before asking
/// the manager for more.
///
/// Teardown is either [`destroy`](Self::destroy) or scope exit. Both
/// consume the region, so use after destroy does not compile.
pub struct RegionAllocator {
    id: u64,
    mm: MemoryManager,
    chunks: Vec<Chunk>,
    current: usize,
    chunk_size: usize,
    generation: u64,
    total_allocated: usize,
}

impl RegionAllocator {
    /// Creates an empty region. No memory is requested until the first
    /// allocation.
    ///
    /// `default_chunk_size` is raised to [`MIN_CHUNK_SIZE`] if smaller.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] if `default_chunk_size` is zero.
    pub fn create(mm: MemoryManager, default_chunk_size: usize) -> Result<Self> {
        if default_chunk_size == 0 {
            return Err(MemError::InvalidArgument {
                what: "region chunk size must be non-zero",
            });
        }
        Ok(RegionAllocator {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            mm,
            chunks: Vec::new(),
            current: 0,
            chunk_size: default_chunk_size.max(MIN_CHUNK_SIZE),
            generation: 0,
            total_allocated: 0,
        })
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The memory is uninitialized and stays valid until the region is
    /// reset or destroyed.
    ///
    /// # Errors
    ///
    /// - [`MemError::InvalidAlignment`] unless `alignment` is a power of two
    /// - [`MemError::OutOfMemory`] if a new chunk cannot be obtained; the
    ///   region is left exactly as it was
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let (chunk, offset) = self.bump(size, alignment)?;
        // SAFETY: offset..offset + size lies within the chunk's buffer.
        Ok(unsafe { self.chunks[chunk].start.add(offset) })
    }

    /// Finds room for the request, returning `(chunk index, offset)`.
    fn bump(&mut self, size: usize, alignment: usize) -> Result<(usize, usize)> {
        if !alignment.is_power_of_two() {
            return Err(MemError::InvalidAlignment { alignment });
        }

        while let Some(chunk) = self.chunks.get_mut(self.current) {
            if let Some(offset) = chunk.try_alloc(size, alignment) {
                return Ok(self.commit(self.current, offset, size));
            }
            if self.current + 1 == self.chunks.len() {
                break;
            }
            self.current += 1;
        }

        self.grow(size, alignment)
    }

    #[cold]
    fn grow(&mut self, size: usize, alignment: usize) -> Result<(usize, usize)> {
        let needed = size
            .checked_add(alignment - 1)
            .ok_or(MemError::OutOfMemory { requested: size })?;
        let mut chunk = Chunk::new(&self.mm, self.chunk_size.max(needed))?;

        let Some(offset) = chunk.try_alloc(size, alignment) else {
            // SAFETY: the chunk was never linked in; release it here.
            unsafe { self.mm.free(chunk.start) };
            return Err(MemError::OutOfMemory { requested: size });
        };

        self.chunks.push(chunk);
        self.current = self.chunks.len() - 1;
        Ok(self.commit(self.current, offset, size))
    }

    #[inline(always)]
    fn commit(&mut self, chunk: usize, offset: usize, size: usize) -> (usize, usize) {
        self.total_allocated += size;
        #[cfg(feature = "trace-alloc")]
        trace!("region alloc {size} bytes in chunk {chunk} at offset {offset}");
        (chunk, offset)
    }

    /// Moves `value` into the region.
    ///
    /// The region never runs destructors; values needing `Drop` are leaked
    /// when the region goes away.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`].
    pub fn alloc<T>(&mut self, value: T) -> Result<NonNull<T>> {
        let ptr = self
            .allocate(size_of::<T>(), align_of::<T>())?
            .cast::<T>();
        // SAFETY: ptr is freshly allocated, sized and aligned for T.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    /// Copies `bytes` into the region and returns a handle to the copy.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`].
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<RegionSlice> {
        let (chunk, offset) = self.bump(bytes.len(), 1)?;
        // SAFETY: the destination was just reserved for bytes.len() bytes
        // and cannot overlap caller memory.
        unsafe {
            let dst = self.chunks[chunk].start.add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Ok(RegionSlice {
            region: self.id,
            generation: self.generation,
            chunk: chunk as u32,
            offset,
            len: bytes.len(),
        })
    }

    /// Resolves a handle issued by this region.
    ///
    /// # Errors
    ///
    /// - [`MemError::StaleHandle`] if the region was reset since
    /// - [`MemError::InvalidArgument`] if the handle does not describe
    ///   memory in this region
    pub fn get(&self, slice: RegionSlice) -> Result<&[u8]> {
        if slice.region != self.id {
            return Err(MemError::InvalidArgument {
                what: "region handle does not belong to this region",
            });
        }
        if slice.generation != self.generation {
            return Err(MemError::StaleHandle {
                handle_generation: slice.generation,
                current: self.generation,
            });
        }
        let chunk = &self.chunks[slice.chunk as usize];
        debug_assert!(slice.offset + slice.len <= chunk.offset);
        // SAFETY: handles are only minted by alloc_bytes on this region,
        // and the generation check guarantees the range has not been
        // rewound since it was initialized.
        Ok(unsafe {
            std::slice::from_raw_parts(chunk.start.add(slice.offset).as_ptr(), slice.len)
        })
    }

    /// Invalidates every allocation while keeping the chunks for reuse.
    ///
    /// Raw pointers obtained before the reset must not be used afterwards;
    /// [`RegionSlice`] handles are checked and rejected. Debug builds
    /// overwrite the rewound bytes to make stale raw pointer reads obvious.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            if cfg!(debug_assertions) {
                // SAFETY: offset bytes from start are inside the chunk.
                unsafe { std::ptr::write_bytes(chunk.start.as_ptr(), RESET_POISON, chunk.offset) };
            }
            chunk.offset = 0;
        }
        self.current = 0;
        self.total_allocated = 0;
        self.generation = self
            .generation
            .checked_add(1)
            .expect("region generation counter exhausted");
        trace!(
            "region reset to generation {} keeping {} chunks",
            self.generation,
            self.chunks.len()
        );
    }

    /// Jumps the generation counter, as if `generation` resets had happened.
    #[cfg(test)]
    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Returns every chunk to the memory manager.
    pub fn destroy(self) {
        drop(self);
    }

    /// Process-unique identifier of this region.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current generation; starts at 0 and increments on every reset.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes still free in the current chunk.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.chunks.get(self.current).map_or(0, Chunk::remaining)
    }

    /// Returns allocation statistics for this region.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total_allocated: self.total_allocated,
            chunk_count: self.chunks.len(),
            total_capacity: self.chunks.iter().map(|c| c.capacity).sum(),
        }
    }

    /// The memory manager chunks come from.
    #[must_use]
    pub fn manager(&self) -> &MemoryManager {
        &self.mm
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            // SAFETY: every chunk was allocated from self.mm and is freed
            // exactly once here.
            unsafe { self.mm.free(chunk.start) };
        }
    }
}
