//! String interning table.
//!
//! A [`StringTable`] maps byte strings to a small `Copy` value and
//! guarantees at most one stored copy per distinct content, so handle
//! equality substitutes for content comparison.
//!
//! # Design
//!
//! - **Entries** are a fixed header (`hash`, `len`, `value`) followed inline
//!   by the bytes, allocated from the table's own region. They never move
//!   and are reclaimed together when the table is cleared or dropped.
//! - **Buckets** are an open-addressed array of entry pointers allocated
//!   through the [`MemoryManager`]. Growth allocates a new array, reinserts
//!   by the stored hash, and releases the old array; entries are untouched.
//! - **Handles** ([`StringRef`]) carry the table's region id and generation,
//!   so a handle from another table or from before [`StringTable::clear`]
//!   resolves to `None` instead of reading recycled memory.
//!
//! # Examples
//!
//! ```
//! use strata_mem::StringTable;
//!
//! let mut table = StringTable::create(4).unwrap();
//!
//! let (foo, inserted) = table.insert(b"foo", 1u32).unwrap();
//! assert!(inserted);
//!
//! // Interning is insert-if-absent: the stored value is kept.
//! let (again, inserted) = table.insert(b"foo", 2).unwrap();
//! assert!(!inserted);
//! assert_eq!(foo, again);
//! assert_eq!(table.get(b"foo"), Some(1));
//!
//! // Updates go through the handle.
//! table.set_value(foo, 3);
//! assert_eq!(table.get(b"foo"), Some(3));
//! ```

use std::marker::PhantomData;
use std::ptr::NonNull;

use strata_log::{debug, trace};

use crate::arena::{ArenaStats, DEFAULT_CHUNK_SIZE, RegionAllocator};
use crate::error::{MemError, Result};
use crate::hash::{BytesHasher, hash_bytes};
use crate::memory::{ManagedArray, MemoryManager, grow_capacity};
use crate::probe::{Slot, bucket_capacity, over_load, probe, vacant_slot, Probe};

/// Entry header; `len` bytes of content follow it in the region.
#[repr(C)]
struct EntryHeader<V> {
    hash: u64,
    len: usize,
    value: V,
}

type Bucket<V> = Slot<NonNull<EntryHeader<V>>>;

/// Handle to an interned entry.
///
/// Two handles from the same table are equal exactly when their contents
/// are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringRef {
    table: u64,
    generation: u64,
    entry: NonNull<u8>,
}

/// Open-addressed interning table over region-allocated entries.
pub struct StringTable<V: Copy = ()> {
    region: RegionAllocator,
    buckets: ManagedArray<Bucket<V>>,
    len: usize,
    hasher: BytesHasher,
    mm: MemoryManager,
}

impl<V: Copy> StringTable<V> {
    const HEADER_SIZE: usize = size_of::<EntryHeader<V>>();

    /// Creates a table using the process-wide memory manager.
    ///
    /// # Errors
    ///
    /// - [`MemError::InvalidArgument`] if `initial_capacity` is zero
    /// - [`MemError::OutOfMemory`]
    pub fn create(initial_capacity: usize) -> Result<Self> {
        Self::with_manager(MemoryManager::from_process(), initial_capacity)
    }

    /// Creates a table allocating from `mm`.
    ///
    /// # Errors
    ///
    /// As for [`create`](Self::create).
    pub fn with_manager(mm: MemoryManager, initial_capacity: usize) -> Result<Self> {
        Self::with_hasher(mm, initial_capacity, hash_bytes)
    }

    /// Creates a table with a custom hash function.
    ///
    /// # Errors
    ///
    /// As for [`create`](Self::create).
    pub fn with_hasher(
        mm: MemoryManager,
        initial_capacity: usize,
        hasher: BytesHasher,
    ) -> Result<Self> {
        if initial_capacity == 0 {
            return Err(MemError::InvalidArgument {
                what: "string table capacity must be non-zero",
            });
        }
        let region = RegionAllocator::create(mm.clone(), DEFAULT_CHUNK_SIZE)?;
        let buckets = ManagedArray::new(&mm, bucket_capacity(initial_capacity), Slot::Empty)?;
        Ok(StringTable {
            region,
            buckets,
            len: 0,
            hasher,
            mm,
        })
    }

    /// Number of interned entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Statistics of the region holding the entries.
    #[must_use]
    pub fn region_stats(&self) -> ArenaStats {
        self.region.stats()
    }

    /// Inserts `bytes` with `value` unless the content is already present.
    ///
    /// Returns the entry's handle and whether it was newly inserted. An
    /// existing entry keeps its value.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if the bucket array cannot grow or the
    /// entry cannot be allocated. The table is unchanged.
    pub fn insert(&mut self, bytes: &[u8], value: V) -> Result<(StringRef, bool)> {
        let hash = (self.hasher)(bytes);
        if let Some(entry) = self.find(bytes, hash) {
            return Ok((self.make_ref(entry), false));
        }

        if over_load(self.len + 1, self.capacity()) {
            self.grow()?;
        }
        let slot = loop {
            match vacant_slot(self.buckets.as_slice(), hash) {
                Some(slot) => break slot,
                None => self.grow()?,
            }
        };

        let entry = self.alloc_entry(bytes, hash, value)?;
        self.buckets[slot] = Slot::Occupied(entry);
        self.len += 1;
        #[cfg(feature = "trace-alloc")]
        trace!("interned {} bytes into slot {slot}", bytes.len());
        Ok((self.make_ref(entry), true))
    }

    /// Interns a string with the default value.
    ///
    /// # Errors
    ///
    /// As for [`insert`](Self::insert).
    pub fn intern(&mut self, s: &str) -> Result<StringRef>
    where
        V: Default,
    {
        self.insert(s.as_bytes(), V::default()).map(|(r, _)| r)
    }

    /// Finds the entry for `bytes`.
    #[must_use]
    pub fn lookup(&self, bytes: &[u8]) -> Option<StringRef> {
        let hash = (self.hasher)(bytes);
        self.find(bytes, hash).map(|entry| self.make_ref(entry))
    }

    /// Value stored for `bytes`.
    #[must_use]
    pub fn get(&self, bytes: &[u8]) -> Option<V> {
        let hash = (self.hasher)(bytes);
        // SAFETY: entries in the bucket array are live.
        self.find(bytes, hash)
            .map(|entry| unsafe { entry.as_ref().value })
    }

    /// Whether `bytes` has been interned.
    #[must_use]
    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.lookup(bytes).is_some()
    }

    /// Value behind a handle, or `None` if the handle is not valid for
    /// this table.
    #[must_use]
    pub fn value(&self, r: StringRef) -> Option<V> {
        // SAFETY: resolve only returns entries live in this generation.
        self.resolve(r).map(|entry| unsafe { entry.as_ref().value })
    }

    /// Replaces the value behind a handle. Returns false if the handle is
    /// not valid for this table.
    pub fn set_value(&mut self, r: StringRef, value: V) -> bool {
        match self.resolve(r) {
            Some(mut entry) => {
                // SAFETY: the entry is live and &mut self excludes any
                // outstanding borrow of table contents.
                unsafe { entry.as_mut().value = value };
                true
            }
            None => false,
        }
    }

    /// Content behind a handle.
    #[must_use]
    pub fn bytes(&self, r: StringRef) -> Option<&[u8]> {
        // SAFETY: resolve only returns entries live in this generation.
        self.resolve(r).map(|entry| unsafe { Self::entry_bytes(entry) })
    }

    /// Content behind a handle as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self, r: StringRef) -> Option<&str> {
        self.bytes(r).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Iterates over all entries in bucket order.
    ///
    /// The order is stable while the table is not modified.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            slots: self.buckets.iter(),
            table: self.region.id(),
            generation: self.region.generation(),
            _marker: PhantomData,
        }
    }

    /// Calls `visitor` for every entry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(StringRef, &[u8], V),
    {
        for (r, bytes, value) in self.iter() {
            visitor(r, bytes, value);
        }
    }

    /// Drops every entry, keeping the bucket array and region pages.
    ///
    /// Handles issued before the call stop resolving.
    pub fn clear(&mut self) {
        self.region.reset();
        self.buckets.fill(Slot::Empty);
        self.len = 0;
        trace!("string table cleared ({} buckets kept)", self.capacity());
    }

    /// Releases the region and bucket array.
    pub fn destroy(self) {
        drop(self);
    }

    fn find(&self, bytes: &[u8], hash: u64) -> Option<NonNull<EntryHeader<V>>> {
        let found = probe(self.buckets.as_slice(), hash, |entry| {
            // SAFETY: occupied buckets point at live entries.
            let header = unsafe { entry.as_ref() };
            header.hash == hash
                && header.len == bytes.len()
                && unsafe { Self::entry_bytes(entry) } == bytes
        });
        match found {
            Probe::Found(slot) => match self.buckets[slot] {
                Slot::Occupied(entry) => Some(entry),
                Slot::Empty | Slot::Deleted => None,
            },
            Probe::Vacant(_) | Probe::Exhausted => None,
        }
    }

    fn alloc_entry(&mut self, bytes: &[u8], hash: u64, value: V) -> Result<NonNull<EntryHeader<V>>> {
        let size = Self::HEADER_SIZE
            .checked_add(bytes.len())
            .ok_or(MemError::OutOfMemory { requested: usize::MAX })?;
        let raw = self.region.allocate(size, align_of::<EntryHeader<V>>())?;
        let entry = raw.cast::<EntryHeader<V>>();

        // SAFETY: raw is aligned for the header and sized for header plus
        // content; the content starts right after the header.
        unsafe {
            entry.write(EntryHeader {
                hash,
                len: bytes.len(),
                value,
            });
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                raw.add(Self::HEADER_SIZE).as_ptr(),
                bytes.len(),
            );
        }
        Ok(entry)
    }

    /// Doubles the bucket array and reinserts every entry.
    #[cold]
    fn grow(&mut self) -> Result<()> {
        let capacity = self.capacity();
        let new_capacity = grow_capacity(capacity, capacity + 1);
        let mut buckets = ManagedArray::new(&self.mm, new_capacity, Slot::Empty)?;

        for &slot in self.buckets.iter() {
            if let Slot::Occupied(entry) = slot {
                // SAFETY: occupied buckets point at live entries.
                let hash = unsafe { entry.as_ref().hash };
                let idx = vacant_slot(buckets.as_slice(), hash)
                    .expect("grown bucket array has free slots");
                buckets[idx] = slot;
            }
        }

        debug!(
            "string table grew {capacity} -> {new_capacity} buckets ({} entries)",
            self.len
        );
        self.buckets = buckets;
        Ok(())
    }

    fn make_ref(&self, entry: NonNull<EntryHeader<V>>) -> StringRef {
        StringRef {
            table: self.region.id(),
            generation: self.region.generation(),
            entry: entry.cast(),
        }
    }

    fn resolve(&self, r: StringRef) -> Option<NonNull<EntryHeader<V>>> {
        (r.table == self.region.id() && r.generation == self.region.generation())
            .then(|| r.entry.cast())
    }

    /// # Safety
    ///
    /// `entry` must be a live entry of this table; the returned slice must
    /// not outlive the current generation.
    unsafe fn entry_bytes<'a>(entry: NonNull<EntryHeader<V>>) -> &'a [u8] {
        // SAFETY: forwarded caller contract; len bytes follow the header.
        unsafe {
            let len = entry.as_ref().len;
            let data = entry.cast::<u8>().add(Self::HEADER_SIZE);
            std::slice::from_raw_parts(data.as_ptr(), len)
        }
    }
}

impl<V: Copy> std::fmt::Debug for StringTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringTable")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("generation", &self.region.generation())
            .finish()
    }
}

/// Iterator over a [`StringTable`], yielding `(handle, bytes, value)`.
pub struct Iter<'a, V: Copy> {
    slots: std::slice::Iter<'a, Bucket<V>>,
    table: u64,
    generation: u64,
    _marker: PhantomData<&'a StringTable<V>>,
}

impl<'a, V: Copy> Iterator for Iter<'a, V> {
    type Item = (StringRef, &'a [u8], V);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if let Slot::Occupied(entry) = *slot {
                let r = StringRef {
                    table: self.table,
                    generation: self.generation,
                    entry: entry.cast(),
                };
                // SAFETY: the iterator borrows the table, so the entry
                // stays live for 'a.
                let (bytes, value) = unsafe {
                    (StringTable::<V>::entry_bytes(entry), entry.as_ref().value)
                };
                return Some((r, bytes, value));
            }
        }
        None
    }
}

impl<'a, V: Copy> IntoIterator for &'a StringTable<V> {
    type Item = (StringRef, &'a [u8], V);
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use hashbrown::HashSet;

    fn tracked() -> MemoryManager {
        MemoryManager::new(MemoryConfig::tracked())
    }

    fn table(cap: usize) -> StringTable<u32> {
        StringTable::with_manager(tracked(), cap).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            StringTable::<u32>::with_manager(tracked(), 0),
            Err(MemError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_insert_if_absent() {
        let mut t = table(8);
        let (a, new_a) = t.insert(b"ident", 1).unwrap();
        let (b, new_b) = t.insert(b"ident", 2).unwrap();

        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);
        assert_eq!(t.value(a), Some(1));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_empty_string_round_trip() {
        let mut t = table(4);
        let (r, _) = t.insert(b"", 7).unwrap();
        assert_eq!(t.get(b""), Some(7));
        assert_eq!(t.bytes(r), Some(&b""[..]));
        assert_eq!(t.lookup(b""), Some(r));
    }

    #[test]
    fn test_lookup_miss() {
        let mut t = table(4);
        t.insert(b"present", 1).unwrap();
        assert_eq!(t.lookup(b"absent"), None);
        assert_eq!(t.get(b"absent"), None);
        assert!(!t.contains(b"absent"));
    }

    #[test]
    fn test_growth_keeps_entries_in_place() {
        let mut t = table(4);
        let (first, _) = t.insert(b"first", 0).unwrap();
        let before = t.bytes(first).unwrap().as_ptr();

        for i in 1..500u32 {
            t.insert(format!("name_{i}").as_bytes(), i).unwrap();
        }
        assert!(t.capacity() >= 512);
        assert_eq!(t.bytes(first).unwrap().as_ptr(), before);
        assert_eq!(t.get(b"first"), Some(0));
        for i in 1..500u32 {
            assert_eq!(t.get(format!("name_{i}").as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_load_factor_after_growth() {
        let mut t = table(4);
        for i in 0..1000u32 {
            t.insert(&i.to_le_bytes(), i).unwrap();
            assert!(t.len() * 4 <= t.capacity() * 3);
        }
    }

    #[test]
    fn test_full_collisions() {
        let mut t: StringTable<u32> = StringTable::with_hasher(tracked(), 4, |_| 42).unwrap();
        for i in 0..64u32 {
            let (_, inserted) = t.insert(format!("c{i}").as_bytes(), i).unwrap();
            assert!(inserted);
        }
        for i in 0..64u32 {
            assert_eq!(t.get(format!("c{i}").as_bytes()), Some(i));
        }
        assert_eq!(t.len(), 64);
    }

    #[test]
    fn test_set_value_through_handle() {
        let mut t = table(4);
        let (r, _) = t.insert(b"x", 1).unwrap();
        assert!(t.set_value(r, 10));
        assert_eq!(t.get(b"x"), Some(10));
    }

    #[test]
    fn test_handles_do_not_cross_tables() {
        let mut a = table(4);
        let mut b = table(4);
        let (ra, _) = a.insert(b"shared", 1).unwrap();
        b.insert(b"shared", 2).unwrap();

        assert_eq!(b.value(ra), None);
        assert!(!b.set_value(ra, 5));
        assert_eq!(b.get(b"shared"), Some(2));
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut t = table(4);
        let (old, _) = t.insert(b"old", 1).unwrap();
        let capacity = t.capacity();

        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.capacity(), capacity);
        assert_eq!(t.bytes(old), None);
        assert_eq!(t.lookup(b"old"), None);

        let (new, inserted) = t.insert(b"old", 2).unwrap();
        assert!(inserted);
        assert_ne!(old, new);
        assert_eq!(t.value(new), Some(2));
    }

    #[test]
    fn test_clear_past_u32_generations_keeps_old_handles_dead() {
        let mut t = table(4);
        let (old, _) = t.insert(b"x", 1).unwrap();

        t.region.set_generation(u64::from(u32::MAX));
        t.clear();
        t.insert(b"x", 2).unwrap();

        assert_eq!(t.bytes(old), None);
        assert_eq!(t.value(old), None);
        assert!(!t.set_value(old, 3));
        assert_eq!(t.get(b"x"), Some(2));
    }

    #[test]
    fn test_iteration_is_restartable() {
        let mut t = table(4);
        for (i, w) in ["let", "fn", "match", "while"].iter().enumerate() {
            t.insert(w.as_bytes(), i as u32).unwrap();
        }
        let first: Vec<_> = t.iter().map(|(r, _, _)| r).collect();
        let second: Vec<_> = t.iter().map(|(r, _, _)| r).collect();
        assert_eq!(first, second);

        let mut words = HashSet::new();
        t.for_each(|_, bytes, _| {
            words.insert(bytes.to_vec());
        });
        assert_eq!(words.len(), 4);
        assert!(words.contains(&b"match".to_vec()));
    }

    #[test]
    fn test_intern_and_as_str() {
        let mut t: StringTable = StringTable::with_manager(tracked(), 4).unwrap();
        let a = t.intern("变量").unwrap();
        assert_eq!(t.intern("变量").unwrap(), a);
        assert_eq!(t.as_str(a), Some("变量"));

        let (raw, _) = t.insert(&[0xFF, 0xFE], ()).unwrap();
        assert_eq!(t.as_str(raw), None);
        assert_eq!(t.bytes(raw), Some(&[0xFF, 0xFE][..]));
    }

    #[test]
    fn test_oom_leaves_table_consistent() {
        let mm = MemoryManager::new(MemoryConfig::tracked().with_byte_limit(16 * 1024));
        let mut t: StringTable<u32> = StringTable::with_manager(mm, 4).unwrap();

        let mut inserted = 0u32;
        let err = loop {
            match t.insert(format!("identifier_{inserted:06}").as_bytes(), inserted) {
                Ok(_) => inserted += 1,
                Err(err) => break err,
            }
        };
        assert!(err.is_fatal());
        assert_eq!(t.len(), inserted as usize);
        for i in 0..inserted {
            assert_eq!(t.get(format!("identifier_{i:06}").as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_drop_releases_everything() {
        let mm = tracked();
        {
            let mut t: StringTable<u32> = StringTable::with_manager(mm.clone(), 4).unwrap();
            for i in 0..100u32 {
                t.insert(&i.to_be_bytes(), i).unwrap();
            }
            assert!(mm.stats().live_blocks >= 2);
        }
        assert_eq!(mm.stats().live_blocks, 0);
    }
}
