//! Generic open-addressed associative array.
//!
//! [`AssocArray`] stores arbitrary keys and values. Key hashing and
//! equality are not taken from the key type but from a [`KeyOps`]
//! capability value supplied at construction, so the same key type can be
//! compared by content, by address, or by any caller-defined rule.
//!
//! Unlike [`StringTable`](crate::string_table::StringTable) entries, nodes
//! here are allocated and freed one at a time through the
//! [`MemoryManager`]: keys and values may die before the table and can be
//! removed. Removal leaves a tombstone; tombstones are purged when the
//! table is rebuilt.
//!
//! # Examples
//!
//! ```
//! use strata_mem::AssocArray;
//!
//! let mut scopes = AssocArray::new(8).unwrap();
//! scopes.set("x", 1).unwrap();
//! scopes.set("y", 2).unwrap();
//! assert_eq!(scopes.set("x", 10).unwrap(), Some(1));
//!
//! assert_eq!(scopes.get(&"x"), Some(&10));
//! assert!(scopes.delete(&"y"));
//! assert_eq!(scopes.get(&"y"), None);
//! assert_eq!(scopes.len(), 1);
//! ```

use std::hash::Hash;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use strata_log::debug;

use crate::error::{MemError, Result};
use crate::hash::hash_value;
use crate::memory::{ManagedArray, MemoryManager, grow_capacity};
use crate::probe::{Probe, Slot, bucket_capacity, over_load, probe, vacant_slot};

/// Hash and equality for keys of type `K`.
///
/// Implementations must be consistent: keys that compare equal must hash
/// equally.
pub trait KeyOps<K> {
    /// Hashes a key.
    fn hash(&self, key: &K) -> u64;

    /// Compares two keys.
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// Compares keys by content through their `Hash` and `Eq` impls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentOps;

impl<K: Hash + Eq> KeyOps<K> for ContentOps {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        hash_value(key)
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Compares reference keys by address.
///
/// Two distinct allocations with equal content are different keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOps;

impl<T: ?Sized> KeyOps<&T> for IdentityOps {
    fn hash(&self, key: &&T) -> u64 {
        hash_value(&std::ptr::from_ref::<T>(*key).cast::<()>().addr())
    }

    fn eq(&self, a: &&T, b: &&T) -> bool {
        std::ptr::addr_eq(*a, *b)
    }
}

impl<T: ?Sized> KeyOps<Rc<T>> for IdentityOps {
    fn hash(&self, key: &Rc<T>) -> u64 {
        hash_value(&Rc::as_ptr(key).cast::<()>().addr())
    }

    fn eq(&self, a: &Rc<T>, b: &Rc<T>) -> bool {
        Rc::ptr_eq(a, b)
    }
}

/// Key operations built from an equality closure and a hash closure.
#[derive(Clone, Copy)]
pub struct FnOps<E, H> {
    eq: E,
    hash: H,
}

impl<E, H> FnOps<E, H> {
    /// Pairs an equality function with a hash function.
    pub const fn new(eq: E, hash: H) -> Self {
        Self { eq, hash }
    }
}

impl<K, E, H> KeyOps<K> for FnOps<E, H>
where
    E: Fn(&K, &K) -> bool,
    H: Fn(&K) -> u64,
{
    fn hash(&self, key: &K) -> u64 {
        (self.hash)(key)
    }

    fn eq(&self, a: &K, b: &K) -> bool {
        (self.eq)(a, b)
    }
}

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
}

type Bucket<K, V> = Slot<NonNull<Node<K, V>>>;

/// Open-addressed hash table with externally supplied key operations.
pub struct AssocArray<K, V, O = ContentOps> {
    buckets: ManagedArray<Bucket<K, V>>,
    len: usize,
    tombstones: usize,
    ops: O,
    mm: MemoryManager,
    _owns: PhantomData<Node<K, V>>,
}

impl<K: Hash + Eq, V> AssocArray<K, V, ContentOps> {
    /// Creates a content-keyed table on the process-wide memory manager.
    ///
    /// # Errors
    ///
    /// - [`MemError::InvalidArgument`] if `initial_capacity` is zero
    /// - [`MemError::OutOfMemory`]
    pub fn new(initial_capacity: usize) -> Result<Self> {
        Self::with_ops(MemoryManager::from_process(), initial_capacity, ContentOps)
    }
}

impl<K, V> AssocArray<K, V, IdentityOps>
where
    IdentityOps: KeyOps<K>,
{
    /// Creates a table keyed by reference identity.
    ///
    /// # Errors
    ///
    /// As for [`AssocArray::new`].
    pub fn by_identity(initial_capacity: usize) -> Result<Self> {
        Self::with_ops(MemoryManager::from_process(), initial_capacity, IdentityOps)
    }
}

impl<K, V, E, H> AssocArray<K, V, FnOps<E, H>>
where
    E: Fn(&K, &K) -> bool,
    H: Fn(&K) -> u64,
{
    /// Creates a table from an equality and a hash function.
    ///
    /// ```
    /// use strata_mem::AssocArray;
    /// use strata_mem::hash::hash_bytes;
    ///
    /// let mut t = AssocArray::create(
    ///     4,
    ///     |a: &String, b: &String| a.eq_ignore_ascii_case(b),
    ///     |k: &String| hash_bytes(k.to_ascii_lowercase().as_bytes()),
    /// )
    /// .unwrap();
    /// t.set("Main".to_string(), 1).unwrap();
    /// assert_eq!(t.get(&"MAIN".to_string()), Some(&1));
    /// ```
    ///
    /// # Errors
    ///
    /// As for [`AssocArray::new`].
    pub fn create(initial_capacity: usize, key_eq: E, key_hash: H) -> Result<Self> {
        Self::with_ops(
            MemoryManager::from_process(),
            initial_capacity,
            FnOps::new(key_eq, key_hash),
        )
    }
}

impl<K, V, O: KeyOps<K>> AssocArray<K, V, O> {
    /// Creates a table with explicit memory manager and key operations.
    ///
    /// # Errors
    ///
    /// As for [`AssocArray::new`].
    pub fn with_ops(mm: MemoryManager, initial_capacity: usize, ops: O) -> Result<Self> {
        if initial_capacity == 0 {
            return Err(MemError::InvalidArgument {
                what: "assoc array capacity must be non-zero",
            });
        }
        let buckets = ManagedArray::new(&mm, bucket_capacity(initial_capacity), Slot::Empty)?;
        Ok(AssocArray {
            buckets,
            len: 0,
            tombstones: 0,
            ops,
            mm,
            _owns: PhantomData,
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn probe_key(&self, key: &K, hash: u64) -> Probe {
        probe(self.buckets.as_slice(), hash, |node| {
            // SAFETY: occupied buckets point at live nodes.
            let node = unsafe { node.as_ref() };
            node.hash == hash && self.ops.eq(&node.key, key)
        })
    }

    fn find(&self, key: &K) -> Option<NonNull<Node<K, V>>> {
        match self.probe_key(key, self.ops.hash(key)) {
            Probe::Found(slot) => match self.buckets[slot] {
                Slot::Occupied(node) => Some(node),
                Slot::Empty | Slot::Deleted => None,
            },
            Probe::Vacant(_) | Probe::Exhausted => None,
        }
    }

    /// Value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: the node is live while &self is borrowed.
        self.find(key).map(|node| unsafe { &(*node.as_ptr()).value })
    }

    /// Mutable value for `key`.
    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        // SAFETY: the node is live and &mut self makes the borrow unique.
        self.find(key).map(|node| unsafe { &mut (*node.as_ptr()).value })
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or updates. Returns the previous value on update; the
    /// stored key is kept and `key` is dropped.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfMemory`] if the table cannot grow or the node
    /// cannot be allocated. The table is unchanged.
    pub fn set(&mut self, key: K, value: V) -> Result<Option<V>> {
        let hash = self.ops.hash(&key);
        let slot = match self.probe_key(&key, hash) {
            Probe::Found(slot) => return Ok(Some(self.replace_at(slot, value))),
            Probe::Vacant(slot)
                if !over_load(self.len + self.tombstones + 1, self.capacity()) =>
            {
                slot
            }
            Probe::Vacant(_) | Probe::Exhausted => {
                self.rebuild()?;
                // The key is absent and the rebuilt array has no tombstones,
                // so the first empty slot on its chain is where it goes.
                vacant_slot(self.buckets.as_slice(), hash)
                    .expect("rebuilt bucket array has free slots")
            }
        };

        let node = self.mm.allocate_array::<Node<K, V>>(1)?;
        // SAFETY: node is sized and aligned for one Node.
        unsafe { node.write(Node { hash, key, value }) };

        if self.buckets[slot] == Slot::Deleted {
            self.tombstones -= 1;
        }
        self.buckets[slot] = Slot::Occupied(node);
        self.len += 1;
        Ok(None)
    }

    fn replace_at(&mut self, slot: usize, value: V) -> V {
        match self.buckets[slot] {
            // SAFETY: occupied buckets point at live nodes; &mut self.
            Slot::Occupied(node) => unsafe {
                std::mem::replace(&mut (*node.as_ptr()).value, value)
            },
            Slot::Empty | Slot::Deleted => unreachable!("probe returned a vacant slot as found"),
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.ops.hash(key);
        let Probe::Found(slot) = self.probe_key(key, hash) else {
            return None;
        };
        let Slot::Occupied(node) = self.buckets[slot] else {
            return None;
        };

        self.buckets[slot] = Slot::Deleted;
        self.len -= 1;
        self.tombstones += 1;
        if self.len == 0 {
            self.buckets.fill(Slot::Empty);
            self.tombstones = 0;
        }

        let Node { value, .. } = self.free_node(node);
        Some(value)
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&mut self, key: &K) -> bool {
        self.remove(key).is_some()
    }

    /// Iterates over `(key, value)` pairs in bucket order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.buckets.iter(),
            _marker: PhantomData,
        }
    }

    /// Iterates over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Iterates over values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// Removes every entry, keeping the bucket array.
    pub fn clear(&mut self) {
        for idx in 0..self.buckets.len() {
            if let Slot::Occupied(node) = self.buckets[idx] {
                self.buckets[idx] = Slot::Empty;
                drop(self.free_node(node));
            }
        }
        self.buckets.fill(Slot::Empty);
        self.len = 0;
        self.tombstones = 0;
    }

    /// Drops every entry and releases all memory.
    pub fn destroy(self) {
        drop(self);
    }

    /// Moves the node out of manager memory and frees the block.
    fn free_node(&self, node: NonNull<Node<K, V>>) -> Node<K, V> {
        // SAFETY: node is live and has just been unlinked from the buckets,
        // so it is read and freed exactly once.
        unsafe {
            let owned = node.read();
            self.mm.free_array(node);
            owned
        }
    }

    /// Rehashes into a fresh array, dropping tombstones. Doubles the
    /// capacity when live entries exceed half of it.
    #[cold]
    fn rebuild(&mut self) -> Result<()> {
        let capacity = self.capacity();
        let new_capacity = if (self.len + 1) * 2 > capacity {
            grow_capacity(capacity, capacity + 1)
        } else {
            capacity
        };
        let mut buckets = ManagedArray::new(&self.mm, new_capacity, Slot::Empty)?;

        for &slot in self.buckets.iter() {
            if let Slot::Occupied(node) = slot {
                // SAFETY: occupied buckets point at live nodes.
                let hash = unsafe { node.as_ref().hash };
                let idx = vacant_slot(buckets.as_slice(), hash)
                    .expect("rebuilt bucket array has free slots");
                buckets[idx] = slot;
            }
        }

        debug!(
            "assoc array rebuilt {capacity} -> {new_capacity} buckets ({} live, {} tombstones dropped)",
            self.len, self.tombstones
        );
        self.buckets = buckets;
        self.tombstones = 0;
        Ok(())
    }
}

impl<K, V, O> Drop for AssocArray<K, V, O> {
    fn drop(&mut self) {
        for &slot in self.buckets.iter() {
            if let Slot::Occupied(node) = slot {
                // SAFETY: each live node is dropped and freed exactly once;
                // the bucket array itself is released by ManagedArray.
                unsafe {
                    std::ptr::drop_in_place(node.as_ptr());
                    self.mm.free_array(node);
                }
            }
        }
    }
}

impl<K, V, O> std::fmt::Debug for AssocArray<K, V, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssocArray")
            .field("len", &self.len)
            .field("tombstones", &self.tombstones)
            .field("capacity", &self.buckets.len())
            .finish()
    }
}

/// Iterator over an [`AssocArray`].
pub struct Iter<'a, K, V> {
    slots: std::slice::Iter<'a, Bucket<K, V>>,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if let Slot::Occupied(node) = *slot {
                // SAFETY: the iterator borrows the table for 'a.
                let node = unsafe { &*node.as_ptr() };
                return Some((&node.key, &node.value));
            }
        }
        None
    }
}

impl<'a, K, V, O: KeyOps<K>> IntoIterator for &'a AssocArray<K, V, O> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
