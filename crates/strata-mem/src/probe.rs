//! Open-addressing machinery shared by [`StringTable`] and [`AssocArray`].
//!
//! Bucket arrays have power-of-two capacity and are probed with triangular
//! offsets (`h, h+1, h+3, h+6, ...`, i.e. `h + i(i+1)/2 mod 2^k`). For a
//! power-of-two modulus this sequence visits every slot exactly once in
//! the first `capacity` steps, so a probe terminates on any table with at
//! least one empty slot.
//!
//! Tables grow when live entries plus tombstones would exceed 3/4 of the
//! capacity.
//!
//! [`StringTable`]: crate::string_table::StringTable
//! [`AssocArray`]: crate::assoc::AssocArray

/// State of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot<P> {
    Empty,
    Occupied(P),
    /// Tombstone left by a removal; keeps probe chains intact.
    Deleted,
}

/// Smallest bucket array a table will allocate.
pub(crate) const MIN_BUCKETS: usize = 4;

/// Rounds a requested capacity up to a usable bucket count.
pub(crate) fn bucket_capacity(requested: usize) -> usize {
    requested.max(MIN_BUCKETS).next_power_of_two()
}

/// Whether `used` slots (live + tombstones) exceed the 3/4 load bound.
#[inline]
pub(crate) fn over_load(used: usize, capacity: usize) -> bool {
    used.saturating_mul(4) > capacity.saturating_mul(3)
}

/// Triangular probe sequence over a power-of-two table.
pub(crate) struct ProbeSeq {
    pos: usize,
    stride: usize,
    mask: usize,
    remaining: usize,
}

impl ProbeSeq {
    pub(crate) fn new(hash: u64, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mask = capacity - 1;
        ProbeSeq {
            pos: hash as usize & mask,
            stride: 0,
            mask,
            remaining: capacity,
        }
    }
}

impl Iterator for ProbeSeq {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let pos = self.pos;
        self.stride += 1;
        self.pos = (self.pos + self.stride) & self.mask;
        Some(pos)
    }
}

/// Outcome of probing for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Slot holding a matching entry.
    Found(usize),
    /// Key absent; slot where it should be inserted (first tombstone on
    /// the chain, else the terminating empty slot).
    Vacant(usize),
    /// Key absent and no slot is free. Cannot happen under the load bound.
    Exhausted,
}

/// Walks the probe chain for `hash`, testing occupied slots with `matches`.
pub(crate) fn probe<P: Copy>(
    slots: &[Slot<P>],
    hash: u64,
    mut matches: impl FnMut(P) -> bool,
) -> Probe {
    let mut first_deleted = None;
    for idx in ProbeSeq::new(hash, slots.len()) {
        match slots[idx] {
            Slot::Empty => return Probe::Vacant(first_deleted.unwrap_or(idx)),
            Slot::Deleted => {
                first_deleted.get_or_insert(idx);
            }
            Slot::Occupied(entry) => {
                if matches(entry) {
                    return Probe::Found(idx);
                }
            }
        }
    }
    first_deleted.map_or(Probe::Exhausted, Probe::Vacant)
}

/// First empty slot on the chain for `hash`; used when rehashing into a
/// fresh array, which has no tombstones and no duplicate keys.
pub(crate) fn vacant_slot<P: Copy>(slots: &[Slot<P>], hash: u64) -> Option<usize> {
    ProbeSeq::new(hash, slots.len()).find(|&idx| matches!(slots[idx], Slot::Empty))
}
