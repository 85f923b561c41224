//! Stress tests: adversarial hashing, churn and memory accounting.

use strata_mem::assoc::FnOps;
use strata_mem::{AssocArray, MemoryConfig, MemoryManager, RegionAllocator, StringTable};

fn tracked() -> MemoryManager {
    MemoryManager::new(MemoryConfig::tracked())
}

#[test]
fn test_string_table_constant_hash() {
    let mut table = StringTable::with_hasher(tracked(), 4, |_| 7).unwrap();
    let words: Vec<String> = (0..300).map(|i| format!("w{i}")).collect();

    let refs: Vec<_> = words
        .iter()
        .enumerate()
        .map(|(i, w)| table.insert(w.as_bytes(), i).unwrap().0)
        .collect();

    assert_eq!(table.len(), words.len());
    for (i, w) in words.iter().enumerate() {
        assert_eq!(table.lookup(w.as_bytes()), Some(refs[i]));
        assert_eq!(table.get(w.as_bytes()), Some(i));
    }
    assert!(!table.contains(b"w300"));
}

#[test]
fn test_string_table_prefix_family() {
    let mut table = StringTable::with_manager(tracked(), 4).unwrap();
    let mut s = Vec::new();
    for i in 0..256u32 {
        table.insert(&s, i).unwrap();
        s.push(0);
    }
    assert_eq!(table.len(), 256);
    assert_eq!(table.get(&[]), Some(0));
    assert_eq!(table.get(&[0; 255]), Some(255));
}

#[test]
fn test_assoc_constant_hash_churn() {
    let mut map = AssocArray::with_ops(
        tracked(),
        4,
        FnOps::new(|a: &u32, b: &u32| a == b, |_: &u32| 0u64),
    )
    .unwrap();

    for round in 0..20u32 {
        for i in 0..40 {
            map.set(round * 100 + i, i).unwrap();
        }
        for i in 0..40 {
            assert_eq!(map.remove(&(round * 100 + i)), Some(i));
        }
        assert!(map.is_empty());
    }
    assert!(map.capacity() <= 128);
}

#[test]
fn test_assoc_interleaved_mutation_matches_model() {
    let mm = tracked();
    let mut map = AssocArray::with_ops(mm.clone(), 8, strata_mem::assoc::ContentOps).unwrap();
    let mut model = hashbrown::HashMap::new();

    let mut x = 0x2545_f491_4f6c_dd1du64;
    for _ in 0..20_000 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let key = (x % 512) as u32;
        if x & 0x300 == 0 {
            assert_eq!(map.remove(&key), model.remove(&key));
        } else {
            assert_eq!(map.set(key, x).unwrap(), model.insert(key, x));
        }
        assert_eq!(map.len(), model.len());
    }
    for (k, v) in &model {
        assert_eq!(map.get(k), Some(v));
    }
    assert_eq!(mm.stats().live_blocks, model.len() + 1);
}

#[test]
fn test_region_write_readback_patterns() {
    let mm = tracked();
    let mut region = RegionAllocator::create(mm.clone(), 1024).unwrap();
    let mut blocks = Vec::new();

    for i in 0..2_000usize {
        let size = 1 + (i * 7919) % 300;
        let align = 1 << (i % 5);
        let ptr = region.allocate(size, align).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        // SAFETY: ptr is valid for size bytes until the region is reset.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
        blocks.push((ptr, size, i as u8));
    }

    for &(ptr, size, fill) in &blocks {
        // SAFETY: no reset has happened; each block is still live.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == fill));
    }

    let chunks = region.stats().chunk_count;
    region.reset();
    for i in 0..2_000usize {
        region.allocate(1 + (i * 7919) % 300, 1 << (i % 5)).unwrap();
    }
    assert_eq!(region.stats().chunk_count, chunks);

    drop(region);
    assert_eq!(mm.stats().live_blocks, 0);
}
