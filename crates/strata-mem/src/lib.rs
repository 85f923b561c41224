//! Memory primitives for the Strata runtime.
//!
//! This crate provides the allocation and lookup layer the rest of the
//! runtime builds on:
//!
//! - **[`MemoryManager`]**: the single choke point for heap memory, with a
//!   tracked strategy (statistics, byte budget, double-free detection) and
//!   a raw strategy for release builds
//! - **[`RegionAllocator`]**: chunked bump allocation with bulk reset and
//!   generation-checked [`RegionSlice`] handles
//! - **[`StringTable`]**: interning of byte strings into a region, one
//!   stored copy per distinct content
//! - **[`AssocArray`]**: an open-addressed map with caller-supplied key
//!   hashing and equality
//!
//! Everything here is single-threaded: handles are `!Send`, and a manager
//! is shared between structures by cloning its `Rc`.
//!
//! # Configuration
//!
//! [`MemoryManager::from_process`] reads `STRATA_MEM_STRATEGY` and
//! `STRATA_MEM_LIMIT` once per process; see [`config`].

pub mod arena;
pub mod assoc;
pub mod config;
pub mod error;
pub mod hash;
pub mod memory;
mod probe;
pub mod string_table;

pub use arena::{RegionAllocator, RegionSlice};
pub use assoc::AssocArray;
pub use config::{AllocStrategy, MemoryConfig};
pub use error::{MemError, Result};
pub use memory::MemoryManager;
pub use string_table::{StringRef, StringTable};
