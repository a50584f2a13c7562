//! Shared state of the baseline JIT.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::memory::JitMemoryAllocator;
use super::traits::TraitTables;
use crate::config::JitConfig;

/// Everything a compilation request needs besides the code block itself.
///
/// One context is shared by all threads that compile; it is `Sync`.
pub struct JitContext {
    config: JitConfig,
    trait_tables: Arc<TraitTables>,
    allocator: JitMemoryAllocator,
    num_baseline_compilations: AtomicU64,
}

impl JitContext {
    pub fn new(config: JitConfig, trait_tables: Arc<TraitTables>) -> Self {
        let allocator = JitMemoryAllocator::new(config.chunk_size);
        Self {
            config,
            trait_tables,
            allocator,
            num_baseline_compilations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn trait_tables(&self) -> &TraitTables {
        &self.trait_tables
    }

    pub fn allocator(&self) -> &JitMemoryAllocator {
        &self.allocator
    }

    pub fn num_baseline_compilations(&self) -> u64 {
        self.num_baseline_compilations.load(Ordering::Relaxed)
    }

    pub(super) fn record_baseline_compilation(&self) {
        self.num_baseline_compilations.fetch_add(1, Ordering::Relaxed);
    }
}
