//! Configuration structures for the Silt sorting engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default page size in bytes (1 MiB).
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Configuration for a single external sorter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    /// Size of each record page in bytes. A single record (plus its
    /// 4-byte length word) must fit in one page.
    pub page_size: usize,
    /// Initial capacity of the pointer index, in records.
    pub initial_index_capacity: usize,
    /// Directory for spill run files.
    pub spill_dir: PathBuf,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_index_capacity: 4096,
            spill_dir: PathBuf::from("./data/spill"),
        }
    }
}

impl SorterConfig {
    /// Returns the largest record payload that fits in one page.
    pub fn max_record_len(&self) -> usize {
        self.page_size.saturating_sub(4)
    }
}

/// Configuration for the task memory manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total execution memory budget in bytes, shared by all consumers
    /// registered with the manager.
    pub budget_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl MemoryConfig {
    /// Minimum budget used by `auto_sized` (64 MiB).
    pub const MIN_AUTO_BUDGET: usize = 64 * 1024 * 1024;

    /// Creates a budget sized to 25% of available system RAM.
    ///
    /// Queries the system for available memory and allocates 25% of it
    /// as the execution budget, with a 64 MiB floor so sorting remains
    /// usable on low-memory systems.
    pub fn auto_sized() -> Self {
        use sysinfo::System;

        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let budget_bytes = (available_bytes / 4).max(Self::MIN_AUTO_BUDGET);

        Self { budget_bytes }
    }
}
