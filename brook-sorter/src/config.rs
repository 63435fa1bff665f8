use anyhow::{bail, Result};
use log::error;
use std::path::PathBuf;

use brook_core::error_bail;

/// Capacity of the facade's input and output event queues.
pub const INPUT_QUEUE_SIZE: usize = 128_000;
pub const OUTPUT_QUEUE_SIZE: usize = 128_000;

/// Capacity of each heap sorter's input queue.
pub const HEAP_INPUT_QUEUE_SIZE: usize = 1024 * 1024;

/// Capacity of the flush task queue shared by all heap sorters.
pub const FLUSH_TASK_QUEUE_SIZE: usize = 4096;

/// Buffer size for spill-file reads and writes.
pub const FILE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Number of slots in the backend pool's file free-list. A tuning knob, not a
/// correctness parameter: overflow drops a backend instead of parking it.
pub const BACKEND_CACHE_SIZE: usize = 256;

/// Configuration of one `UnifiedSorter`.
#[derive(Debug, Clone)]
pub struct SorterConfig {
    /// Heap sorter fan-out.
    pub num_concurrent_worker: usize,

    /// Soft upper bound on one spill file's size. Exceeding it is logged,
    /// not rejected.
    pub chunk_size_limit: u64,

    /// Process RSS percentage above which memory backends are refused.
    pub max_memory_pressure: u8,

    /// Cap on the memory-backend accounted bytes. Zero forces every run to a
    /// file backend.
    pub max_memory_consumption: i64,

    /// Per-heap byte estimate that triggers a flush.
    pub heap_size_limit: i64,

    /// Spill-file directory. Must exist and be writable.
    pub sorter_dir: PathBuf,
}

impl SorterConfig {
    pub fn new(sorter_dir: impl Into<PathBuf>) -> Self {
        Self {
            num_concurrent_worker: 16,
            chunk_size_limit: 1024 * 1024 * 1024,
            max_memory_pressure: 60,
            max_memory_consumption: 16 * 1024 * 1024 * 1024,
            heap_size_limit: 4 * 1024 * 1024,
            sorter_dir: sorter_dir.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_concurrent_worker == 0 {
            error_bail!("num_concurrent_worker must be positive");
        }

        if self.heap_size_limit <= 0 {
            error_bail!(
                "heap_size_limit must be positive, got: {}",
                self.heap_size_limit
            );
        }

        if self.max_memory_pressure > 100 {
            error_bail!(
                "max_memory_pressure is a percentage, got: {}",
                self.max_memory_pressure
            );
        }

        if self.sorter_dir.as_os_str().is_empty() {
            error_bail!("sorter_dir is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SorterConfig::new("/tmp/sorter");
        assert_eq!(config.num_concurrent_worker, 16);
        assert_eq!(config.heap_size_limit, 4 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SorterConfig::new("/tmp/sorter");
        config.num_concurrent_worker = 0;
        assert!(config.validate().is_err());

        let mut config = SorterConfig::new("/tmp/sorter");
        config.max_memory_pressure = 101;
        assert!(config.validate().is_err());

        let config = SorterConfig::new("");
        assert!(config.validate().is_err());
    }
}
