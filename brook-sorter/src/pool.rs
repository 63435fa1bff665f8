use anyhow::Result;
use crossbeam_queue::ArrayQueue;
use log::{debug, error, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

use crate::backend::{FileBackend, MemoryBackend, SorterBackend};
use crate::config::{SorterConfig, BACKEND_CACHE_SIZE};

/// Allocates run backends under a soft memory budget.
///
/// Memory backends are preferred until the accounted estimate reaches
/// `max_memory_consumption` or the process RSS crosses `max_memory_pressure`;
/// after that file backends are handed out, recycled through a bounded
/// free-list so the number of open spill files stays capped.
///
/// The estimate is a coarse admission tool: every allocation charges a fixed
/// `heap_size_limit` regardless of the backing medium, bounding the number of
/// in-flight runs rather than measuring real RAM. A parked file backend keeps
/// its charge; the charge is released when the backend is dropped.
///
/// All pool state is atomics plus the per-slot atomics inside the free-list;
/// there is no pool-wide lock on the alloc/dealloc path.
pub struct BackendPool {
    /// Accounted bytes. Signed: concurrent credit/charge may transiently dip
    /// below zero.
    memory_use_estimate: AtomicI64,

    /// Monotonic suffix for spill-file names.
    file_name_counter: AtomicU64,

    /// Bounded free-list of reset file backends.
    cache: ArrayQueue<FileBackend>,

    /// Spill-file directory.
    dir: PathBuf,

    heap_size_limit: i64,
    max_memory_consumption: i64,
    max_memory_pressure: u8,
    chunk_size_limit: u64,

    pressure: PressureSampler,
}

impl BackendPool {
    pub fn new(config: &SorterConfig) -> Self {
        Self {
            memory_use_estimate: AtomicI64::new(0),
            file_name_counter: AtomicU64::new(0),
            cache: ArrayQueue::new(BACKEND_CACHE_SIZE),
            dir: config.sorter_dir.clone(),
            heap_size_limit: config.heap_size_limit,
            max_memory_consumption: config.max_memory_consumption,
            max_memory_pressure: config.max_memory_pressure,
            chunk_size_limit: config.chunk_size_limit,
            pressure: PressureSampler::new(),
        }
    }

    pub fn alloc(&self) -> Result<SorterBackend> {
        if self.memory_use_estimate.load(Ordering::SeqCst) < self.max_memory_consumption
            && self.pressure.percent() < self.max_memory_pressure
        {
            self.memory_use_estimate
                .fetch_add(self.heap_size_limit, Ordering::SeqCst);
            return Ok(SorterBackend::Memory(MemoryBackend::new()));
        }

        debug!("backend pool: memory budget exhausted, using files to sort");

        if let Some(backend) = self.cache.pop() {
            debug!("backend pool: returning cached file backend");
            return Ok(SorterBackend::File(backend));
        }

        let n = self.file_name_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!("sort-{}", n));
        let backend = FileBackend::create(path, self.chunk_size_limit)?;

        self.memory_use_estimate
            .fetch_add(self.heap_size_limit, Ordering::SeqCst);
        Ok(SorterBackend::File(backend))
    }

    pub fn dealloc(&self, mut backend: SorterBackend) -> Result<()> {
        if let Err(e) = backend.reset() {
            // A backend that cannot be reset is leaked.
            error!("backend reset failed, leaking backend, error: {}", e);
            return Err(e);
        }

        match backend {
            SorterBackend::Memory(_) => {
                self.memory_use_estimate
                    .fetch_sub(self.heap_size_limit, Ordering::SeqCst);
                Ok(())
            }
            SorterBackend::File(file) => match self.cache.push(file) {
                Ok(()) => Ok(()),
                Err(file) => {
                    // Cache full: release the charge and drop the file.
                    self.memory_use_estimate
                        .fetch_sub(self.heap_size_limit, Ordering::SeqCst);
                    if let Err(e) = file.destroy() {
                        warn!("failed to delete spill file, error: {}", e);
                    }
                    Ok(())
                }
            },
        }
    }

    pub fn memory_use_estimate(&self) -> i64 {
        self.memory_use_estimate.load(Ordering::SeqCst)
    }
}

/// Process-RSS sampler with a one-second cache so the alloc hot path never
/// waits on `/proc` scans. Readers that lose the refresh race use the cached
/// value.
struct PressureSampler {
    inner: Mutex<SamplerInner>,
    cached_percent: AtomicU8,
}

struct SamplerInner {
    system: System,
    last_refresh: Instant,
}

impl PressureSampler {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);

        let sampler = Self {
            cached_percent: AtomicU8::new(0),
            inner: Mutex::new(SamplerInner {
                system,
                last_refresh: Instant::now(),
            }),
        };
        sampler.refresh(&mut sampler.inner.lock().unwrap());
        sampler
    }

    fn percent(&self) -> u8 {
        if let Ok(mut inner) = self.inner.try_lock() {
            if inner.last_refresh.elapsed() >= Duration::from_secs(1) {
                let pid = Pid::from_u32(std::process::id());
                inner.system.refresh_memory();
                inner.system.refresh_process(pid);
                self.refresh(&mut inner);
                inner.last_refresh = Instant::now();
            }
        }
        self.cached_percent.load(Ordering::Relaxed)
    }

    fn refresh(&self, inner: &mut SamplerInner) {
        let pid = Pid::from_u32(std::process::id());
        let total = inner.system.total_memory();
        let used = inner.system.process(pid).map(|p| p.memory()).unwrap_or(0);
        let percent = if total == 0 {
            0
        } else {
            (used.saturating_mul(100) / total).min(100) as u8
        };
        self.cached_percent.store(percent, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_core::event::Event;
    use brook_core::tool::setup_log;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, max_memory_consumption: i64) -> SorterConfig {
        let mut config = SorterConfig::new(dir);
        config.heap_size_limit = 1024;
        config.max_memory_consumption = max_memory_consumption;
        config.max_memory_pressure = 100;
        config
    }

    #[test]
    fn test_memory_backends_until_budget_exhausted() {
        setup_log();

        let dir = tempdir().unwrap();
        let pool = BackendPool::new(&test_config(dir.path(), 2048));

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(matches!(a, SorterBackend::Memory(_)));
        assert!(matches!(b, SorterBackend::Memory(_)));
        assert_eq!(pool.memory_use_estimate(), 2048);

        // Budget reached: the next allocation spills.
        let c = pool.alloc().unwrap();
        assert!(matches!(c, SorterBackend::File(_)));

        pool.dealloc(a).unwrap();
        pool.dealloc(b).unwrap();
        // The file backend keeps its charge while parked.
        assert_eq!(pool.memory_use_estimate(), 1024);
        pool.dealloc(c).unwrap();
        assert_eq!(pool.memory_use_estimate(), 1024);
    }

    #[test]
    fn test_file_backend_recycled_through_cache() {
        setup_log();

        let dir = tempdir().unwrap();
        let pool = BackendPool::new(&test_config(dir.path(), 0));

        let mut backend = pool.alloc().unwrap();
        assert!(matches!(backend, SorterBackend::File(_)));
        backend.write_next(Event::resolved(0, 1)).unwrap();
        backend.flush().unwrap();
        pool.dealloc(backend).unwrap();

        // The cached backend is claimed before any new file is created.
        let backend = pool.alloc().unwrap();
        assert!(matches!(backend, SorterBackend::File(_)));
        assert_eq!(pool.file_name_counter.load(Ordering::SeqCst), 1);

        // And it comes back reset.
        assert_eq!(backend.size(), 0);
        pool.dealloc(backend).unwrap();
    }

    #[test]
    fn test_zero_budget_forces_files() {
        setup_log();

        let dir = tempdir().unwrap();
        let pool = BackendPool::new(&test_config(dir.path(), 0));

        for _ in 0..4 {
            let backend = pool.alloc().unwrap();
            assert!(matches!(backend, SorterBackend::File(_)));
            pool.dealloc(backend).unwrap();
        }
    }
}
