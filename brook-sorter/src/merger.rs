use anyhow::{bail, Result};
use async_channel::{Receiver, Sender};
use likely_stable::likely;
use log::{debug, error, warn};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_graceful_shutdown::SubsystemHandle;

use brook_core::error_bail;
use brook_core::event::Event;

use crate::backend::SorterBackend;
use crate::heap_sorter::FlushTask;
use crate::pool::BackendPool;

/// How often the drain loop emits an intermediate resolved marker.
const RESOLVED_MARKER_INTERVAL: Duration = Duration::from_secs(1);

/// A flush task the merger has accepted but not fully consumed.
///
/// `finished` is pending until the first merge round that needs the run;
/// awaiting it yields the read-ready backend. `cache` holds an event that was
/// peeked past the current cut and belongs to a later round.
struct PendingTask {
    heap_sorter_id: usize,
    max_resolved_ts: u64,
    finished: Option<oneshot::Receiver<Result<SorterBackend>>>,
    backend: Option<SorterBackend>,
    cache: Option<Event>,
}

/// Merge-heap entry. Ties on `(crts, start_ts)` break by origin heap id and
/// task arrival order, making the merged output deterministic.
struct MergeItem {
    event: Event,
    origin_heap_id: usize,
    task_key: u64,
}

impl MergeItem {
    #[inline]
    fn key(&self) -> (u64, u64, usize, u64) {
        (
            self.event.crts,
            self.event.start_ts,
            self.origin_heap_id,
            self.task_key,
        )
    }
}

impl PartialEq for MergeItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MergeItem {}

impl PartialOrd for MergeItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Consumes flush tasks from every heap sorter and K-way merges their runs
/// into one globally ordered output stream.
///
/// The merger tracks the highest resolved timestamp reported per sorter; the
/// minimum across sorters is the global low-water-mark. Every time that
/// minimum strictly advances, one merge round runs with the new minimum as
/// its cut: every buffered event with `crts` up to the cut is emitted, then a
/// resolved marker for the cut closes the round. Events peeked past the cut
/// wait in the pending set for a later round.
pub struct Merger {
    input: Receiver<FlushTask>,
    output: Sender<Event>,
    pool: Arc<BackendPool>,

    /// Highest resolved timestamp reported by each heap sorter.
    last_resolved_ts: Vec<u64>,

    /// Current global low-water-mark. Non-decreasing.
    min_resolved_ts: u64,

    /// Accepted tasks that still hold unread events, keyed by arrival order.
    pending: HashMap<u64, PendingTask>,

    next_task_key: u64,
}

impl Merger {
    pub fn new(
        num_sorters: usize,
        input: Receiver<FlushTask>,
        output: Sender<Event>,
        pool: Arc<BackendPool>,
    ) -> Self {
        Self {
            input,
            output,
            pool,
            last_resolved_ts: vec![0; num_sorters],
            min_resolved_ts: 0,
            pending: HashMap::new(),
            next_task_key: 0,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        let input = self.input.clone();

        loop {
            let task = tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("merger shutting down");
                    return self.release_backends();
                }
                task = input.recv() => match task {
                    Ok(task) => task,
                    Err(_) => {
                        debug!("merger: flush task queue closed, exiting");
                        return self.release_backends();
                    }
                },
            };

            debug!(
                "merger got flush task, heap id: {}, resolved ts: {}",
                task.heap_sorter_id, task.max_resolved_ts
            );
            self.accept(task);

            let new_min = self
                .last_resolved_ts
                .iter()
                .copied()
                .min()
                .unwrap_or(u64::MAX);
            if new_min > self.min_resolved_ts {
                self.min_resolved_ts = new_min;
                if !self.merge_round(&subsys).await? {
                    return self.release_backends();
                }
            }
        }
    }

    fn accept(&mut self, task: FlushTask) {
        let FlushTask {
            heap_sorter_id,
            max_resolved_ts,
            finished,
        } = task;

        // Empty flushes carry resolved progress only.
        if let Some(finished) = finished {
            let key = self.next_task_key;
            self.next_task_key += 1;
            self.pending.insert(
                key,
                PendingTask {
                    heap_sorter_id,
                    max_resolved_ts,
                    finished: Some(finished),
                    backend: None,
                    cache: None,
                },
            );
        }

        if self.last_resolved_ts[heap_sorter_id] < max_resolved_ts {
            self.last_resolved_ts[heap_sorter_id] = max_resolved_ts;
        }
    }

    /// One K-way merge cut at the current low-water-mark. Returns `false`
    /// when shutdown interrupted the round.
    async fn merge_round(&mut self, subsys: &SubsystemHandle) -> Result<bool> {
        debug!(
            "merger: merge round started, min resolved ts: {}",
            self.min_resolved_ts
        );

        let mut merge_heap: BinaryHeap<Reverse<MergeItem>> = BinaryHeap::new();

        // Prime: pull the first eligible event of every run covered by the
        // cut, waiting for its drain to finish if necessary.
        let keys: Vec<u64> = self.pending.keys().copied().collect();
        for key in keys {
            let entry = self.pending.get_mut(&key).unwrap();
            if entry.max_resolved_ts > self.min_resolved_ts {
                continue;
            }

            if let Some(finished) = entry.finished.take() {
                let backend = tokio::select! {
                    _ = subsys.on_shutdown_requested() => return Ok(false),
                    result = finished => match result {
                        Ok(Ok(backend)) => backend,
                        Ok(Err(e)) => return Err(e),
                        Err(_) => {
                            error_bail!("flush drain worker dropped before settling");
                        }
                    },
                };
                entry.backend = Some(backend);
            }

            let event = match entry.cache.take() {
                Some(event) => Some(event),
                None => entry.backend.as_mut().unwrap().read_next()?,
            };

            let mut end_of_run = false;
            match event {
                Some(event) if event.crts > self.min_resolved_ts => {
                    entry.cache = Some(event);
                }
                Some(event) => merge_heap.push(Reverse(MergeItem {
                    event,
                    origin_heap_id: entry.heap_sorter_id,
                    task_key: key,
                })),
                None => end_of_run = true,
            }
            if end_of_run {
                self.retire_task(key)?;
            }
        }

        debug!("merger: merging {} runs", merge_heap.len());

        // Drain: pop the global minimum, forward it, refill from its run.
        let mut last_emitted: Option<u64> = None;
        let mut last_marker_at = Instant::now();

        while let Some(Reverse(item)) = merge_heap.pop() {
            let MergeItem {
                event, task_key, ..
            } = item;

            if likely(!event.is_resolved()) {
                let crts = event.crts;
                tokio::select! {
                    _ = subsys.on_shutdown_requested() => return Ok(false),
                    sent = self.output.send(event) => {
                        if sent.is_err() {
                            return Ok(false);
                        }
                    }
                }
                last_emitted = Some(crts);
            }

            let entry = self.pending.get_mut(&task_key).unwrap();
            let mut end_of_run = false;
            match entry.backend.as_mut().unwrap().read_next()? {
                None => end_of_run = true,
                Some(next) if next.crts > self.min_resolved_ts => {
                    // Retired from this round; the peeked event opens a
                    // later one.
                    entry.cache = Some(next);
                }
                Some(next) => merge_heap.push(Reverse(MergeItem {
                    event: next,
                    origin_heap_id: entry.heap_sorter_id,
                    task_key,
                })),
            }
            if end_of_run {
                self.retire_task(task_key)?;
            }

            // Let the consumer advance while a long round is in flight. The
            // marker must stay behind everything still unmerged.
            if last_marker_at.elapsed() >= RESOLVED_MARKER_INTERVAL {
                if let Some(ts) = last_emitted {
                    let behind_heap = merge_heap
                        .peek()
                        .map_or(true, |top| top.0.event.crts > ts);
                    if behind_heap {
                        if !self.send_resolved(subsys, ts).await? {
                            return Ok(false);
                        }
                        last_marker_at = Instant::now();
                    }
                }
            }
        }

        debug!(
            "merger: merge round done, resolved ts: {}",
            self.min_resolved_ts
        );
        if !self.send_resolved(subsys, self.min_resolved_ts).await? {
            return Ok(false);
        }

        Ok(true)
    }

    /// A run is exhausted: drop the task and return its backend to the pool.
    fn retire_task(&mut self, key: u64) -> Result<()> {
        let entry = self.pending.remove(&key).unwrap();
        if let Some(backend) = entry.backend {
            self.pool.dealloc(backend)?;
        }
        Ok(())
    }

    async fn send_resolved(&self, subsys: &SubsystemHandle, ts: u64) -> Result<bool> {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => Ok(false),
            sent = self.output.send(Event::resolved(0, ts)) => Ok(sent.is_ok()),
        }
    }

    /// Best-effort release of everything still held at shutdown.
    fn release_backends(&mut self) -> Result<()> {
        for (_, task) in self.pending.drain() {
            if let Some(backend) = task.backend {
                if let Err(e) = self.pool.dealloc(backend) {
                    warn!("merger: failed to release backend at shutdown, error: {}", e);
                }
            }
        }
        Ok(())
    }
}
