use anyhow::Result;
use async_channel::{Receiver, Sender};
use likely_stable::unlikely;
use log::{debug, error};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task;
use tokio_graceful_shutdown::SubsystemHandle;

use brook_core::event::Event;

use crate::backend::SorterBackend;
use crate::config::HEAP_INPUT_QUEUE_SIZE;
use crate::error::SorterError;
use crate::pool::BackendPool;

const HEAP_INITIAL_CAPACITY: usize = 1024;

/// Heap entry. The push sequence keeps events with equal `(crts, start_ts)`
/// in first-come order, which makes runs deterministic per sorter.
#[derive(Debug)]
pub(crate) struct SortItem {
    pub event: Event,
    pub seq: u64,
}

impl SortItem {
    #[inline]
    fn key(&self) -> (u64, u64, u64) {
        (self.event.crts, self.event.start_ts, self.seq)
    }
}

impl PartialEq for SortItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SortItem {}

impl PartialOrd for SortItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Handshake record transferring one run from a heap sorter to the merger.
///
/// The task is published before the drain into the backend has finished; the
/// receiver settles exactly once, with the read-ready backend on success or
/// the first write error. `finished == None` marks an empty flush that only
/// advances the resolved frontier.
pub struct FlushTask {
    pub heap_sorter_id: usize,
    pub max_resolved_ts: u64,
    pub finished: Option<oneshot::Receiver<Result<SorterBackend>>>,
}

/// Accumulates incoming events into a min-heap and cuts a sorted run whenever
/// a resolved marker arrives or the heap outgrows its byte budget.
///
/// The drain of a cut heap into its backend runs on a blocking worker so the
/// main loop keeps reading input while the run is being written.
pub struct HeapSorter {
    id: usize,
    input: Receiver<Event>,
    out: Sender<FlushTask>,
    pool: Arc<BackendPool>,
    heap: BinaryHeap<Reverse<SortItem>>,
    seq: u64,
    heap_size_limit: i64,
}

impl HeapSorter {
    /// Returns the sorter and the sender feeding its input queue.
    pub fn new(
        id: usize,
        pool: Arc<BackendPool>,
        out: Sender<FlushTask>,
        heap_size_limit: i64,
    ) -> (Self, Sender<Event>) {
        let (input_sender, input) = async_channel::bounded(HEAP_INPUT_QUEUE_SIZE);

        let sorter = Self {
            id,
            input,
            out,
            pool,
            heap: BinaryHeap::with_capacity(HEAP_INITIAL_CAPACITY),
            seq: 0,
            heap_size_limit,
        };
        (sorter, input_sender)
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        let input = self.input.clone();
        let mut max_resolved: u64 = 0;
        let mut heap_size_bytes_estimate: i64 = 0;

        loop {
            let event = tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("heap sorter {} shutting down", self.id);
                    return Ok(());
                }
                event = input.recv() => match event {
                    Ok(event) => event,
                    Err(_) => {
                        debug!("heap sorter {} input closed, exiting", self.id);
                        return Ok(());
                    }
                },
            };

            let is_resolved = event.is_resolved();
            if is_resolved {
                debug!(
                    "heap sorter {} got resolved event, crts: {}",
                    self.id, event.crts
                );
                if unlikely(event.crts < max_resolved) {
                    let e = SorterError::ResolvedTsRegression {
                        current: event.crts,
                        max: max_resolved,
                    };
                    error!("heap sorter {}: {}", self.id, e);
                    return Err(e.into());
                }
                max_resolved = event.crts;
            } else if unlikely(max_resolved > 0 && event.crts <= max_resolved) {
                // A resolved marker promised that no event at or below its
                // timestamp would follow on this stream.
                let e = SorterError::ResolvedTsRegression {
                    current: event.crts,
                    max: max_resolved,
                };
                error!("heap sorter {}: row event behind the frontier: {}", self.id, e);
                return Err(e.into());
            }

            heap_size_bytes_estimate += event.approximate_size();
            self.heap.push(Reverse(SortItem {
                event,
                seq: self.seq,
            }));
            self.seq += 1;

            // Flushing on every resolved marker is what lets the merger
            // advance the global low-water-mark promptly.
            if heap_size_bytes_estimate >= self.heap_size_limit || is_resolved {
                if !self.flush(&subsys, max_resolved).await? {
                    return Ok(());
                }
                heap_size_bytes_estimate = 0;
            }
        }
    }

    /// Cut the current heap into a run and publish the flush task. Returns
    /// `false` when shutdown interrupted the publish.
    async fn flush(&mut self, subsys: &SubsystemHandle, max_resolved_ts: u64) -> Result<bool> {
        let is_empty_flush = self.heap.is_empty();

        let finished = if is_empty_flush {
            None
        } else {
            let mut backend = self.pool.alloc()?;
            let mut old_heap = std::mem::replace(
                &mut self.heap,
                BinaryHeap::with_capacity(HEAP_INITIAL_CAPACITY),
            );

            let (settle, finished) = oneshot::channel();
            let heap_id = self.id;
            task::spawn_blocking(move || {
                let result = match drain_heap(&mut old_heap, &mut backend) {
                    Ok(batch_size) => {
                        debug!(
                            "heap sorter {} flush task finished, resolved ts: {}, events: {}",
                            heap_id, max_resolved_ts, batch_size
                        );
                        Ok(backend)
                    }
                    Err(e) => Err(e),
                };
                // The merger may already be gone during shutdown.
                let _ = settle.send(result);
            });
            Some(finished)
        };

        let task = FlushTask {
            heap_sorter_id: self.id,
            max_resolved_ts,
            finished,
        };

        debug!(
            "heap sorter {} new flush task, resolved ts: {}",
            self.id, max_resolved_ts
        );
        tokio::select! {
            _ = subsys.on_shutdown_requested() => Ok(false),
            sent = self.out.send(task) => Ok(sent.is_ok()),
        }
    }
}

/// Write the heap's events in ascending sort order and commit the run.
fn drain_heap(
    heap: &mut BinaryHeap<Reverse<SortItem>>,
    backend: &mut SorterBackend,
) -> Result<usize> {
    let batch_size = heap.len();
    while let Some(Reverse(item)) = heap.pop() {
        backend.write_next(item.event)?;
    }
    backend.flush()?;
    Ok(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use brook_core::tool::setup_log;

    #[test]
    fn test_sort_item_order_is_stable() {
        setup_log();

        let mut heap: BinaryHeap<Reverse<SortItem>> = BinaryHeap::new();
        let events = vec![
            Event::put(9, 1, b"a".to_vec(), vec![], 1),
            Event::put(5, 2, b"b".to_vec(), vec![], 1),
            Event::put(5, 2, b"c".to_vec(), vec![], 1),
            Event::put(5, 1, b"d".to_vec(), vec![], 1),
        ];
        for (seq, event) in events.into_iter().enumerate() {
            heap.push(Reverse(SortItem {
                event,
                seq: seq as u64,
            }));
        }

        let mut keys = Vec::new();
        while let Some(Reverse(item)) = heap.pop() {
            keys.push(item.event.key.clone());
        }

        // Ascending by (crts, start_ts), first-come order on full ties.
        assert_eq!(keys, vec![b"d".to_vec(), b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_drain_heap_writes_sorted_run() {
        setup_log();

        let mut heap: BinaryHeap<Reverse<SortItem>> = BinaryHeap::new();
        for (seq, crts) in [7u64, 3, 9, 5].into_iter().enumerate() {
            heap.push(Reverse(SortItem {
                event: Event::put(crts, crts - 1, b"k".to_vec(), vec![], 1),
                seq: seq as u64,
            }));
        }

        let mut backend = SorterBackend::Memory(MemoryBackend::new());
        let batch_size = drain_heap(&mut heap, &mut backend).unwrap();
        assert_eq!(batch_size, 4);
        assert!(heap.is_empty());

        let mut got = Vec::new();
        while let Some(event) = backend.read_next().unwrap() {
            got.push(event.crts);
        }
        assert_eq!(got, vec![3, 5, 7, 9]);
    }
}
