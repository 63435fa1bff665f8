use anyhow::Result;
use async_channel::{Receiver, Sender};
use log::{debug, info};
use std::fs;
use std::sync::Arc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use brook_core::event::Event;

use crate::config::{SorterConfig, FLUSH_TASK_QUEUE_SIZE, INPUT_QUEUE_SIZE, OUTPUT_QUEUE_SIZE};
use crate::heap_sorter::HeapSorter;
use crate::merger::Merger;
use crate::pool::BackendPool;

/// Cloneable producer and consumer endpoints of one `UnifiedSorter`.
#[derive(Clone)]
pub struct SorterHandle {
    input: Sender<Event>,
    output: Receiver<Event>,
}

impl SorterHandle {
    /// Queue one event. Blocks on back-pressure. Events offered to a sorter
    /// that is already gone are swallowed, matching cancellation semantics.
    pub async fn add_entry(&self, event: Event) {
        let _ = self.input.send(event).await;
    }

    /// The globally ordered output stream. Reads until the pipeline winds
    /// down and closes it.
    pub fn output(&self) -> Receiver<Event> {
        self.output.clone()
    }

    /// Close the input. The pipeline drains everything already queued, emits
    /// the final resolved marker and winds down.
    pub fn close(&self) {
        self.input.close();
    }
}

/// Wires the backend pool, the heap sorters and the merger, and dispatches
/// the input stream.
///
/// Dispatch rule: resolved markers are broadcast to every heap sorter, since
/// the per-sorter frontiers are only comparable if every sorter sees every
/// marker; row events go round-robin, which spreads load while keeping the
/// per-producer arrival order inside each sorter.
pub struct UnifiedSorter {
    config: SorterConfig,
    pool: Arc<BackendPool>,
    input_tx: Sender<Event>,
    input_rx: Receiver<Event>,
    output_tx: Sender<Event>,
    output_rx: Receiver<Event>,
}

impl UnifiedSorter {
    pub fn new(config: SorterConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.sorter_dir)?;

        let pool = Arc::new(BackendPool::new(&config));
        let (input_tx, input_rx) = async_channel::bounded(INPUT_QUEUE_SIZE);
        let (output_tx, output_rx) = async_channel::bounded(OUTPUT_QUEUE_SIZE);

        Ok(Self {
            config,
            pool,
            input_tx,
            input_rx,
            output_tx,
            output_rx,
        })
    }

    /// Endpoints for producers and the consumer. Must be taken before `run`
    /// consumes the sorter.
    pub fn handle(&self) -> SorterHandle {
        SorterHandle {
            input: self.input_tx.clone(),
            output: self.output_rx.clone(),
        }
    }

    /// Start all child tasks under `subsys` and dispatch input until the
    /// input closes or shutdown is requested. Child failures surface as the
    /// enclosing shutdown scope's first error.
    pub async fn run(self, mut subsys: SubsystemHandle) -> Result<()> {
        let UnifiedSorter {
            config,
            pool,
            input_tx,
            input_rx,
            output_tx,
            output_rx,
        } = self;
        // Producers hold the remaining input senders, the consumer the
        // remaining output receivers; keeping ours would stall channel
        // closure at wind-down.
        drop(input_tx);
        drop(output_rx);

        let num_sorters = config.num_concurrent_worker;
        let (flush_tx, flush_rx) = async_channel::bounded(FLUSH_TASK_QUEUE_SIZE);

        let mut sorter_inputs = Vec::with_capacity(num_sorters);
        for id in 0..num_sorters {
            let (sorter, input) =
                HeapSorter::new(id, pool.clone(), flush_tx.clone(), config.heap_size_limit);
            sorter_inputs.push(input);
            subsys.start(SubsystemBuilder::new(format!("heap-sorter-{}", id), move |s| {
                sorter.run(s)
            }));
        }
        drop(flush_tx);

        let merger = Merger::new(num_sorters, flush_rx, output_tx, pool.clone());
        subsys.start(SubsystemBuilder::new("merger", move |s| merger.run(s)));

        info!(
            "unified sorter started, workers: {}, dir: {}",
            num_sorters,
            config.sorter_dir.display()
        );

        let mut next_sorter_id: usize = 0;
        loop {
            let event = tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("unified sorter shutting down");
                    return Ok(());
                }
                event = input_rx.recv() => match event {
                    Ok(event) => event,
                    Err(_) => {
                        debug!("unified sorter input closed, draining children");
                        // Dropping the sorter inputs lets the pipeline drain
                        // stage by stage: sorters finish their queues, the
                        // merger finishes the remaining flush tasks.
                        drop(sorter_inputs);
                        subsys.wait_for_children().await;
                        return Ok(());
                    }
                },
            };

            if event.is_resolved() {
                for input in &sorter_inputs {
                    tokio::select! {
                        _ = subsys.on_shutdown_requested() => return Ok(()),
                        sent = input.send(event.clone()) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                debug!("unified sorter: resolved event broadcast, crts: {}", event.crts);
                continue;
            }

            let target_id = next_sorter_id % num_sorters;
            next_sorter_id = next_sorter_id.wrapping_add(1);
            tokio::select! {
                _ = subsys.on_shutdown_requested() => return Ok(()),
                sent = sorter_inputs[target_id].send(event) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
