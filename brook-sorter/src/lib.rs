//! The unified sorter reorders the change stream pulled from upstream into a
//! globally time-ordered stream for the downstream sinks, spilling to disk
//! when the memory budget runs out.
//!
//! The input is only partially ordered: many region pullers feed the sorter
//! concurrently, and each puller's events are non-decreasing by commit
//! timestamp, but nothing orders events across pullers. Pullers also inject
//! resolved markers. A marker with timestamp `ts` is a promise that no later
//! event on that stream carries a commit timestamp at or below `ts`.
//!
//! Why not one big heap?
//!
//! A single heap would serialize every insert behind one lock and keep the
//! whole backlog in memory. Instead the facade spreads row events round-robin
//! over a fixed set of heap sorters, each single-writer on its own input
//! queue. A heap sorter cuts its heap into a sorted run whenever a resolved
//! marker arrives or the heap outgrows its byte budget, so each run is small
//! and the cut points line up with the markers.
//!
//! Where does the run go?
//!
//! Into a backend allocated from a shared pool. The pool prefers in-memory
//! backends until its accounted budget is exhausted, then hands out spill
//! files, recycling them through a bounded free-list so file handles stay
//! capped. The accounting is deliberately coarse: every run charges the same
//! estimate regardless of medium, which bounds the number of in-flight runs
//! without measuring real RAM.
//!
//! How does the output become globally ordered?
//!
//! Resolved markers are broadcast to every heap sorter, so every sorter's
//! flush carries the highest marker it has seen. The merger keeps those
//! per-sorter frontiers, and the minimum across them is the global
//! low-water-mark: every event at or below it has already been cut into some
//! run. Each time the minimum advances the merger K-way merges the eligible
//! runs up to the new mark and closes the batch with one resolved marker
//! downstream. Events peeked past the mark wait for a later round.
//!
//! Back-pressure is the flow control everywhere: queues are bounded, sends
//! suspend, and a slow sorter may stall the marker broadcast. That stall is
//! correct — the low-water-mark cannot advance without that sorter's flush
//! anyway.

pub mod backend;
pub mod config;
pub mod error;
pub mod heap_sorter;
pub mod merger;
pub mod pool;
pub mod unified;

pub use config::SorterConfig;
pub use error::SorterError;
pub use unified::{SorterHandle, UnifiedSorter};
