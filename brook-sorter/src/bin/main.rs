use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use brook_core::event::Event;
use brook_core::tool::init_log;
use brook_sorter::{SorterConfig, SorterHandle, UnifiedSorter};

/// Feeds the sorter a generated multi-producer workload and verifies the
/// output ordering, logging throughput at the end.
#[derive(Parser)]
#[command(name = "brook-sorter")]
struct Args {
    /// Spill-file directory.
    #[arg(long, default_value = "./sorter")]
    dir: PathBuf,

    /// Number of concurrent producers.
    #[arg(long, default_value_t = 16)]
    producers: usize,

    /// Events per producer.
    #[arg(long, default_value_t = 10_000)]
    events: u64,

    /// Heap sorter fan-out.
    #[arg(long, default_value_t = 16)]
    workers: usize,

    /// Memory-backend budget in bytes. Zero spills every run to disk.
    #[arg(long)]
    max_memory_consumption: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    let mut config = SorterConfig::new(&args.dir);
    config.num_concurrent_worker = args.workers;
    if let Some(limit) = args.max_memory_consumption {
        config.max_memory_consumption = limit;
    }

    let sorter = UnifiedSorter::new(config)?;
    let handle = sorter.handle();
    let producers = args.producers;
    let events = args.events;

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("unified-sorter", move |s| sorter.run(s)));
        s.start(SubsystemBuilder::new("driver", move |s| {
            drive(s, handle, producers, events)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_millis(1000))
    .await?;

    Ok(())
}

async fn drive(
    _subsys: SubsystemHandle,
    handle: SorterHandle,
    producers: usize,
    events: u64,
) -> Result<()> {
    let start = Instant::now();
    let target = events << 5;

    let progress: Arc<Vec<AtomicU64>> =
        Arc::new((0..producers).map(|_| AtomicU64::new(0)).collect());

    let mut tasks = Vec::new();
    for i in 0..producers {
        let handle = handle.clone();
        let progress = progress.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..events {
                let crts = j << 5;
                handle
                    .add_entry(Event::put(
                        crts,
                        crts.saturating_sub(5),
                        Vec::new(),
                        Vec::new(),
                        0,
                    ))
                    .await;
                progress[i].store(crts, Ordering::SeqCst);
            }
            progress[i].store(events << 5, Ordering::SeqCst);
        }));
    }

    // Resolver: forward the minimum producer progress as the resolved ts.
    let resolver_handle = handle.clone();
    let resolver_progress = progress.clone();
    tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            let resolved_ts = resolver_progress
                .iter()
                .map(|p| p.load(Ordering::SeqCst))
                .min()
                .unwrap_or(0);
            resolver_handle.add_entry(Event::resolved(0, resolved_ts)).await;
            if resolved_ts == target {
                break;
            }
        }
    }));

    // Consumer: count the rows back and check the ordering holds.
    let output = handle.output();
    let total = producers as u64 * events;
    let mut count: u64 = 0;
    let mut last_ts: u64 = 0;
    while let Ok(event) = output.recv().await {
        if event.is_resolved() {
            continue;
        }
        assert!(
            event.crts >= last_ts,
            "output regressed, crts: {}, last: {}",
            event.crts,
            last_ts
        );
        last_ts = event.crts;
        count += 1;
        if count % 100_000 == 0 {
            info!("events received: {}", count);
        }
        if count == total {
            break;
        }
    }

    handle.close();
    for task in tasks {
        let _ = task.await;
    }

    let elapsed = start.elapsed();
    info!(
        "sorted {} events in {:.2?}, {:.0} events/s",
        count,
        elapsed,
        count as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
