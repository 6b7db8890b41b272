use std::{
    cell::Cell,
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use rand::Rng;
use vmsync::{options::Options, ConcurrentQueue, Monitor};

struct QueueReport {
    pushed: usize,
    popped: usize,
    duplicates: usize,
    alloc_retries: usize,
    elapsed: Duration,
}

/// Producers push distinct values, consumers drain until every value has been seen once.
fn stress_queue(options: &Options) -> QueueReport {
    let queue = Arc::new(ConcurrentQueue::<u64>::with_options(options.queue_options()));
    let expected = options.producers * options.pushes_per_producer;
    let popped = Arc::new(AtomicUsize::new(0));
    let alloc_retries = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let producers: Vec<_> = (0..options.producers)
        .map(|producer| {
            let queue = queue.clone();
            let alloc_retries = alloc_retries.clone();
            let pushes = options.pushes_per_producer;
            let jitter = options.jitter;
            thread::spawn(move || {
                let mut rng = rand::rng();
                for i in 0..pushes {
                    let mut value = ((producer as u64) << 32) | i as u64;
                    while let Err(err) = queue.push(value) {
                        log::trace!("producer {producer}: {err}, retrying");
                        alloc_retries.fetch_add(1, Ordering::Relaxed);
                        value = err.into_inner();
                        thread::yield_now();
                    }
                    if jitter && rng.random_bool(0.01) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..options.consumers.max(1))
        .map(|_| {
            let queue = queue.clone();
            let popped = popped.clone();
            let jitter = options.jitter;
            thread::spawn(move || {
                let mut rng = rand::rng();
                let mut seen = Vec::new();
                while popped.load(Ordering::Acquire) < expected {
                    match queue.pop() {
                        Some(value) => {
                            seen.push(value);
                            popped.fetch_add(1, Ordering::AcqRel);
                        }
                        None => thread::yield_now(),
                    }
                    if jitter && rng.random_bool(0.01) {
                        thread::yield_now();
                    }
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer panicked");
    }
    let mut unique = HashSet::with_capacity(expected);
    let mut total = 0;
    let mut duplicates = 0;
    for consumer in consumers {
        for value in consumer.join().expect("consumer panicked") {
            total += 1;
            if !unique.insert(value) {
                duplicates += 1;
            }
        }
    }

    QueueReport {
        pushed: expected,
        popped: total,
        duplicates,
        alloc_retries: alloc_retries.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    }
}

/// Threads take turns through a monitor: thread `i` proceeds only when `turn % n == i`.
fn stress_monitor(options: &Options) -> (usize, Duration) {
    let threads = options.monitor_threads.max(1);
    let handoffs = options.handoffs;
    let monitor = Arc::new(Monitor::new(Cell::new(0usize)));
    let start = Instant::now();

    let workers: Vec<_> = (0..threads)
        .map(|me| {
            let monitor = monitor.clone();
            thread::spawn(move || {
                let mut turns = 0usize;
                let mut guard = monitor.lock();
                loop {
                    let turn = guard.get();
                    if turn >= handoffs {
                        break;
                    }
                    if turn % threads == me {
                        guard.set(turn + 1);
                        turns += 1;
                        guard.notify_all();
                    } else if let Err(err) = guard.wait_for(Duration::from_millis(100)) {
                        log::warn!("monitor worker {me}: {err}");
                    }
                }
                guard.notify_all();
                turns
            })
        })
        .collect();

    let turns = workers
        .into_iter()
        .map(|worker| worker.join().expect("monitor worker panicked"))
        .sum();
    (turns, start.elapsed())
}

fn main() {
    env_logger::init();
    let options = Options::parse();
    log::debug!("{options:?}");

    let report = stress_queue(&options);
    println!(
        "queue: pushed {} popped {} duplicates {} alloc retries {} in {:?}",
        report.pushed, report.popped, report.duplicates, report.alloc_retries, report.elapsed
    );

    let (turns, elapsed) = stress_monitor(&options);
    println!("monitor: {turns} handoffs in {elapsed:?}");

    if report.popped != report.pushed || report.duplicates != 0 || turns != options.handoffs {
        log::error!("stress run failed");
        std::process::exit(1);
    }
}
