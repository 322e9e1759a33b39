use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use num_format::{Locale, ToFormattedString};

const SLIDING_WINDOW_SIZE: u64 = 2; // In seconds

static STOP: AtomicBool = AtomicBool::new(false);

// One counter per worker, padded out to a cache line of its own.
#[repr(C)]
#[derive(Default)]
struct WorkerStats {
    count: AtomicU64,
    padding: [u64; 15],
}

pub fn test_throughput<F>(func: F)
where
    F: Fn() + Sync + Send + 'static,
{
    ctrlc::set_handler(|| STOP.store(true, Ordering::SeqCst))
        .expect("Error setting Ctrl-C handler");

    let num_threads = num_cpus::get_physical().saturating_sub(1).max(1);
    println!("Number of worker threads: {num_threads}");

    let func = Arc::new(func);
    let worker_stats: Arc<Vec<WorkerStats>> =
        Arc::new((0..num_threads).map(|_| WorkerStats::default()).collect());

    let monitor_stats = Arc::clone(&worker_stats);
    let monitor = thread::spawn(move || {
        let mut window_start = Instant::now();
        let mut last_total = 0u64;
        while !STOP.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_secs(SLIDING_WINDOW_SIZE));
            let elapsed = window_start.elapsed().as_secs_f64();
            window_start = Instant::now();

            let total: u64 = monitor_stats
                .iter()
                .map(|stats| stats.count.load(Ordering::Relaxed))
                .sum();
            let in_window = total - last_total;
            last_total = total;

            let throughput = (in_window as f64 / elapsed) as u64;
            println!(
                "Throughput: {} iterations/sec",
                throughput.to_formatted_string(&Locale::en)
            );
        }
    });

    let mut workers = Vec::with_capacity(num_threads);
    for index in 0..num_threads {
        let worker_stats = Arc::clone(&worker_stats);
        let func = Arc::clone(&func);
        workers.push(thread::spawn(move || {
            while !STOP.load(Ordering::SeqCst) {
                for _ in 0..1000 {
                    func();
                }
                worker_stats[index].count.fetch_add(1000, Ordering::Relaxed);
            }
        }));
    }

    for worker in workers {
        worker.join().expect("worker thread panicked");
    }
    monitor.join().expect("monitor thread panicked");
}
