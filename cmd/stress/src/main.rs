//! Stress test - many fibers
//!
//! Spawns large numbers of fibers that yield, contend on a fibra `Mutex`,
//! sleep on timers and count down a shared `Latch`.
//!
//!     cargo run -p fibra-stress --release -- [fibers] [rounds]

use fibra::{Fiber, Latch, Mutex, Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    fibra::init_logging();
    println!("=== fibra stress test ===\n");

    let mut args = std::env::args().skip(1);
    let num_fibers: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let rounds: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let config = RuntimeConfig::from_env().max_fibers(num_fibers + 1000);
    println!(
        "{} fibers x {} rounds on {} groups x {} workers\n",
        num_fibers, rounds, config.scheduling_groups, config.workers_per_group
    );
    let mut runtime = Runtime::new(config);

    let completed = Arc::new(AtomicU64::new(0));
    let done = Arc::clone(&completed);

    let (spawn_time, run_time, total) = runtime.block_on(move || {
        let start = Instant::now();
        let latch = Arc::new(Latch::new(num_fibers));
        let shared = Arc::new(Mutex::new(0u64));

        let batch = (0..num_fibers)
            .map(|i| {
                let latch = Arc::clone(&latch);
                let shared = Arc::clone(&shared);
                let done = Arc::clone(&done);
                move || {
                    for r in 0..rounds {
                        if (i + r) % 7 == 0 {
                            fibra::sleep_for(Duration::from_micros(100));
                        } else {
                            fibra::yield_now();
                        }
                        *shared.lock() += 1;
                    }
                    done.fetch_add(1, Ordering::Relaxed);
                    latch.count_down(1);
                }
            });
        if !fibra::start_fibers_detached(batch) {
            eprintln!("failed to start fiber batch");
            std::process::exit(1);
        }
        let spawn_time = start.elapsed();
        println!("Spawn time: {:?}", spawn_time);
        println!(
            "Spawn rate: {:.0} fibers/sec",
            num_fibers as f64 / spawn_time.as_secs_f64()
        );

        println!("\nWaiting for completion...");
        let run_start = Instant::now();
        while !latch.wait_for(Duration::from_secs(1)) {
            print!("\rCompleted: {}/{}", done.load(Ordering::Relaxed), num_fibers);
            if run_start.elapsed() > Duration::from_secs(60) {
                println!("\nTimeout!");
                break;
            }
        }

        // A joinable child sees every increment
        let total = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&total);
        let mut child = Fiber::spawn(move || {
            seen.store(*shared.lock(), Ordering::Relaxed);
        });
        child.join();

        (spawn_time, run_start.elapsed(), total.load(Ordering::Relaxed))
    });

    println!("\n\n=== Results ===");
    println!("Total fibers:    {}", num_fibers);
    println!("Completed:       {}", completed.load(Ordering::Relaxed));
    println!("Lock increments: {} (expected {})", total, num_fibers * rounds);
    println!("Spawn time:      {:?}", spawn_time);
    println!("Run time:        {:?}", run_time);
    println!(
        "Throughput:      {:.0} fibers/sec",
        num_fibers as f64 / (spawn_time + run_time).as_secs_f64()
    );

    if let Err(e) = runtime.shutdown() {
        eprintln!("shutdown: {}", e);
    }
    println!("\n=== stress test complete ===");
}
