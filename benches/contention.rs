use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dlock::rcl::Server;
use dlock::{ccsynch, fc, fcf, fcfpq, rcl, ticket, DelegateLock, ServerConfig};

const THREADS: [usize; 3] = [1, 4, 8];

/// Runs `iters` increments split evenly over `threads` threads and returns
/// the time the slowest thread took.
fn run<L>(lock: &Arc<L>, threads: usize, iters: u64) -> Duration
where
    L: DelegateLock<Target = u64> + Send + Sync + 'static,
{
    let per_thread = iters / threads as u64 + 1;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let start = Instant::now();
                for _ in 0..per_thread {
                    lock.lock_then(|n| *n = black_box(n.wrapping_add(1)));
                }
                start.elapsed()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).max().unwrap_or_default()
}

fn bench_lock<L>(c: &mut Criterion, name: &str, make: impl Fn() -> L)
where
    L: DelegateLock<Target = u64> + Send + Sync + 'static,
{
    let mut group = c.benchmark_group(name);
    for threads in THREADS {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let lock = Arc::new(make());
            b.iter_custom(|iters| run(&lock, threads, iters));
        });
    }
    group.finish();
}

fn contention(c: &mut Criterion) {
    bench_lock(c, "ticket", || ticket::spins::Mutex::new(0));
    bench_lock(c, "fc", || fc::spins::Mutex::new(0));
    bench_lock(c, "fcf", || fcf::spins::Mutex::new(0));
    bench_lock(c, "fcfpq", || fcfpq::spins::Mutex::new(0));
    bench_lock(c, "ccsynch", || ccsynch::spins::Mutex::new(0));

    let server = Server::start(ServerConfig::new().name("bench")).expect("server failed to start");
    bench_lock(c, "rcl", || rcl::spins::Mutex::new(&server, 0));
}

criterion_group!(benches, contention);
criterion_main!(benches);
