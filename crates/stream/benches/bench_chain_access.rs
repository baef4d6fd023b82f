use std::hint::black_box;
use std::time::Instant;

use ocme_persist::MemoryStore;
use ocme_stream::{EnvParams, OocEnv};

fn make_env(budget: usize) -> OocEnv {
    let params = EnvParams {
        block_size_bytes: 4096,
        cache_budget_bytes: budget,
    };
    let mut env = OocEnv::create(Box::new(MemoryStore::new()), params).expect("create env");
    env.bind_type::<u64>("u64").expect("bind u64");
    env
}

fn bench_push(count: u64, budget: usize) {
    let mut env = make_env(budget);
    let start = Instant::now();
    {
        let mut c = env.get_or_create_chain::<u64>("bench").expect("chain");
        for i in 0..count {
            c.push(black_box(i)).expect("push");
        }
    }
    let elapsed = start.elapsed();
    let stats = env.cache_stats();
    println!(
        "  push ({count} elems, budget {budget}): {elapsed:?}, evictions {}, writes {}",
        stats.evictions, stats.writes
    );
}

fn bench_sequential_read(count: u64, budget: usize, passes: usize) {
    let mut env = make_env(budget);
    env.get_or_create_chain::<u64>("bench")
        .expect("chain")
        .extend(0..count)
        .expect("extend");

    let start = Instant::now();
    let mut c = env.chain::<u64>("bench").expect("chain");
    for _ in 0..passes {
        for i in 0..count as u32 {
            let _ = black_box(c.get(black_box(i)).expect("get"));
        }
    }
    let elapsed = start.elapsed();
    let per_pass = elapsed / passes as u32;
    println!("  sequential read ({count} elems, budget {budget}): {per_pass:?}/pass");
}

fn bench_strided_read(count: u64, budget: usize, stride: u32) {
    let mut env = make_env(budget);
    env.get_or_create_chain::<u64>("bench")
        .expect("chain")
        .extend(0..count)
        .expect("extend");

    let start = Instant::now();
    {
        let mut c = env.chain::<u64>("bench").expect("chain");
        let n = count as u32;
        let mut i = 0u32;
        for _ in 0..n {
            let _ = black_box(c.get(i).expect("get"));
            i = (i + stride) % n;
        }
    }
    let elapsed = start.elapsed();
    let stats = env.cache_stats();
    println!(
        "  strided read ({count} elems, stride {stride}, budget {budget}): {elapsed:?}, loads {}, hits {}",
        stats.loads, stats.hits
    );
}

fn bench_compact(count: u64) {
    let mut env = make_env(64 * 1024 * 1024);
    let mut c = env.get_or_create_chain::<u64>("bench").expect("chain");
    c.extend(0..count).expect("extend");
    let deleted: Vec<u32> = (0..count as u32).filter(|i| i % 7 == 0).collect();

    let start = Instant::now();
    c.compact(black_box(&deleted)).expect("compact");
    let elapsed = start.elapsed();
    println!("  compact ({count} elems, {} deleted): {elapsed:?}", deleted.len());
}

fn main() {
    println!("=== Chain Access Benchmarks ===\n");

    println!("Push:");
    bench_push(100_000, 64 * 1024 * 1024);
    bench_push(100_000, 64 * 1024);

    println!("\nSequential read:");
    bench_sequential_read(100_000, 64 * 1024 * 1024, 10);
    bench_sequential_read(100_000, 64 * 1024, 10);

    println!("\nStrided read (cache thrash):");
    bench_strided_read(100_000, 64 * 1024, 4099);
    bench_strided_read(100_000, 1024 * 1024, 4099);

    println!("\nCompact:");
    bench_compact(10_000);
    bench_compact(100_000);

    println!("\n=== Done ===");
}
