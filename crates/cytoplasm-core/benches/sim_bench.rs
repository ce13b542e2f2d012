//! Criterion benchmarks for the Cytoplasm simulation core.
//!
//! Three benchmark groups:
//! - `tick`: one fixed step over 1000 cells, threaded vs sequential
//! - `crowd`: one fixed step over 10000 cells, threaded vs sequential
//! - `snapshot`: capturing and encoding an economy snapshot

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use cytoplasm_core::config::ExecutionMode;
use cytoplasm_core::simulation::Simulation;
use cytoplasm_core::test_utils::*;
use cytoplasm_core::validation::EconomySnapshot;

fn build(mode: ExecutionMode, cells: usize) -> Simulation {
    let f = fixture();
    let mut sim = simulation(&f, config(mode));
    populate(&mut sim, &f, cells);
    // Settle the first tick so balances and marks are populated.
    sim.advance_one_fixed_step().unwrap();
    sim
}

fn bench_modes(c: &mut Criterion, group_name: &str, cells: usize) {
    let mut group = c.benchmark_group(group_name);
    for (label, mode) in [
        ("threaded", ExecutionMode::Threaded),
        ("sequential", ExecutionMode::Sequential),
    ] {
        let mut sim = build(mode, cells);
        group.bench_function(format!("{label}_{cells}_cells"), |b| {
            b.iter(|| sim.advance_one_fixed_step().unwrap());
        });
    }
    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    bench_modes(c, "tick", 1000);
}

fn bench_crowd(c: &mut Criterion) {
    bench_modes(c, "crowd", 10_000);
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let sim = build(ExecutionMode::Sequential, 1000);

    group.bench_function("capture_1000_cells", |b| {
        b.iter(|| EconomySnapshot::capture(&sim));
    });

    group.bench_function("encode_1000_cells", |b| {
        b.iter_batched(
            || EconomySnapshot::capture(&sim),
            |snapshot| snapshot.encode().unwrap(),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_tick, bench_crowd, bench_snapshot);
criterion_main!(benches);
