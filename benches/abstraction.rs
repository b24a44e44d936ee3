//! List abstraction and join benchmarks.
//!
//! Lists of growing length are summarized, and the summaries of two lists of
//! different lengths are joined and compared.
//!
//! Run with:
//! ```bash
//! cargo bench --bench abstraction
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use smg_rs::machine::MachineModel;
use smg_rs::options::SmgOptions;
use smg_rs::state::SmgState;
use smg_rs::types::Value;

const LENGTHS: [usize; 4] = [4, 16, 64, 256];

// ============================================================================
// Helper: a global `head` pointing to a null-terminated list
// ============================================================================

fn build_list(length: usize) -> SmgState {
    let state = SmgState::new(MachineModel::LINUX64, SmgOptions::default());
    let (mut state, head) = state.add_global_variable(8, "head").unwrap();
    let mut next = Value::NULL;
    for _ in 0..length {
        let (s, node) = state.alloc_heap(16, "node").unwrap();
        let object = s.graph().pointer(node).unwrap().object;
        state = s.write(object, 0, 8, Value::NULL).unwrap().write(object, 8, 8, next).unwrap();
        next = node;
    }
    state.write(head, 0, 8, next).unwrap()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_abstraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("abstract_lists");

    for length in LENGTHS {
        let list = build_list(length);
        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::new("length", length), &list, |b, list| {
            b.iter(|| list.abstract_lists().unwrap());
        });
    }

    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");

    let short = build_list(2).abstract_lists().unwrap().prune_unreachable().unwrap();
    for length in LENGTHS {
        let long = build_list(length).abstract_lists().unwrap().prune_unreachable().unwrap();
        group.bench_with_input(BenchmarkId::new("summaries", length), &long, |b, long| {
            b.iter(|| long.join(&short).unwrap());
        });
    }

    group.finish();
}

fn bench_inclusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_less_or_equal");
    group.sample_size(20);

    for length in LENGTHS {
        let concrete = build_list(length);
        let summary = concrete.abstract_lists().unwrap();
        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::new("concrete_vs_summary", length), &(concrete, summary), |b, (concrete, summary)| {
            b.iter(|| concrete.is_less_or_equal(summary));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_abstraction, bench_join, bench_inclusion);
criterion_main!(benches);
