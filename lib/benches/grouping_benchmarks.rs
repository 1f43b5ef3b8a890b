//! Grouping benchmarks
//!
//! Run with: cargo bench

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use filament_group::grouping::{FlushDistanceEvaluator, KMedoids2, PAM_TIMEOUT};
use filament_group::tool_order::reorder_filaments_for_minimum_flush_volume;
use filament_group::{Color, FilamentGroup, FilamentGroupContext, FilamentInfo, FlushMatrix, GroupStrategy};

fn flush_matrix(n: usize) -> FlushMatrix {
    let mut m = FlushMatrix::new(n, 0.0);
    for a in 0..n {
        for b in 0..n {
            if a != b {
                m.set(a, b, 50.0 + ((a * 37 + b * 91) % 500) as f32);
            }
        }
    }
    m
}

fn context(n: usize, layers: usize) -> FilamentGroupContext {
    let info = (0..n)
        .map(|i| FilamentInfo::new(Color::rgb((i * 20) as u8, 128, (255 - i * 20) as u8), "PLA"))
        .collect();
    let layer_filaments = (0..layers).map(|l| (0..n).filter(|f| (f + l) % 4 != 0).collect()).collect();
    FilamentGroupContext::new(vec![flush_matrix(n), flush_matrix(n)], layer_filaments, info)
}

fn enumeration_benchmark(c: &mut Criterion) {
    let ctx = context(8, 50);
    c.bench_function("enumerate 8 filaments", |b| {
        b.iter(|| {
            let mut fg = FilamentGroup::new(ctx.clone()).unwrap();
            black_box(fg.calc_filament_group())
        })
    });
}

fn reorder_benchmark(c: &mut Criterion) {
    let ctx = context(10, 200);
    let used: Vec<usize> = (0..10).collect();
    let labels: Vec<usize> = used.iter().map(|f| f % 2).collect();
    c.bench_function("reorder 10 filaments over 200 layers", |b| {
        b.iter(|| {
            black_box(reorder_filaments_for_minimum_flush_volume(
                &used,
                &labels,
                &ctx.model_info.layer_filaments,
                &ctx.model_info.flush_matrix,
                None,
            ))
        })
    });
}

fn pam_benchmark(c: &mut Criterion) {
    let ctx = context(12, 100);
    let used: Vec<usize> = (0..12).collect();
    let eval = FlushDistanceEvaluator::new(&ctx.model_info.flush_matrix, &used, &ctx.model_info.layer_filaments);

    let mut group = c.benchmark_group("pam");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("two-way 12 filaments", |b| {
        b.iter(|| {
            let mut pam = KMedoids2::new(used.len(), &eval, 0);
            pam.do_clustering(GroupStrategy::BestCost, PAM_TIMEOUT);
            black_box(pam.cluster_labels().to_vec())
        })
    });
    group.finish();
}

criterion_group!(benches, enumeration_benchmark, reorder_benchmark, pam_benchmark);
criterion_main!(benches);
