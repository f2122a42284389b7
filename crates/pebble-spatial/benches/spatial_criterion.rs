//! Point index benchmarks using criterion.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pebble_spatial::{Point3, PointIndex};
use rand::{Rng, SeedableRng, rngs::StdRng};

fn random_points(count: usize) -> Vec<(String, Point3)> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    (0..count)
        .map(|i| {
            let p = Point3::new(
                rng.gen_range(-1000.0..1000.0),
                rng.gen_range(-1000.0..1000.0),
                rng.gen_range(-1000.0..1000.0),
            );
            (format!("body-{i}"), p)
        })
        .collect()
}

fn build_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");

    for count in [1_000, 10_000, 100_000] {
        let points = random_points(count);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("rebuild", count), &points, |b, points| {
            b.iter(|| {
                let mut index = PointIndex::new();
                index.rebuild(points.iter().cloned());
                black_box(index.len())
            });
        });
    }

    group.finish();
}

fn query_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for count in [1_000, 10_000, 100_000] {
        let mut index = PointIndex::new();
        index.rebuild(random_points(count));
        let origin = Point3::new(12.5, -40.0, 300.0);

        group.bench_with_input(BenchmarkId::new("nearest_8", count), &index, |b, index| {
            b.iter(|| black_box(index.nearest(black_box(&origin), 8)));
        });

        group.bench_with_input(BenchmarkId::new("within_100", count), &index, |b, index| {
            b.iter(|| black_box(index.within(black_box(&origin), 100.0)));
        });
    }

    group.finish();
}

fn churn_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    let points = random_points(10_000);

    group.bench_function("move_1000", |b| {
        let mut index = PointIndex::new();
        index.rebuild(points.iter().cloned());
        let mut step = 0.0;
        b.iter(|| {
            step += 1.0;
            for (key, p) in points.iter().take(1000) {
                index.upsert(key, Point3::new(p.x + step, p.y, p.z));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, build_benchmarks, query_benchmarks, churn_benchmarks);
criterion_main!(benches);
