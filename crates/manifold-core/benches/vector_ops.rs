//! Benchmarks for fused expressions, reductions and sparse products
//!
//! Runs on simulated CPU contexts with equal partitioning, so numbers
//! reflect dispatch and interpreter cost rather than real hardware.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use manifold_core::expr::{cos, sqrt};
use manifold_core::{partition_equally, set_partitioning, Context, DeviceVector, ReduceOp, Reductor, SpMat};

fn contexts(n: usize) -> Vec<Context> {
    let _ = set_partitioning(partition_equally);
    (0..n).map(|_| Context::cpu()).collect()
}

fn benchmark_fused_expression(c: &mut Criterion) {
    let mut group = c.benchmark_group("fused_expression");
    let ctx = contexts(2);

    for size in [1024, 16384, 65536].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let x = DeviceVector::from_slice(&ctx, &vec![0.5f32; size]).unwrap();
            let y = DeviceVector::from_slice(&ctx, &vec![0.25f32; size]).unwrap();
            let z = DeviceVector::new(&ctx, size).unwrap();

            b.iter(|| {
                z.assign(sqrt(2.0 * &x) + cos(&y)).unwrap();
                z.finish().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_reduce_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_sum");
    let ctx = contexts(2);

    for size in [1024, 16384, 65536].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let x = DeviceVector::from_slice(&ctx, &vec![1.0f64; size]).unwrap();
            let total = Reductor::new(&ctx, ReduceOp::Sum).unwrap();

            b.iter(|| total.apply(&x * &x).unwrap());
        });
    }

    group.finish();
}

fn benchmark_spmv(c: &mut Criterion) {
    let mut group = c.benchmark_group("spmv_tridiagonal");
    let ctx = contexts(2);

    for size in [1024, 16384].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut row = vec![0];
            let mut col = Vec::new();
            for i in 0..size {
                col.extend(i.saturating_sub(1)..(i + 2).min(size));
                row.push(col.len());
            }
            let val = vec![1.0f32; col.len()];
            let a = SpMat::new(&ctx, size, size, &row, &col, &val).unwrap();
            let x = DeviceVector::from_slice(&ctx, &vec![1.0f32; size]).unwrap();
            let y = DeviceVector::new(&ctx, size).unwrap();

            b.iter(|| {
                y.assign(&a * &x).unwrap();
                y.finish().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_fused_expression, benchmark_reduce_sum, benchmark_spmv);
criterion_main!(benches);
