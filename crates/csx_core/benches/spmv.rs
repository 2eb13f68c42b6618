use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use csx_core::{CsrMatrix, EncodeOptions, SpmMt};

/// Five-point-stencil-like band matrix, the classic SpMV workload shape.
fn band_matrix(n: usize) -> CsrMatrix<f64> {
    let offsets: [isize; 5] = [-16, -1, 0, 1, 16];
    let mut triples = Vec::new();
    for i in 0..n as isize {
        for &o in &offsets {
            let j = i + o;
            if (0..n as isize).contains(&j) {
                triples.push((i as usize, j as usize, 1.0 + (o.unsigned_abs() as f64)));
            }
        }
    }
    triples.sort_by_key(|&(r, c, _)| (r, c));
    CsrMatrix::from_sorted_triples(n, n, triples).unwrap()
}

fn bench_encode(c: &mut Criterion) {
    let a = band_matrix(20_000);
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(a.nnz() as u64));
    group.sample_size(10);
    for threads in [1usize, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| SpmMt::from_csr(&a, threads, &EncodeOptions::default()).unwrap())
            },
        );
    }
    group.finish();
}

fn bench_multiply(c: &mut Criterion) {
    let a = band_matrix(20_000);
    let x: Vec<f64> = (0..a.ncols).map(|i| 1.0 + (i % 9) as f64 * 0.25).collect();
    let mut group = c.benchmark_group("spmv");
    group.throughput(Throughput::Elements(a.nnz() as u64));
    for threads in [1usize, 2, 4] {
        let m = SpmMt::from_csr(&a, threads, &EncodeOptions::default()).unwrap();
        let mut y = vec![0.0; a.nrows];
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, _| b.iter(|| m.multiply(&x, 1.0, &mut y, 0.0).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_multiply);
criterion_main!(benches);
