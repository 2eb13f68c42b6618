//! The parallel SpMV driver: nnz-balanced row partitioning, parallel
//! per-partition encoding, and the barrier-structured `y = alpha*A*x +
//! beta*y` iteration.
//!
//! Every multiply spawns one worker per partition. Within an iteration the
//! only synchronisation points are the barriers: B1 before the multiply,
//! B2 between the multiply and the scale phase, B3 at the end. Workers
//! write disjoint row slices of `y` and `tmp`; `x` is shared read-only.

use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::assemble::{assemble, CsxMatrix, PatternSummary};
use crate::config::EncodeOptions;
use crate::csr::CsrMatrix;
use crate::encode::Encoder;
use crate::error::{CsxError, CsxResult};
use crate::mem::{alloc_vec, verify_placement, Placement};
use crate::scalar::Scalar;
use crate::spm_model::SpmModel;
use crate::spmv::{execute, execute_sym, kernel_table, Kernel};

/// One worker's share of the matrix: its CSX block plus the kernel table
/// specialised to the block's unit kinds.
#[derive(Debug, Clone)]
pub struct EncodedThread<V> {
    pub csx: CsxMatrix<V>,
    pub(crate) kernels: Vec<Kernel>,
    pub summaries: Vec<PatternSummary>,
}

impl<V: Scalar> EncodedThread<V> {
    pub fn new(csx: CsxMatrix<V>, summaries: Vec<PatternSummary>) -> CsxResult<Self> {
        let kernels = kernel_table(&csx.id_map)?;
        Ok(EncodedThread {
            csx,
            kernels,
            summaries,
        })
    }
}

/// The multithreaded CSX matrix.
#[derive(Debug, Clone)]
pub struct SpmMt<V> {
    pub nrows: usize,
    pub ncols: usize,
    pub nnz: usize,
    pub threads: Vec<EncodedThread<V>>,
    pub placement: Placement,
}

impl<V: Scalar> SpmMt<V> {
    /// Partition `a` into `nthreads` nnz-balanced row ranges and encode
    /// every range on its own thread.
    pub fn from_csr(a: &CsrMatrix<V>, nthreads: usize, opts: &EncodeOptions) -> CsxResult<Self> {
        if nthreads == 0 {
            return Err(CsxError::Config("thread count must be positive".to_string()));
        }
        opts.validate()?;
        a.check_invariants()?;

        let started = Instant::now();
        let bounds = a.split_by_nnz(nthreads);
        let threads = encode_partitions(a, &bounds, opts, None)?;
        log::info!(
            "encoded {} nnz into {} partitions in {:.3}s ({} ctl bytes)",
            a.nnz(),
            threads.len(),
            started.elapsed().as_secs_f64(),
            threads.iter().map(|t| t.csx.ctl_size()).sum::<usize>()
        );

        Ok(SpmMt {
            nrows: a.nrows,
            ncols: a.ncols,
            nnz: a.nnz(),
            threads,
            placement: Placement::default(),
        })
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Bytes of the compressed representation (values plus ctl).
    pub fn compressed_size(&self) -> usize {
        self.threads
            .iter()
            .map(|t| t.csx.nnz * std::mem::size_of::<V>() + t.csx.ctl_size())
            .sum()
    }

    fn part_sizes(&self) -> Vec<usize> {
        self.threads.iter().map(|t| t.csx.nrows).collect()
    }

    /// One parallel iteration of `y = alpha*A*x + beta*y`.
    pub fn multiply(&self, x: &[V], alpha: V, y: &mut [V], beta: V) -> CsxResult<()> {
        if x.len() != self.ncols || y.len() != self.nrows {
            return Err(CsxError::BadInput(format!(
                "vector sizes {}/{} do not match the {}x{} matrix",
                x.len(),
                y.len(),
                self.nrows,
                self.ncols
            )));
        }

        let parts = self.part_sizes();
        let mut tmp: Vec<V> = alloc_vec(self.nrows, self.placement, &parts)?;
        verify_placement(self.placement, "temp vector");

        let barrier = Barrier::new(self.threads.len());
        let results = thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.threads.len());
            let mut tmp_rest: &mut [V] = &mut tmp;
            let mut y_rest: &mut [V] = y;
            for t in &self.threads {
                let (tmp_slice, rest) =
                    std::mem::take(&mut tmp_rest).split_at_mut(t.csx.nrows);
                tmp_rest = rest;
                let (y_slice, rest) = std::mem::take(&mut y_rest).split_at_mut(t.csx.nrows);
                y_rest = rest;
                let barrier = &barrier;
                handles.push(s.spawn(move || -> CsxResult<()> {
                    barrier.wait();
                    let r = execute(&t.csx, &t.kernels, x, tmp_slice);
                    barrier.wait();
                    if r.is_ok() {
                        scale_into(y_slice, tmp_slice, alpha, beta);
                    }
                    barrier.wait();
                    r
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("spmv worker panicked"))
                .collect::<Vec<_>>()
        });
        results.into_iter().collect::<CsxResult<Vec<()>>>()?;
        Ok(())
    }

    /// Validate against the CSR reference multiply over a few iterations
    /// with deterministic pseudo-random inputs; returns the largest
    /// relative componentwise error seen.
    pub fn check_against(&self, a: &CsrMatrix<V>, loops: usize) -> CsxResult<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut worst = 0.0f64;
        for _ in 0..loops.max(1) {
            let x: Vec<V> = (0..self.ncols)
                .map(|_| V::from_f64(rng.gen_range(-1000.0..1000.0)))
                .collect();
            let mut y = vec![V::zero(); self.nrows];
            self.multiply(&x, V::one(), &mut y, V::zero())?;

            let mut y_ref = vec![V::zero(); self.nrows];
            a.multiply_into(&x, &mut y_ref);

            for (got, want) in y.iter().zip(y_ref.iter()) {
                let denom = Scalar::to_f64(*want).abs().max(1.0);
                worst = worst.max((Scalar::to_f64(*got) - Scalar::to_f64(*want)).abs() / denom);
            }
        }
        Ok(worst)
    }

    /// Time `loops` multiply iterations; returns seconds.
    pub fn bench_loop(&self, loops: usize) -> CsxResult<f64> {
        let x: Vec<V> = (0..self.ncols)
            .map(|i| V::from_f64(1.0 + (i % 7) as f64))
            .collect();
        let mut y = vec![V::zero(); self.nrows];
        let started = Instant::now();
        for _ in 0..loops {
            self.multiply(&x, V::one(), &mut y, V::zero())?;
        }
        Ok(started.elapsed().as_secs_f64())
    }
}

/// The symmetric engine: per thread, the strictly lower triangle of its row
/// slice (CSX-encoded) plus the dense diagonal slice.
#[derive(Debug, Clone)]
pub struct SpmMtSym<V> {
    pub nrows: usize,
    pub ncols: usize,
    /// Nonzeros of the full (mirrored) matrix.
    pub nnz: usize,
    pub threads: Vec<SymThread<V>>,
    pub placement: Placement,
}

#[derive(Debug, Clone)]
pub struct SymThread<V> {
    pub encoded: EncodedThread<V>,
    pub dv: Vec<V>,
}

impl<V: Scalar> SpmMtSym<V> {
    pub fn from_csr(a: &CsrMatrix<V>, nthreads: usize, opts: &EncodeOptions) -> CsxResult<Self> {
        if nthreads == 0 {
            return Err(CsxError::Config("thread count must be positive".to_string()));
        }
        opts.validate()?;
        if !a.is_symmetric() {
            return Err(CsxError::BadInput(
                "symmetric engine requires a symmetric matrix".to_string(),
            ));
        }

        let (lower, diag) = a.lower_triangle();
        let bounds = lower.split_by_nnz(nthreads);
        let encoded = encode_partitions(&lower, &bounds, opts, None)?;
        let threads = encoded
            .into_iter()
            .map(|e| {
                let rs = e.csx.row_start;
                let re = rs + e.csx.nrows;
                let dv = diag[rs..re].to_vec();
                SymThread { encoded: e, dv }
            })
            .collect();

        Ok(SpmMtSym {
            nrows: a.nrows,
            ncols: a.ncols,
            nnz: a.nnz(),
            threads,
            placement: Placement::default(),
        })
    }

    pub fn compressed_size(&self) -> usize {
        self.threads
            .iter()
            .map(|t| {
                (t.encoded.csx.nnz + t.dv.len()) * std::mem::size_of::<V>()
                    + t.encoded.csx.ctl_size()
            })
            .sum()
    }

    /// One symmetric iteration. Phase one computes each thread's row-side
    /// products and mirrored contributions into its own scratch vector;
    /// after the compute barrier, the switch-reduction phase has every
    /// thread gather its peers' scratch slices into its own rows.
    pub fn multiply(&self, x: &[V], alpha: V, y: &mut [V], beta: V) -> CsxResult<()> {
        if x.len() != self.ncols || y.len() != self.nrows {
            return Err(CsxError::BadInput(format!(
                "vector sizes {}/{} do not match the {}x{} matrix",
                x.len(),
                y.len(),
                self.nrows,
                self.ncols
            )));
        }

        let parts: Vec<usize> = self.threads.iter().map(|t| t.encoded.csx.nrows).collect();
        let mut tmp: Vec<V> = alloc_vec(self.nrows, self.placement, &parts)?;
        let mut temps: Vec<Vec<V>> = Vec::with_capacity(self.threads.len());
        for _ in &self.threads {
            temps.push(alloc_vec(self.nrows, self.placement, &parts)?);
        }
        verify_placement(self.placement, "scratch vectors");

        // compute phase; the scope join is the B2 barrier
        let results = thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.threads.len());
            let mut tmp_rest: &mut [V] = &mut tmp;
            for (t, temp) in self.threads.iter().zip(temps.iter_mut()) {
                let (tmp_slice, rest) =
                    std::mem::take(&mut tmp_rest).split_at_mut(t.encoded.csx.nrows);
                tmp_rest = rest;
                handles.push(s.spawn(move || {
                    execute_sym(
                        &t.encoded.csx,
                        &t.encoded.kernels,
                        &t.dv,
                        x,
                        tmp_slice,
                        temp,
                    )
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("spmv worker panicked"))
                .collect::<Vec<_>>()
        });
        results.into_iter().collect::<CsxResult<Vec<()>>>()?;

        // switch-reduction phase: quiescent cross-thread reads
        let tmp = &tmp;
        let temps = &temps;
        thread::scope(|s| {
            let mut y_rest: &mut [V] = y;
            let mut start = 0usize;
            for t in &self.threads {
                let n = t.encoded.csx.nrows;
                let (y_slice, rest) = std::mem::take(&mut y_rest).split_at_mut(n);
                y_rest = rest;
                s.spawn(move || {
                    for i in 0..n {
                        let mut acc = tmp[start + i];
                        for temp in temps {
                            acc = acc + temp[start + i];
                        }
                        y_slice[i] = if beta == V::zero() {
                            alpha * acc
                        } else {
                            alpha * acc + beta * y_slice[i]
                        };
                    }
                });
                start += n;
            }
        });
        Ok(())
    }

    pub fn check_against(&self, a: &CsrMatrix<V>, loops: usize) -> CsxResult<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut worst = 0.0f64;
        for _ in 0..loops.max(1) {
            let x: Vec<V> = (0..self.ncols)
                .map(|_| V::from_f64(rng.gen_range(-1000.0..1000.0)))
                .collect();
            let mut y = vec![V::zero(); self.nrows];
            self.multiply(&x, V::one(), &mut y, V::zero())?;

            let mut y_ref = vec![V::zero(); self.nrows];
            a.multiply_into(&x, &mut y_ref);
            for (got, want) in y.iter().zip(y_ref.iter()) {
                let denom = Scalar::to_f64(*want).abs().max(1.0);
                worst = worst.max((Scalar::to_f64(*got) - Scalar::to_f64(*want)).abs() / denom);
            }
        }
        Ok(worst)
    }

    pub fn bench_loop(&self, loops: usize) -> CsxResult<f64> {
        let x: Vec<V> = (0..self.ncols)
            .map(|i| V::from_f64(1.0 + (i % 7) as f64))
            .collect();
        let mut y = vec![V::zero(); self.nrows];
        let started = Instant::now();
        for _ in 0..loops {
            self.multiply(&x, V::one(), &mut y, V::zero())?;
        }
        Ok(started.elapsed().as_secs_f64())
    }
}

fn scale_into<V: Scalar>(y: &mut [V], tmp: &[V], alpha: V, beta: V) {
    if beta == V::zero() {
        for (yi, &ti) in y.iter_mut().zip(tmp.iter()) {
            *yi = alpha * ti;
        }
    } else {
        for (yi, &ti) in y.iter_mut().zip(tmp.iter()) {
            *yi = alpha * ti + beta * *yi;
        }
    }
}

/// Encode every partition on its own thread (parallel preprocessing).
fn encode_partitions<V: Scalar>(
    a: &CsrMatrix<V>,
    bounds: &[usize],
    opts: &EncodeOptions,
    _cpu_set: Option<&[usize]>,
) -> CsxResult<Vec<EncodedThread<V>>> {
    let results = thread::scope(|s| {
        let mut handles = Vec::with_capacity(bounds.len() - 1);
        for w in bounds.windows(2) {
            let (rs, re) = (w[0], w[1]);
            let opts = opts.clone();
            handles.push(s.spawn(move || -> CsxResult<EncodedThread<V>> {
                let model = SpmModel::from_csr_window(a, rs, re);
                let mut encoder = Encoder::new(model, opts.clone())?;
                encoder.run()?;
                let (csx, summaries) =
                    assemble(&encoder.into_model(), opts.aligned_ctl, opts.full_column_indices)?;
                EncodedThread::new(csx, summaries)
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("encoder thread panicked"))
            .collect::<Vec<_>>()
    });
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_matrix(n: usize) -> CsrMatrix<f64> {
        let mut triples = Vec::new();
        for i in 0..n {
            triples.push((i, i, 2.0 + (i % 5) as f64));
            if i + 1 < n {
                triples.push((i, i + 1, 1.0));
            }
            if i >= 3 {
                triples.push((i, i - 3, -1.0));
            }
        }
        triples.sort_by_key(|&(r, c, _)| (r, c));
        CsrMatrix::from_sorted_triples(n, n, triples).unwrap()
    }

    fn symmetric_matrix(n: usize) -> CsrMatrix<f64> {
        let mut triples = Vec::new();
        for i in 0..n {
            triples.push((i, i, 4.0));
            if i >= 1 {
                let v = 1.0 + (i % 3) as f64;
                triples.push((i, i - 1, v));
                triples.push((i - 1, i, v));
            }
        }
        triples.sort_by_key(|&(r, c, _)| (r, c));
        CsrMatrix::from_sorted_triples(n, n, triples).unwrap()
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn multithread_matches_reference(#[case] nthreads: usize) {
        let a = sample_matrix(64);
        let m = SpmMt::from_csr(&a, nthreads, &EncodeOptions::default()).unwrap();
        assert_eq!(
            m.threads.iter().map(|t| t.csx.nnz).sum::<usize>(),
            a.nnz()
        );
        let worst = m.check_against(&a, 2).unwrap();
        assert!(worst < 1e-7, "relative error {worst}");
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    fn thread_counts_agree(#[case] nthreads: usize) {
        let a = sample_matrix(100);
        let x: Vec<f64> = (0..100).map(|i| (i as f64) / 3.0 - 5.0).collect();

        let single = SpmMt::from_csr(&a, 1, &EncodeOptions::default()).unwrap();
        let mut y1 = vec![0.0; 100];
        single.multiply(&x, 1.0, &mut y1, 0.0).unwrap();

        let multi = SpmMt::from_csr(&a, nthreads, &EncodeOptions::default()).unwrap();
        let mut yn = vec![0.0; 100];
        multi.multiply(&x, 1.0, &mut yn, 0.0).unwrap();

        for (a, b) in y1.iter().zip(yn.iter()) {
            assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0));
        }
    }

    #[test]
    fn alpha_beta_scaling() {
        let a = sample_matrix(10);
        let m = SpmMt::from_csr(&a, 2, &EncodeOptions::default()).unwrap();
        let x = vec![1.0; 10];

        let mut ax = vec![0.0; 10];
        m.multiply(&x, 1.0, &mut ax, 0.0).unwrap();

        let mut y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y0 = y.clone();
        m.multiply(&x, 2.0, &mut y, -1.0).unwrap();
        for i in 0..10 {
            assert!((y[i] - (2.0 * ax[i] - y0[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn interleaved_placement_matches_system() {
        let a = sample_matrix(40);
        let x = vec![1.5; 40];
        let m = SpmMt::from_csr(&a, 4, &EncodeOptions::default()).unwrap();
        let mut y_sys = vec![0.0; 40];
        m.multiply(&x, 1.0, &mut y_sys, 0.0).unwrap();

        let m = m.with_placement(Placement::Interleaved);
        let mut y_numa = vec![0.0; 40];
        m.multiply(&x, 1.0, &mut y_numa, 0.0).unwrap();
        assert_eq!(y_sys, y_numa);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn symmetric_engine_matches_reference(#[case] nthreads: usize) {
        let a = symmetric_matrix(48);
        let m = SpmMtSym::from_csr(&a, nthreads, &EncodeOptions::default()).unwrap();
        let worst = m.check_against(&a, 2).unwrap();
        assert!(worst < 1e-9, "relative error {worst}");
    }

    #[test]
    fn symmetric_engine_rejects_asymmetric_input() {
        let a = sample_matrix(16);
        let err = SpmMtSym::from_csr(&a, 2, &EncodeOptions::default()).unwrap_err();
        assert!(matches!(err, CsxError::BadInput(_)));
    }

    #[test]
    fn zero_threads_is_a_config_error() {
        let a = sample_matrix(8);
        assert!(matches!(
            SpmMt::from_csr(&a, 0, &EncodeOptions::default()),
            Err(CsxError::Config(_))
        ));
    }
}
