//! Canonical Compressed Sparse Row storage.
//!
//! The CSR matrix is the ingestion format: it is built once from sorted
//! triples, partitioned into per-thread row ranges, and discarded after the
//! per-thread CSX encodings are produced. The naive multiply here is the
//! validation reference only.

use crate::error::CsrError;
use crate::scalar::Scalar;

#[derive(Debug, Clone)]
pub struct CsrMatrix<V> {
    pub nrows: usize,
    pub ncols: usize,
    /// Row pointers, len = nrows + 1
    pub row_ptr: Vec<usize>,
    /// Column indices, len = nnz, strictly increasing within a row
    pub col_ind: Vec<usize>,
    /// Nonzero values, len = nnz
    pub values: Vec<V>,
}

impl<V: Scalar> CsrMatrix<V> {
    /// Build from a stream of zero-based `(row, col, value)` triples already
    /// sorted by `(row, col)`. Duplicate coordinates, out-of-range indices
    /// and ordering violations are rejected.
    pub fn from_sorted_triples(
        nrows: usize,
        ncols: usize,
        triples: impl IntoIterator<Item = (usize, usize, V)>,
    ) -> Result<Self, CsrError> {
        let mut row_ptr = vec![0usize; nrows + 1];
        let mut col_ind = Vec::new();
        let mut values = Vec::new();
        let mut prev: Option<(usize, usize)> = None;

        for (row, col, val) in triples {
            if row >= nrows {
                return Err(CsrError::OutOfBoundsIndex {
                    index: row,
                    max: nrows,
                });
            }
            if col >= ncols {
                return Err(CsrError::OutOfBoundsIndex {
                    index: col,
                    max: ncols,
                });
            }
            if let Some(p) = prev {
                if (row, col) == p {
                    return Err(CsrError::DuplicateEntry { row, col });
                }
                if (row, col) < p {
                    return Err(CsrError::EntriesNotSorted { row, col });
                }
            }
            prev = Some((row, col));
            row_ptr[row + 1] += 1;
            col_ind.push(col);
            values.push(val);
        }

        for i in 0..nrows {
            row_ptr[i + 1] += row_ptr[i];
        }

        let a = CsrMatrix {
            nrows,
            ncols,
            row_ptr,
            col_ind,
            values,
        };
        debug_assert!(a.check_invariants().is_ok());
        Ok(a)
    }

    pub fn nnz(&self) -> usize {
        self.col_ind.len()
    }

    /// Return (col_indices, values) for row i
    pub fn row(&self, i: usize) -> (&[usize], &[V]) {
        let (s, e) = (self.row_ptr[i], self.row_ptr[i + 1]);
        (&self.col_ind[s..e], &self.values[s..e])
    }

    pub fn check_invariants(&self) -> Result<(), CsrError> {
        if self.row_ptr.len() != self.nrows + 1 {
            return Err(CsrError::InvalidRowPointersLength {
                expected: self.nrows + 1,
                actual: self.row_ptr.len(),
            });
        }
        if self.row_ptr[0] != 0 {
            return Err(CsrError::InvalidRowPointers {
                index: 0,
                expected: 0,
                actual: self.row_ptr[0],
            });
        }
        if *self.row_ptr.last().unwrap() != self.nnz() {
            return Err(CsrError::InvalidRowPointers {
                index: self.nrows,
                expected: self.nnz(),
                actual: *self.row_ptr.last().unwrap(),
            });
        }
        if self.col_ind.len() != self.values.len() {
            return Err(CsrError::ColumnIndicesValuesLengthMismatch {
                values: self.values.len(),
                column_indices: self.col_ind.len(),
            });
        }
        // per-row monotone, sorted & in-range
        for i in 0..self.nrows {
            let (s, e) = (self.row_ptr[i], self.row_ptr[i + 1]);
            if s > e || e > self.nnz() {
                return Err(CsrError::InvalidRowPointers {
                    index: i,
                    expected: s,
                    actual: e,
                });
            }
            let mut prev = None;
            for &c in &self.col_ind[s..e] {
                if c >= self.ncols {
                    return Err(CsrError::OutOfBoundsIndex {
                        index: c,
                        max: self.ncols,
                    });
                }
                if let Some(p) = prev {
                    if c <= p {
                        return Err(CsrError::ColumnsNotStrictlyIncreasing {
                            index: i,
                            expected: p,
                            actual: c,
                        });
                    }
                }
                prev = Some(c);
            }
        }
        Ok(())
    }

    /// Row boundaries for `n_parts` partitions with roughly `nnz / n_parts`
    /// nonzeros each. Returns `n_parts + 1` boundaries; ranges are
    /// contiguous, non-overlapping and cover `[0, nrows)`. Trailing
    /// partitions may be empty for very small matrices.
    pub fn split_by_nnz(&self, n_parts: usize) -> Vec<usize> {
        assert!(n_parts > 0);
        let target = (self.nnz() / n_parts).max(1);
        let mut bounds = Vec::with_capacity(n_parts + 1);
        bounds.push(0);

        let mut acc = 0;
        for i in 0..self.nrows {
            if bounds.len() == n_parts {
                break;
            }
            acc += self.row_ptr[i + 1] - self.row_ptr[i];
            if acc >= target {
                bounds.push(i + 1);
                acc = 0;
            }
        }
        while bounds.len() < n_parts + 1 {
            bounds.push(self.nrows);
        }
        bounds
    }

    /// Naive reference multiply `y = A * x`, used by tests and `--check`.
    pub fn multiply_into(&self, x: &[V], y: &mut [V]) {
        assert_eq!(x.len(), self.ncols);
        assert_eq!(y.len(), self.nrows);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            let mut acc = V::zero();
            for (&c, &v) in cols.iter().zip(vals.iter()) {
                acc = acc + v * x[c];
            }
            y[i] = acc;
        }
    }

    /// Split into the strictly lower triangle and the diagonal, the storage
    /// halves of the symmetric engine. Off-band upper entries are dropped;
    /// the caller is expected to have verified symmetry.
    pub fn lower_triangle(&self) -> (CsrMatrix<V>, Vec<V>) {
        let mut diag = vec![V::zero(); self.nrows.min(self.ncols)];
        let mut row_ptr = vec![0usize; self.nrows + 1];
        let mut col_ind = Vec::new();
        let mut values = Vec::new();

        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals.iter()) {
                if c < i {
                    col_ind.push(c);
                    values.push(v);
                } else if c == i {
                    diag[i] = v;
                }
            }
            row_ptr[i + 1] = col_ind.len();
        }

        let lower = CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            row_ptr,
            col_ind,
            values,
        };
        (lower, diag)
    }

    /// Structural and numerical symmetry check (exact equality; symmetric
    /// inputs come from symmetric MMF files, so no tolerance is involved).
    pub fn is_symmetric(&self) -> bool {
        if self.nrows != self.ncols {
            return false;
        }
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals.iter()) {
                if c >= i {
                    continue;
                }
                let (rcols, rvals) = self.row(c);
                match rcols.binary_search(&i) {
                    Ok(pos) if rvals[pos] == v => {}
                    _ => return false,
                }
            }
        }
        // every upper entry must have a stored mirror too
        let mut lower_cnt = 0usize;
        let mut upper_cnt = 0usize;
        for i in 0..self.nrows {
            for &c in self.row(i).0 {
                if c < i {
                    lower_cnt += 1;
                } else if c > i {
                    upper_cnt += 1;
                }
            }
        }
        lower_cnt == upper_cnt
    }
}
