//! The row-rewrite intermediate between CSR and the final CSX stream.
//!
//! The model holds one row vector per row of the *current* iteration
//! order's space. Encoding passes transform the model into an order, replace
//! qualifying runs with pattern elements, and transform back; pattern
//! elements travel through transforms as their seed coordinate.

use crate::coords::{Coord, IterationOrder};
use crate::csr::CsrMatrix;
use crate::error::{CsxError, CsxResult};
use crate::patterns::Pattern;
use crate::scalar::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub enum RowElem<V> {
    Plain {
        col: usize,
        value: V,
    },
    /// A pattern seed carrying the scalars the pattern subsumes, in
    /// generator order.
    Encoded {
        col: usize,
        pattern: Pattern,
        vals: Vec<V>,
    },
}

impl<V> RowElem<V> {
    pub fn col(&self) -> usize {
        match self {
            RowElem::Plain { col, .. } => *col,
            RowElem::Encoded { col, .. } => *col,
        }
    }

    fn set_col(&mut self, new_col: usize) {
        match self {
            RowElem::Plain { col, .. } => *col = new_col,
            RowElem::Encoded { col, .. } => *col = new_col,
        }
    }

    /// Nonzeros this element accounts for.
    pub fn nnz(&self) -> usize {
        match self {
            RowElem::Plain { .. } => 1,
            RowElem::Encoded { pattern, .. } => pattern.size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpmModel<V> {
    /// Horizontal row count of the window; fixed across transforms.
    nrows: usize,
    ncols: usize,
    nnz: usize,
    /// Global index of the window's first row.
    row_start: usize,
    order: IterationOrder,
    /// Rows of the current order's space; local indices.
    pub(crate) rows: Vec<Vec<RowElem<V>>>,
}

impl<V: Scalar> SpmModel<V> {
    /// Build the model for the CSR row window `[rs, re)`.
    pub fn from_csr_window(a: &CsrMatrix<V>, rs: usize, re: usize) -> Self {
        assert!(rs <= re && re <= a.nrows);
        let mut rows = Vec::with_capacity(re - rs);
        let mut nnz = 0;
        for i in rs..re {
            let (cols, vals) = a.row(i);
            nnz += cols.len();
            rows.push(
                cols.iter()
                    .zip(vals.iter())
                    .map(|(&col, &value)| RowElem::Plain { col, value })
                    .collect(),
            );
        }
        SpmModel {
            nrows: re - rs,
            ncols: a.ncols,
            nnz,
            row_start: rs,
            order: IterationOrder::Horizontal,
            rows,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    pub fn row_start(&self) -> usize {
        self.row_start
    }

    pub fn order(&self) -> IterationOrder {
        self.order
    }

    /// Number of rows in the current order's space.
    pub fn n_order_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, i: usize) -> &[RowElem<V>] {
        &self.rows[i]
    }

    /// Switch the model to iteration order `to`: map every element's
    /// coordinate, re-sort row-major, rebuild the row vectors.
    pub fn transform(&mut self, to: IterationOrder) {
        if to == self.order {
            return;
        }
        let r = self.nrows;
        let from = self.order;

        let mut elems: Vec<(Coord, RowElem<V>)> = Vec::with_capacity(self.nnz);
        for (ri, row) in std::mem::take(&mut self.rows).into_iter().enumerate() {
            for e in row {
                let horiz = from.unmap(r, Coord::new(ri, e.col()));
                let mapped = to.map(r, horiz);
                elems.push((mapped, e));
            }
        }
        elems.sort_unstable_by_key(|(c, _)| *c);

        let mut order_rows = elems.last().map_or(0, |(c, _)| c.row + 1);
        if to == IterationOrder::Horizontal {
            // keep trailing empty rows so the window height is stable
            order_rows = self.nrows;
        }
        let mut rows: Vec<Vec<RowElem<V>>> = vec![Vec::new(); order_rows];
        for (coord, mut e) in elems {
            e.set_col(coord.col);
            rows[coord.row].push(e);
        }

        self.rows = rows;
        self.order = to;
    }

    /// Clone a horizontal sub-window `[rs, re)` of this model; used by the
    /// statistics sampler.
    pub fn window(&self, rs: usize, re: usize) -> SpmModel<V> {
        assert_eq!(self.order, IterationOrder::Horizontal);
        assert!(rs <= re && re <= self.rows.len());
        let rows: Vec<Vec<RowElem<V>>> = self.rows[rs..re].to_vec();
        let nnz = rows.iter().flatten().map(RowElem::nnz).sum();
        SpmModel {
            nrows: re - rs,
            ncols: self.ncols,
            nnz,
            row_start: self.row_start + rs,
            order: IterationOrder::Horizontal,
            rows,
        }
    }

    /// Collapse a fully decoded (pattern-free, horizontal) model back into
    /// CSR form. Test and round-trip helper.
    pub fn to_csr(&self) -> CsxResult<CsrMatrix<V>> {
        if self.order != IterationOrder::Horizontal {
            return Err(CsxError::BadInput(
                "model must be in horizontal order".to_string(),
            ));
        }
        let mut triples = Vec::with_capacity(self.nnz);
        for (ri, row) in self.rows.iter().enumerate() {
            for e in row {
                match e {
                    RowElem::Plain { col, value } => triples.push((ri, *col, *value)),
                    RowElem::Encoded { .. } => {
                        return Err(CsxError::BadInput(
                            "model still contains pattern elements".to_string(),
                        ))
                    }
                }
            }
        }
        let mut a = CsrMatrix::from_sorted_triples(self.rows.len(), self.ncols, triples)?;
        // preserve the window height even when trailing rows are empty
        if a.nrows < self.nrows {
            a.row_ptr.resize(self.nrows + 1, a.nnz());
            a.nrows = self.nrows;
        }
        Ok(a)
    }

    pub(crate) fn assert_nnz_preserved(&self) {
        if cfg!(debug_assertions) {
            let total: usize = self.rows.iter().flatten().map(RowElem::nnz).sum();
            debug_assert_eq!(total, self.nnz, "rewrite changed the nonzero count");
        }
    }
}
