//! Assembly of the final per-thread CSX representation: walk the rewritten
//! rows in horizontal order and emit the ctl stream plus the value array.
//!
//! Ctl rules: each unit leaves the column cursor at the last element it
//! touched on the current row, and `size` is the number of elements the
//! unit computes. Every unit that opens a row carries NEW_ROW; rows jumps
//! count the rows advanced since the previous non-empty row.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::coords::IterationOrder;
use crate::ctl::{
    CtlBuilder, DeltaWidth, CTL_NEW_ROW, CTL_PATTERNS_MAX, CTL_ROW_JUMP,
};
use crate::error::{CsxError, CsxResult};
use crate::patterns::Pattern;
use crate::rle::delta_encode;
use crate::scalar::Scalar;
use crate::spm_model::{RowElem, SpmModel};

/// Per-thread CSX entity: the compact representation one executor consumes.
/// Immutable after assembly.
#[derive(Debug, Clone)]
pub struct CsxMatrix<V> {
    /// Rows assigned to this thread.
    pub nrows: usize,
    pub ncols: usize,
    pub nnz: usize,
    /// Global index of the first assigned row.
    pub row_start: usize,
    pub ctl: Vec<u8>,
    /// Values in executor consumption order.
    pub values: Vec<V>,
    /// Local unit tag -> global pattern id.
    pub id_map: Vec<u32>,
    pub aligned: bool,
    pub full_column_indices: bool,
    pub row_jumps: bool,
}

impl<V> CsxMatrix<V> {
    pub fn ctl_size(&self) -> usize {
        self.ctl.len()
    }
}

/// How often each pattern was used in one thread's encoding.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PatternSummary {
    pub pattern_id: u32,
    pub nnz: usize,
    pub npatterns: usize,
}

/// Assemble the horizontal model into a CSX matrix. Consumes the model's
/// element order as-is; the encoder has already fixed the unit layout.
pub fn assemble<V: Scalar>(
    model: &SpmModel<V>,
    aligned: bool,
    full_column_indices: bool,
) -> CsxResult<(CsxMatrix<V>, Vec<PatternSummary>)> {
    assert_eq!(model.order(), IterationOrder::Horizontal);

    let mut asm = Assembler {
        builder: CtlBuilder::new(),
        values: Vec::with_capacity(model.nnz()),
        patterns: BTreeMap::new(),
        flag_avail: 0,
        last_col: 0,
        pending_row_jump: None,
        row_jumps: false,
        aligned,
        full_column_indices,
    };

    let mut prev_row: Option<usize> = None;
    for i in 0..model.n_order_rows() {
        let row = model.row(i);
        if row.is_empty() {
            continue;
        }
        let jump = match prev_row {
            None => i + 1,
            Some(p) => i - p,
        };
        asm.pending_row_jump = Some(jump);
        asm.last_col = 0;
        asm.do_row(row)?;
        prev_row = Some(i);
    }

    if asm.values.len() != model.nnz() {
        return Err(CsxError::BadInput(format!(
            "assembled {} values for {} nonzeros",
            asm.values.len(),
            model.nnz()
        )));
    }

    let mut id_map = vec![0u32; asm.patterns.len()];
    let mut summaries = Vec::with_capacity(asm.patterns.len());
    for (&pattern_id, info) in &asm.patterns {
        id_map[info.flag as usize] = pattern_id;
        summaries.push(PatternSummary {
            pattern_id,
            nnz: info.nnz,
            npatterns: info.npatterns,
        });
    }

    let csx = CsxMatrix {
        nrows: model.nrows(),
        ncols: model.ncols(),
        nnz: model.nnz(),
        row_start: model.row_start(),
        ctl: asm.builder.finish(),
        values: asm.values,
        id_map,
        aligned,
        full_column_indices,
        row_jumps: asm.row_jumps,
    };
    Ok((csx, summaries))
}

struct PatInfo {
    flag: u8,
    nnz: usize,
    npatterns: usize,
}

enum PrepJump {
    /// Jump from the running column to the unit's seed.
    FromLastCol,
    /// The unit annexes the preceding plain element at this column.
    Annex { head_col: usize },
}

struct Assembler<V> {
    builder: CtlBuilder,
    values: Vec<V>,
    patterns: BTreeMap<u32, PatInfo>,
    flag_avail: u8,
    last_col: usize,
    /// Rows advanced since the previous non-empty row; emitted with the
    /// next unit header.
    pending_row_jump: Option<usize>,
    row_jumps: bool,
    aligned: bool,
    full_column_indices: bool,
}

impl<V: Scalar> Assembler<V> {
    fn do_row(&mut self, row: &[RowElem<V>]) -> CsxResult<()> {
        let mut xs: Vec<usize> = Vec::new();
        for e in row {
            match e {
                RowElem::Plain { col, value } => {
                    if xs.len() == crate::config::UNIT_SIZE_MAX {
                        self.add_plain_unit(&mut xs)?;
                    }
                    xs.push(*col);
                    self.values.push(*value);
                }
                RowElem::Encoded { col, pattern, vals } => {
                    debug_assert_eq!(vals.len(), pattern.size());
                    let prep = self.prepare_pattern(&mut xs, *col, pattern)?;
                    self.add_pattern_unit(*col, pattern, prep)?;
                    self.values.extend_from_slice(vals);
                }
            }
        }
        if !xs.is_empty() {
            self.add_plain_unit(&mut xs)?;
        }
        Ok(())
    }

    /// Flush the pending plain run, possibly annexing its last element into
    /// the upcoming unit when the pattern directly continues it. Only
    /// horizontal patterns annex; the stream is assembled in horizontal
    /// order and any other family starts a fresh position.
    fn prepare_pattern(
        &mut self,
        xs: &mut Vec<usize>,
        seed_col: usize,
        pattern: &Pattern,
    ) -> CsxResult<PrepJump> {
        let Some(&last) = xs.last() else {
            return Ok(PrepJump::FromLastCol);
        };
        if pattern.order() != IterationOrder::Horizontal
            || pattern.size() + 1 > crate::config::UNIT_SIZE_MAX
            || last + pattern.delta() != seed_col
        {
            self.add_plain_unit(xs)?;
            return Ok(PrepJump::FromLastCol);
        }
        xs.pop();
        if !xs.is_empty() {
            self.add_plain_unit(xs)?;
        }
        Ok(PrepJump::Annex { head_col: last })
    }

    fn add_pattern_unit(
        &mut self,
        seed_col: usize,
        pattern: &Pattern,
        prep: PrepJump,
    ) -> CsxResult<()> {
        let (unit_size, start_col) = match prep {
            // the annexed element is computed by this unit as well
            PrepJump::Annex { head_col } => (pattern.size() + 1, head_col),
            PrepJump::FromLastCol => (pattern.size(), seed_col),
        };
        debug_assert!(unit_size <= crate::config::UNIT_SIZE_MAX);

        let flag = self.unit_flag(pattern.pattern_id(), pattern.size())?;
        self.emit_header(flag, unit_size as u8);
        self.emit_column_jump(start_col);
        self.last_col = pattern.resume_column(seed_col);
        Ok(())
    }

    /// Emit the gathered plain run as one delta unit: jump, then the run's
    /// deltas packed at the smallest width that fits their maximum.
    fn add_plain_unit(&mut self, xs: &mut Vec<usize>) -> CsxResult<()> {
        debug_assert!(!xs.is_empty());
        let size = xs.len();
        let deltas = delta_encode(xs, self.last_col);

        let max_delta = deltas[1..].iter().copied().max().unwrap_or(0) as u64;
        let width = DeltaWidth::fit(max_delta);
        let flag = self.unit_flag(width.bits(), size)?;

        self.emit_header(flag, size as u8);
        self.emit_column_jump(xs[0]);
        self.last_col = *xs.last().unwrap();
        if size > 1 {
            if self.aligned {
                self.builder.align_to(width);
            }
            for &d in &deltas[1..] {
                self.builder.put_fixed(width, d as u64);
            }
        }
        xs.clear();
        Ok(())
    }

    fn emit_header(&mut self, flag: u8, size: u8) {
        let at = self.builder.push_unit_header(flag, size);
        if let Some(jump) = self.pending_row_jump.take() {
            self.builder.set_flag(at, CTL_NEW_ROW);
            if jump != 1 {
                self.builder.set_flag(at, CTL_ROW_JUMP);
                self.builder.put_varint(jump as u64);
                self.row_jumps = true;
            }
        }
    }

    fn emit_column_jump(&mut self, start_col: usize) {
        if self.full_column_indices {
            self.builder.put_u32(start_col as u32);
        } else {
            self.builder.put_varint((start_col - self.last_col) as u64);
        }
    }

    fn unit_flag(&mut self, pattern_id: u32, nnz: usize) -> CsxResult<u8> {
        if let Some(info) = self.patterns.get_mut(&pattern_id) {
            info.nnz += nnz;
            info.npatterns += 1;
            return Ok(info.flag);
        }
        if self.flag_avail as usize == CTL_PATTERNS_MAX {
            return Err(CsxError::Config(format!(
                "more than {CTL_PATTERNS_MAX} distinct unit kinds in one thread"
            )));
        }
        let flag = self.flag_avail;
        self.flag_avail += 1;
        self.patterns.insert(
            pattern_id,
            PatInfo {
                flag,
                nnz,
                npatterns: 1,
            },
        );
        Ok(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CsrMatrix;
    use crate::ctl::CtlCursor;

    fn assemble_csr(a: &CsrMatrix<f64>) -> CsxMatrix<f64> {
        let model = SpmModel::from_csr_window(a, 0, a.nrows);
        assemble(&model, false, false).unwrap().0
    }

    #[test]
    fn identity_stream_layout() {
        let triples: Vec<(usize, usize, f64)> = (0..4).map(|i| (i, i, 1.0)).collect();
        let a = CsrMatrix::from_sorted_triples(4, 4, triples).unwrap();
        let csx = assemble_csr(&a);

        assert_eq!(csx.nnz, 4);
        assert_eq!(csx.id_map, vec![8]); // one u8-delta unit kind
        assert!(!csx.row_jumps);

        // four units: flags, size=1, column jump = row index
        let mut c = CtlCursor::new(&csx.ctl);
        for row in 0..4u64 {
            let flags = c.u8().unwrap();
            let size = c.u8().unwrap();
            assert_ne!(flags & CTL_NEW_ROW, 0);
            assert_eq!(flags & CTL_ROW_JUMP, 0);
            assert_eq!(size, 1);
            assert_eq!(c.varint().unwrap(), row); // x resets each row
        }
        assert!(c.at_end());
    }

    #[test]
    fn empty_rows_become_row_jumps() {
        let a = CsrMatrix::from_sorted_triples(
            6,
            6,
            vec![(1, 2, 1.0), (4, 0, 2.0)],
        )
        .unwrap();
        let csx = assemble_csr(&a);
        assert!(csx.row_jumps);

        let mut c = CtlCursor::new(&csx.ctl);
        // first unit: one leading empty row -> jump 2
        let flags = c.u8().unwrap();
        let _size = c.u8().unwrap();
        assert_ne!(flags & CTL_ROW_JUMP, 0);
        assert_eq!(c.varint().unwrap(), 2);
        assert_eq!(c.varint().unwrap(), 2); // column jump

        // second unit: rows 2..3 empty -> jump 3
        let flags = c.u8().unwrap();
        let _size = c.u8().unwrap();
        assert_ne!(flags & CTL_ROW_JUMP, 0);
        assert_eq!(c.varint().unwrap(), 3);
        assert_eq!(c.varint().unwrap(), 0);
        assert!(c.at_end());
    }

    #[test]
    fn wide_deltas_use_wider_class() {
        let a = CsrMatrix::from_sorted_triples(
            1,
            100_000,
            vec![(0, 0, 1.0), (0, 300, 2.0), (0, 600, 3.0)],
        )
        .unwrap();
        let csx = assemble_csr(&a);
        assert_eq!(csx.id_map, vec![16]);

        let mut c = CtlCursor::new(&csx.ctl);
        let _flags = c.u8().unwrap();
        assert_eq!(c.u8().unwrap(), 3);
        assert_eq!(c.varint().unwrap(), 0);
        assert_eq!(c.fixed(DeltaWidth::U16).unwrap(), 300);
        assert_eq!(c.fixed(DeltaWidth::U16).unwrap(), 300);
    }

    #[test]
    fn long_rows_split_at_unit_cap() {
        let triples: Vec<(usize, usize, f64)> =
            (0..300).map(|c| (0, 2 * c, 1.0)).collect();
        let a = CsrMatrix::from_sorted_triples(1, 600, triples).unwrap();
        let csx = assemble_csr(&a);

        let mut c = CtlCursor::new(&csx.ctl);
        let _flags = c.u8().unwrap();
        assert_eq!(c.u8().unwrap() as usize, crate::config::UNIT_SIZE_MAX);
    }

    #[test]
    fn horizontal_pattern_annexes_run_head() {
        use crate::spm_model::RowElem;

        let a = CsrMatrix::from_sorted_triples(
            1,
            16,
            (0..5).map(|c| (0, c, c as f64)).collect::<Vec<_>>(),
        )
        .unwrap();
        let mut model = SpmModel::from_csr_window(&a, 0, 1);
        // hand-built rewrite: head at col 0, pattern covering cols 1..=4
        model.rows[0] = vec![
            RowElem::Plain { col: 0, value: 0.0 },
            RowElem::Encoded {
                col: 1,
                pattern: Pattern::delta_run(IterationOrder::Horizontal, 1, 4),
                vals: vec![1.0, 2.0, 3.0, 4.0],
            },
        ];
        let (csx, summaries) = assemble(&model, false, false).unwrap();

        // a single unit of size 5 jumping straight to the head
        let mut c = CtlCursor::new(&csx.ctl);
        let flags = c.u8().unwrap();
        assert_ne!(flags & CTL_NEW_ROW, 0);
        assert_eq!(c.u8().unwrap(), 5);
        assert_eq!(c.varint().unwrap(), 0);
        assert!(c.at_end());

        assert_eq!(csx.id_map, vec![10_001]); // horizontal, delta 1
        assert_eq!(summaries.len(), 1);
        assert_eq!(csx.values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn full_column_indices_store_absolutes() {
        let a = CsrMatrix::from_sorted_triples(
            2,
            50,
            vec![(0, 7, 1.0), (0, 9, 2.0), (1, 3, 3.0)],
        )
        .unwrap();
        let model = SpmModel::from_csr_window(&a, 0, 2);
        let (csx, _) = assemble(&model, false, true).unwrap();
        assert!(csx.full_column_indices);

        let mut c = CtlCursor::new(&csx.ctl);
        let _flags = c.u8().unwrap();
        assert_eq!(c.u8().unwrap(), 2);
        assert_eq!(c.u32().unwrap(), 7);
        assert_eq!(c.fixed(DeltaWidth::U8).unwrap(), 2);
        let _flags = c.u8().unwrap();
        let _size = c.u8().unwrap();
        assert_eq!(c.u32().unwrap(), 3);
        assert!(c.at_end());
    }

    #[test]
    fn aligned_ctl_pads_delta_bodies() {
        let a = CsrMatrix::from_sorted_triples(
            1,
            2000,
            vec![(0, 0, 1.0), (0, 400, 2.0), (0, 800, 3.0), (0, 1200, 4.0)],
        )
        .unwrap();
        let model = SpmModel::from_csr_window(&a, 0, 1);
        let (csx, _) = assemble(&model, true, false).unwrap();

        let mut c = CtlCursor::new(&csx.ctl);
        let _flags = c.u8().unwrap();
        let _size = c.u8().unwrap();
        assert_eq!(c.varint().unwrap(), 0);
        c.align_to(DeltaWidth::U16).unwrap();
        assert_eq!(c.pos() % 2, 0);
        assert_eq!(c.fixed(DeltaWidth::U16).unwrap(), 400);
    }
}
