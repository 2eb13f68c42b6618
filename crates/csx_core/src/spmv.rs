//! The CSX SpMV executor: one specialised walk per thread.
//!
//! The unit dispatch is a per-thread kernel table indexed by the 6 tag bits
//! of the unit header (the original generated this routine at runtime; the
//! table keeps the same one-routine-per-thread contract). Every bound is
//! validated per unit before the inner loop runs; violations are fatal
//! `CorruptCtl` errors because continuing would produce silent garbage.

use crate::assemble::CsxMatrix;
use crate::coords::IterationOrder;
use crate::ctl::{CtlCursor, DeltaWidth, CTL_NEW_ROW, CTL_PATTERN_MASK, CTL_ROW_JUMP};
use crate::error::{CsxError, CsxResult};
use crate::patterns::PATTERN_ID_OFFSET;
use crate::scalar::Scalar;

/// Inner-loop selector for one unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Variable-delta run; deltas packed in the ctl stream at this width.
    Delta(DeltaWidth),
    /// Fixed-stride run along an iteration order.
    Linear { order: IterationOrder, delta: usize },
    /// `align x other_dim` block; row-aligned blocks store their values
    /// column-major, column-aligned blocks row-major.
    BlockRow { align: usize, other_dim: usize },
    BlockCol { align: usize, other_dim: usize },
}

/// Resolve a thread's `id_map` into its kernel table.
pub fn kernel_table(id_map: &[u32]) -> CsxResult<Vec<Kernel>> {
    id_map
        .iter()
        .map(|&id| {
            let tag = id / PATTERN_ID_OFFSET;
            let delta = (id % PATTERN_ID_OFFSET) as usize;
            match tag {
                0 => DeltaWidth::from_bits(delta as u32)
                    .map(Kernel::Delta)
                    .ok_or_else(|| {
                        CsxError::corrupt(0, format!("bad delta width {delta} in id map"))
                    }),
                1..=4 => Ok(Kernel::Linear {
                    order: IterationOrder::from_tag(tag).unwrap(),
                    delta,
                }),
                5..=12 => Ok(Kernel::BlockRow {
                    align: (tag - 4) as usize,
                    other_dim: delta,
                }),
                13..=20 => Ok(Kernel::BlockCol {
                    align: (tag - 12) as usize,
                    other_dim: delta,
                }),
                _ => Err(CsxError::corrupt(0, format!("unknown pattern id {id}"))),
            }
        })
        .collect()
}

/// Compute `out = A_t * x` for one thread's CSX block. `out` is the
/// thread's row slice (`csx.nrows` long, starting at global row
/// `csx.row_start`); it is zeroed here.
pub fn execute<V: Scalar>(
    csx: &CsxMatrix<V>,
    kernels: &[Kernel],
    x: &[V],
    out: &mut [V],
) -> CsxResult<()> {
    debug_assert_eq!(out.len(), csx.nrows);
    for v in out.iter_mut() {
        *v = V::zero();
    }
    Walk::new(csx, kernels, x)?.run(out, None)
}

/// Symmetric variant: `csx` holds the strictly lower triangle of the
/// thread's rows, `dv` the diagonal slice. Row-side products accumulate
/// into `out`; mirrored products go to `temp` (full-length scratch, summed
/// across threads in the switch-reduction phase after the compute barrier).
pub fn execute_sym<V: Scalar>(
    csx: &CsxMatrix<V>,
    kernels: &[Kernel],
    dv: &[V],
    x: &[V],
    out: &mut [V],
    temp: &mut [V],
) -> CsxResult<()> {
    debug_assert_eq!(out.len(), csx.nrows);
    debug_assert_eq!(dv.len(), csx.nrows);
    for (i, v) in out.iter_mut().enumerate() {
        *v = dv[i] * x[csx.row_start + i];
    }
    Walk::new(csx, kernels, x)?.run(out, Some(temp))
}

struct Walk<'a, V> {
    csx: &'a CsxMatrix<V>,
    kernels: &'a [Kernel],
    x: &'a [V],
    cursor: CtlCursor<'a>,
    vi: usize,
}

impl<'a, V: Scalar> Walk<'a, V> {
    fn new(csx: &'a CsxMatrix<V>, kernels: &'a [Kernel], x: &'a [V]) -> CsxResult<Self> {
        if x.len() != csx.ncols {
            return Err(CsxError::BadInput(format!(
                "input vector has {} entries for {} columns",
                x.len(),
                csx.ncols
            )));
        }
        Ok(Walk {
            csx,
            kernels,
            x,
            cursor: CtlCursor::new(&csx.ctl),
            vi: 0,
        })
    }

    fn run(&mut self, out: &mut [V], mut temp: Option<&mut [V]>) -> CsxResult<()> {
        let nrows = self.csx.nrows;
        let ncols = self.csx.ncols;
        let row_start = self.csx.row_start;

        let mut y_local = 0usize;
        let mut yr = V::zero();
        let mut x_curr = 0usize;
        let mut row_open = false;

        while !self.cursor.at_end() {
            let at = self.cursor.pos();
            let flags = self.cursor.u8()?;
            let size = self.cursor.u8()? as usize;
            if size == 0 {
                return Err(CsxError::corrupt(at, "zero-size unit"));
            }

            if flags & CTL_NEW_ROW != 0 {
                let jump = if flags & CTL_ROW_JUMP != 0 {
                    self.cursor.varint()? as usize
                } else {
                    1
                };
                if jump == 0 {
                    return Err(CsxError::corrupt(at, "zero row jump"));
                }
                if row_open {
                    out[y_local] = out[y_local] + yr;
                    yr = V::zero();
                    y_local += jump;
                } else {
                    // the stream-opening unit advances from the implicit
                    // position one row before the slice
                    y_local = jump - 1;
                    row_open = true;
                }
                if y_local >= nrows {
                    return Err(CsxError::corrupt(at, "row jump leaves the thread slice"));
                }
                x_curr = 0;
            } else if !row_open {
                return Err(CsxError::corrupt(at, "stream does not open with a row"));
            }

            x_curr = if self.csx.full_column_indices {
                self.cursor.u32()? as usize
            } else {
                x_curr + self.cursor.varint()? as usize
            };
            if x_curr >= ncols {
                return Err(CsxError::corrupt(at, "column jump leaves the matrix"));
            }
            if self.vi + size > self.csx.values.len() {
                return Err(CsxError::corrupt(at, "unit exceeds the value array"));
            }

            let kernel = *self
                .kernels
                .get((flags & CTL_PATTERN_MASK) as usize)
                .ok_or_else(|| CsxError::corrupt(at, "unit tag outside the kernel table"))?;

            match kernel {
                Kernel::Delta(width) => {
                    let v = self.csx.values[self.vi];
                    self.vi += 1;
                    yr = yr + v * self.x[x_curr];
                    if let Some(t) = temp.as_deref_mut() {
                        t[x_curr] = t[x_curr] + v * self.x[row_start + y_local];
                    }
                    if size > 1 {
                        if self.csx.aligned {
                            self.cursor.align_to(width)?;
                        }
                        for _ in 1..size {
                            x_curr += self.cursor.fixed(width)? as usize;
                            if x_curr >= ncols {
                                return Err(CsxError::corrupt(
                                    at,
                                    "delta run leaves the matrix",
                                ));
                            }
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            yr = yr + v * self.x[x_curr];
                            if let Some(t) = temp.as_deref_mut() {
                                t[x_curr] = t[x_curr] + v * self.x[row_start + y_local];
                            }
                        }
                    }
                }

                Kernel::Linear { order, delta: d } => match order {
                    IterationOrder::Horizontal => {
                        if x_curr + d * (size - 1) >= ncols {
                            return Err(CsxError::corrupt(at, "run leaves the matrix"));
                        }
                        for i in 0..size {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            yr = yr + v * self.x[x_curr + i * d];
                            if let Some(t) = temp.as_deref_mut() {
                                t[x_curr + i * d] =
                                    t[x_curr + i * d] + v * self.x[row_start + y_local];
                            }
                        }
                        x_curr += d * (size - 1);
                    }
                    IterationOrder::Vertical => {
                        if y_local + d * (size - 1) >= nrows {
                            return Err(CsxError::corrupt(at, "run leaves the thread slice"));
                        }
                        for i in 0..size {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            if i == 0 {
                                yr = yr + v * self.x[x_curr];
                            } else {
                                out[y_local + i * d] =
                                    out[y_local + i * d] + v * self.x[x_curr];
                            }
                            if let Some(t) = temp.as_deref_mut() {
                                t[x_curr] =
                                    t[x_curr] + v * self.x[row_start + y_local + i * d];
                            }
                        }
                    }
                    IterationOrder::Diagonal => {
                        if y_local + d * (size - 1) >= nrows
                            || x_curr + d * (size - 1) >= ncols
                        {
                            return Err(CsxError::corrupt(at, "run leaves the matrix"));
                        }
                        for i in 0..size {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            let xc = x_curr + i * d;
                            if i == 0 {
                                yr = yr + v * self.x[xc];
                            } else {
                                out[y_local + i * d] = out[y_local + i * d] + v * self.x[xc];
                            }
                            if let Some(t) = temp.as_deref_mut() {
                                t[xc] = t[xc] + v * self.x[row_start + y_local + i * d];
                            }
                        }
                    }
                    IterationOrder::AntiDiagonal => {
                        // the unit is seeded at its bottom-left element
                        if y_local < d * (size - 1) || x_curr + d * (size - 1) >= ncols {
                            return Err(CsxError::corrupt(at, "run leaves the matrix"));
                        }
                        for i in 0..size {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            let xc = x_curr + i * d;
                            if i == 0 {
                                yr = yr + v * self.x[xc];
                            } else {
                                out[y_local - i * d] = out[y_local - i * d] + v * self.x[xc];
                            }
                            if let Some(t) = temp.as_deref_mut() {
                                t[xc] = t[xc] + v * self.x[row_start + y_local - i * d];
                            }
                        }
                    }
                    _ => return Err(CsxError::corrupt(at, "block order in a linear kernel")),
                },

                Kernel::BlockRow { align: r, other_dim: c } => {
                    if size != r * c {
                        return Err(CsxError::corrupt(at, "block unit size mismatch"));
                    }
                    if y_local + r - 1 >= nrows || x_curr + c - 1 >= ncols {
                        return Err(CsxError::corrupt(at, "block leaves the matrix"));
                    }
                    // values are stored column-major within the block
                    for j in 0..c {
                        for i in 0..r {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            if i == 0 {
                                yr = yr + v * self.x[x_curr + j];
                            } else {
                                out[y_local + i] = out[y_local + i] + v * self.x[x_curr + j];
                            }
                            if let Some(t) = temp.as_deref_mut() {
                                t[x_curr + j] =
                                    t[x_curr + j] + v * self.x[row_start + y_local + i];
                            }
                        }
                    }
                    x_curr += c - 1;
                }

                Kernel::BlockCol { align: c, other_dim: r } => {
                    if size != r * c {
                        return Err(CsxError::corrupt(at, "block unit size mismatch"));
                    }
                    if y_local + r - 1 >= nrows || x_curr + c - 1 >= ncols {
                        return Err(CsxError::corrupt(at, "block leaves the matrix"));
                    }
                    // values are stored row-major within the block
                    for i in 0..r {
                        for j in 0..c {
                            let v = self.csx.values[self.vi];
                            self.vi += 1;
                            if i == 0 {
                                yr = yr + v * self.x[x_curr + j];
                            } else {
                                out[y_local + i] = out[y_local + i] + v * self.x[x_curr + j];
                            }
                            if let Some(t) = temp.as_deref_mut() {
                                t[x_curr + j] =
                                    t[x_curr + j] + v * self.x[row_start + y_local + i];
                            }
                        }
                    }
                    x_curr += c - 1;
                }
            }
        }

        if row_open {
            out[y_local] = out[y_local] + yr;
        }
        if self.vi != self.csx.values.len() {
            return Err(CsxError::corrupt(
                self.cursor.pos(),
                "stream ended before consuming all values",
            ));
        }
        Ok(())
    }
}

/// One decoded unit header, for diagnostics and layout tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitDump {
    pub new_row: bool,
    pub row_jump: Option<u64>,
    /// Relative jump, or the absolute column with full column indices.
    pub column_jump: u64,
    pub pattern_id: u32,
    pub size: usize,
}

/// Walk the ctl stream without computing, returning every unit header.
pub fn dump_units<V: Scalar>(csx: &CsxMatrix<V>) -> CsxResult<Vec<UnitDump>> {
    let kernels = kernel_table(&csx.id_map)?;
    let mut cursor = CtlCursor::new(&csx.ctl);
    let mut out = Vec::new();

    while !cursor.at_end() {
        let at = cursor.pos();
        let flags = cursor.u8()?;
        let size = cursor.u8()? as usize;
        let new_row = flags & CTL_NEW_ROW != 0;
        let row_jump = if new_row && flags & CTL_ROW_JUMP != 0 {
            Some(cursor.varint()?)
        } else {
            None
        };
        let column_jump = if csx.full_column_indices {
            cursor.u32()? as u64
        } else {
            cursor.varint()?
        };

        let tag = (flags & CTL_PATTERN_MASK) as usize;
        let kernel = kernels
            .get(tag)
            .ok_or_else(|| CsxError::corrupt(at, "unit tag outside the kernel table"))?;
        if let Kernel::Delta(width) = kernel {
            if size > 1 {
                if csx.aligned {
                    cursor.align_to(*width)?;
                }
                for _ in 1..size {
                    cursor.fixed(*width)?;
                }
            }
        }

        out.push(UnitDump {
            new_row,
            row_jump,
            column_jump,
            pattern_id: csx.id_map[tag],
            size,
        });
    }
    Ok(out)
}
