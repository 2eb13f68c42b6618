//! The closed catalog of recognisable substructures.
//!
//! Two families exist. A delta run covers `size` elements along the active
//! iteration order, consecutive positions separated by `delta`. A block run
//! covers an `align x other_dim` cell rectangle in one of the block orders,
//! where `align` is the order's alignment; runs of both families occupy a
//! single row of the transformed coordinate space.

use crate::coords::{Coord, IterationOrder};

/// Multiplier separating the order tag from the delta in a pattern id.
pub const PATTERN_ID_OFFSET: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    order: IterationOrder,
    /// Stride for the delta family; the non-alignment block dimension for
    /// the block family.
    delta: u32,
    /// Number of nonzeros covered.
    size: u32,
}

impl Pattern {
    /// A run of `size` elements at stride `delta` in `order`.
    pub fn delta_run(order: IterationOrder, delta: usize, size: usize) -> Self {
        debug_assert!(order.block_alignment().is_none());
        debug_assert!(size >= 1);
        Pattern {
            order,
            delta: delta as u32,
            size: size as u32,
        }
    }

    /// An `align x other_dim` block in a block order; covers
    /// `align * other_dim` nonzeros.
    pub fn block(order: IterationOrder, other_dim: usize) -> Self {
        let align = order
            .block_alignment()
            .expect("block patterns require a block order");
        Pattern {
            order,
            delta: other_dim as u32,
            size: (align * other_dim) as u32,
        }
    }

    pub fn order(&self) -> IterationOrder {
        self.order
    }

    pub fn delta(&self) -> usize {
        self.delta as usize
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Rows and columns spanned in horizontal space.
    pub fn span(&self) -> (usize, usize) {
        let d = self.delta as usize;
        let n = self.size as usize;
        match self.order {
            IterationOrder::Horizontal => (1, d * (n - 1) + 1),
            IterationOrder::Vertical => (d * (n - 1) + 1, 1),
            IterationOrder::Diagonal | IterationOrder::AntiDiagonal => {
                (d * (n - 1) + 1, d * (n - 1) + 1)
            }
            IterationOrder::BlockRow(r) => (r as usize, d),
            IterationOrder::BlockCol(c) => (d, c as usize),
        }
    }

    /// Stable identifier shared by the encoder and the executor.
    pub fn pattern_id(&self) -> u32 {
        self.order.tag() * PATTERN_ID_OFFSET + self.delta
    }

    /// One-step advance within the unit, in the order's own coordinate
    /// space (where every pattern is a single-row run).
    pub fn next_column(&self, col: usize) -> usize {
        match self.order {
            IterationOrder::BlockRow(_) | IterationOrder::BlockCol(_) => col + 1,
            _ => col + self.delta as usize,
        }
    }

    /// Horizontal-space column at which the executor resumes after this
    /// unit, given the unit's seed column. The invariant is that each unit
    /// leaves the column cursor at the last element it touched on the
    /// *current* row.
    pub fn resume_column(&self, seed_col: usize) -> usize {
        match self.order {
            IterationOrder::Horizontal => seed_col + self.delta as usize * (self.size as usize - 1),
            IterationOrder::Vertical
            | IterationOrder::Diagonal
            | IterationOrder::AntiDiagonal => seed_col,
            IterationOrder::BlockRow(_) => seed_col + self.delta as usize - 1,
            IterationOrder::BlockCol(c) => seed_col + c as usize - 1,
        }
    }

    /// Lazily yield the `size` covered coordinates in the order's own
    /// space, seeded at the unit's first coordinate. This is also the order
    /// in which the unit's values are stored.
    pub fn generator(&self, seed: Coord) -> Generator {
        Generator {
            pattern: *self,
            cur: seed,
            remaining: self.size as usize,
        }
    }
}

pub struct Generator {
    pattern: Pattern,
    cur: Coord,
    remaining: usize,
}

impl Iterator for Generator {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let out = self.cur;
        self.cur = Coord::new(out.row, self.pattern.next_column(out.col));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_are_length_exact() {
        let cases = [
            Pattern::delta_run(IterationOrder::Horizontal, 3, 7),
            Pattern::delta_run(IterationOrder::Diagonal, 1, 4),
            Pattern::block(IterationOrder::BlockRow(2), 5),
            Pattern::block(IterationOrder::BlockCol(4), 2),
        ];
        for p in cases {
            assert_eq!(p.generator(Coord::new(3, 10)).count(), p.size());
        }
    }

    #[test]
    fn delta_generator_steps_by_delta() {
        let p = Pattern::delta_run(IterationOrder::Horizontal, 3, 3);
        let cols: Vec<usize> = p.generator(Coord::new(0, 2)).map(|c| c.col).collect();
        assert_eq!(cols, vec![2, 5, 8]);
    }

    #[test]
    fn block_generator_steps_by_one() {
        let p = Pattern::block(IterationOrder::BlockRow(2), 3);
        assert_eq!(p.size(), 6);
        let cols: Vec<usize> = p.generator(Coord::new(1, 4)).map(|c| c.col).collect();
        assert_eq!(cols, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn pattern_id_scheme() {
        let h = Pattern::delta_run(IterationOrder::Horizontal, 2, 9);
        assert_eq!(h.pattern_id(), 10_002);

        let b = Pattern::block(IterationOrder::BlockRow(3), 4);
        assert_eq!(b.pattern_id(), 7 * PATTERN_ID_OFFSET + 4);

        let bc = Pattern::block(IterationOrder::BlockCol(2), 5);
        assert_eq!(bc.pattern_id(), 14 * PATTERN_ID_OFFSET + 5);
    }

    #[test]
    fn resume_column_per_family() {
        let h = Pattern::delta_run(IterationOrder::Horizontal, 2, 4);
        assert_eq!(h.resume_column(10), 16);

        let v = Pattern::delta_run(IterationOrder::Vertical, 1, 4);
        assert_eq!(v.resume_column(10), 10);

        let br = Pattern::block(IterationOrder::BlockRow(2), 3);
        assert_eq!(br.resume_column(10), 12);

        let bc = Pattern::block(IterationOrder::BlockCol(4), 2);
        assert_eq!(bc.resume_column(10), 13);
    }
}
