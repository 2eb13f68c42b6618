//! Coordinate model: iteration orders and their bijective mappings.
//!
//! An iteration order linearises the matrix so that the substructures it
//! targets become contiguous runs. Every mapping is a bijection on the
//! in-range coordinate grid; `unmap` composes with `map` to the identity.

use serde::{Deserialize, Serialize};

use crate::error::{CsxError, CsxResult};

/// Highest supported block alignment for the block-row/block-column orders.
pub const MAX_BLOCK_ALIGN: usize = 8;

/// Zero-based matrix coordinate. One-based indices exist only at the
/// MatrixMarket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coord {
    pub row: usize,
    pub col: usize,
}

impl Coord {
    pub fn new(row: usize, col: usize) -> Self {
        Coord { row, col }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum IterationOrder {
    Horizontal,
    Vertical,
    Diagonal,
    AntiDiagonal,
    /// Rows quantised to bands of the given alignment (1..=8).
    BlockRow(u8),
    /// Columns quantised to bands of the given alignment (1..=8).
    BlockCol(u8),
}

impl IterationOrder {
    /// Numeric tag used in pattern ids and in the `XFORM_CONF` environment
    /// variable: Horizontal=1, Vertical=2, Diagonal=3, AntiDiagonal=4,
    /// BlockRow(r)=4+r, BlockCol(c)=12+c.
    pub fn tag(self) -> u32 {
        match self {
            IterationOrder::Horizontal => 1,
            IterationOrder::Vertical => 2,
            IterationOrder::Diagonal => 3,
            IterationOrder::AntiDiagonal => 4,
            IterationOrder::BlockRow(r) => 4 + r as u32,
            IterationOrder::BlockCol(c) => 12 + c as u32,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(IterationOrder::Horizontal),
            2 => Some(IterationOrder::Vertical),
            3 => Some(IterationOrder::Diagonal),
            4 => Some(IterationOrder::AntiDiagonal),
            5..=12 => Some(IterationOrder::BlockRow((tag - 4) as u8)),
            13..=20 => Some(IterationOrder::BlockCol((tag - 12) as u8)),
            _ => None,
        }
    }

    /// Block alignment of the order, if it is a block order.
    pub fn block_alignment(self) -> Option<usize> {
        match self {
            IterationOrder::BlockRow(r) => Some(r as usize),
            IterationOrder::BlockCol(c) => Some(c as usize),
            _ => None,
        }
    }

    pub fn name(self) -> String {
        match self {
            IterationOrder::Horizontal => "horizontal".to_string(),
            IterationOrder::Vertical => "vertical".to_string(),
            IterationOrder::Diagonal => "diagonal".to_string(),
            IterationOrder::AntiDiagonal => "anti-diagonal".to_string(),
            IterationOrder::BlockRow(r) => format!("block-row-{r}"),
            IterationOrder::BlockCol(c) => format!("block-col-{c}"),
        }
    }

    pub fn parse_name(s: &str) -> CsxResult<Self> {
        let t = s.trim().to_ascii_lowercase();
        if let Some(r) = t.strip_prefix("block-row-") {
            let r: u8 = r
                .parse()
                .map_err(|_| CsxError::Config(format!("bad block alignment in '{s}'")))?;
            return validate_align(r).map(IterationOrder::BlockRow);
        }
        if let Some(c) = t.strip_prefix("block-col-") {
            let c: u8 = c
                .parse()
                .map_err(|_| CsxError::Config(format!("bad block alignment in '{s}'")))?;
            return validate_align(c).map(IterationOrder::BlockCol);
        }
        match t.as_str() {
            "horizontal" => Ok(IterationOrder::Horizontal),
            "vertical" => Ok(IterationOrder::Vertical),
            "diagonal" => Ok(IterationOrder::Diagonal),
            "anti-diagonal" | "antidiagonal" => Ok(IterationOrder::AntiDiagonal),
            _ => Err(CsxError::Config(format!("unknown iteration order '{s}'"))),
        }
    }

    /// Map a coordinate from horizontal space into this order's space.
    /// `nrows` is the horizontal row count of the matrix (or window).
    pub fn map(self, nrows: usize, p: Coord) -> Coord {
        match self {
            IterationOrder::Horizontal => p,
            IterationOrder::Vertical => Coord::new(p.col, p.row),
            IterationOrder::Diagonal => {
                // 1-based: y' = R + x - y, x' = min(x, y)
                let (y, x) = (p.row + 1, p.col + 1);
                debug_assert!(nrows + x > y);
                Coord::new(nrows + x - y - 1, x.min(y) - 1)
            }
            IterationOrder::AntiDiagonal => {
                // 1-based: y' = x + y - 1, x' = y' <= R ? x : x + R - y'
                let (y, x) = (p.row + 1, p.col + 1);
                let yp = x + y - 1;
                let xp = if yp <= nrows { x } else { x + nrows - yp };
                Coord::new(yp - 1, xp - 1)
            }
            IterationOrder::BlockRow(r) => {
                let r = r as usize;
                Coord::new(p.row / r, p.col * r + p.row % r)
            }
            IterationOrder::BlockCol(c) => {
                let c = c as usize;
                Coord::new(p.col / c, p.row * c + p.col % c)
            }
        }
    }

    /// Inverse of [`map`](Self::map).
    pub fn unmap(self, nrows: usize, p: Coord) -> Coord {
        match self {
            IterationOrder::Horizontal => p,
            IterationOrder::Vertical => Coord::new(p.col, p.row),
            IterationOrder::Diagonal => {
                let (yp, xp) = (p.row + 1, p.col + 1);
                if yp < nrows {
                    Coord::new(nrows + xp - yp - 1, xp - 1)
                } else {
                    Coord::new(xp - 1, yp + xp - nrows - 1)
                }
            }
            IterationOrder::AntiDiagonal => {
                let (yp, xp) = (p.row + 1, p.col + 1);
                let x = if yp < nrows { xp } else { xp + yp - nrows };
                Coord::new(yp - x, x - 1)
            }
            IterationOrder::BlockRow(r) => {
                let r = r as usize;
                Coord::new(p.row * r + p.col % r, p.col / r)
            }
            IterationOrder::BlockCol(c) => {
                let c = c as usize;
                Coord::new(p.col / c, p.row * c + p.col % c)
            }
        }
    }
}

fn validate_align(a: u8) -> CsxResult<u8> {
    if (1..=MAX_BLOCK_ALIGN as u8).contains(&a) {
        Ok(a)
    } else {
        Err(CsxError::Config(format!(
            "block alignment {a} out of range 1..={MAX_BLOCK_ALIGN}"
        )))
    }
}

/// Map a point set into `order` space and sort it row-major.
pub fn reorder(order: IterationOrder, nrows: usize, pts: &mut [Coord]) {
    for p in pts.iter_mut() {
        *p = order.map(nrows, *p);
    }
    pts.sort_unstable();
}

/// Map a point set back to horizontal space and sort it row-major.
pub fn inverse_reorder(order: IterationOrder, nrows: usize, pts: &mut [Coord]) {
    for p in pts.iter_mut() {
        *p = order.unmap(nrows, *p);
    }
    pts.sort_unstable();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn all_orders() -> Vec<IterationOrder> {
        let mut v = vec![
            IterationOrder::Horizontal,
            IterationOrder::Vertical,
            IterationOrder::Diagonal,
            IterationOrder::AntiDiagonal,
        ];
        for a in 1..=MAX_BLOCK_ALIGN as u8 {
            v.push(IterationOrder::BlockRow(a));
            v.push(IterationOrder::BlockCol(a));
        }
        v
    }

    #[rstest]
    #[case(10, 10)]
    #[case(5, 10)]
    #[case(10, 5)]
    #[case(1, 7)]
    #[case(7, 1)]
    fn map_unmap_roundtrip(#[case] nrows: usize, #[case] ncols: usize) {
        for order in all_orders() {
            for row in 0..nrows {
                for col in 0..ncols {
                    let p = Coord::new(row, col);
                    let q = order.unmap(nrows, order.map(nrows, p));
                    assert_eq!(p, q, "{order:?} failed at ({row},{col}) in {nrows}x{ncols}");
                }
            }
        }
    }

    #[test]
    fn map_is_injective() {
        let nrows = 6;
        let ncols = 9;
        for order in all_orders() {
            let mut seen = std::collections::BTreeSet::new();
            for row in 0..nrows {
                for col in 0..ncols {
                    let q = order.map(nrows, Coord::new(row, col));
                    assert!(seen.insert((q.row, q.col)), "{order:?} collides at {q:?}");
                }
            }
        }
    }

    #[test]
    fn diagonal_runs_are_contiguous() {
        // the main diagonal of a 4x4 matrix becomes one delta-1 run
        let nrows = 4;
        let mut pts: Vec<Coord> = (0..4).map(|i| Coord::new(i, i)).collect();
        reorder(IterationOrder::Diagonal, nrows, &mut pts);
        let rows: Vec<usize> = pts.iter().map(|p| p.row).collect();
        assert!(rows.windows(2).all(|w| w[0] == w[1]));
        let cols: Vec<usize> = pts.iter().map(|p| p.col).collect();
        assert_eq!(cols, vec![0, 1, 2, 3]);
    }

    #[test]
    fn block_row_makes_blocks_contiguous() {
        // a dense 2x2 block at (2,4) becomes a delta-1 run of length 4
        let order = IterationOrder::BlockRow(2);
        let mut pts = vec![
            Coord::new(2, 4),
            Coord::new(2, 5),
            Coord::new(3, 4),
            Coord::new(3, 5),
        ];
        reorder(order, 8, &mut pts);
        assert!(pts.windows(2).all(|w| w[0].row == w[1].row));
        let cols: Vec<usize> = pts.iter().map(|p| p.col).collect();
        assert_eq!(cols, vec![8, 9, 10, 11]);
    }

    #[test]
    fn reorder_roundtrips_point_sets() {
        let nrows = 7;
        let original: Vec<Coord> = (0..7)
            .flat_map(|r| [(r, (r * 3) % 7), (r, (r * 5 + 1) % 7)])
            .map(|(r, c)| Coord::new(r, c))
            .collect();
        for order in all_orders() {
            let mut pts: Vec<Coord> = original.clone();
            reorder(order, nrows, &mut pts);
            inverse_reorder(order, nrows, &mut pts);
            let mut sorted = original.clone();
            sorted.sort_unstable();
            assert_eq!(pts, sorted, "{order:?}");
        }
    }

    #[test]
    fn tag_numbering_roundtrips() {
        for order in all_orders() {
            assert_eq!(IterationOrder::from_tag(order.tag()), Some(order));
        }
        assert_eq!(IterationOrder::from_tag(0), None);
        assert_eq!(IterationOrder::from_tag(21), None);
    }
}
