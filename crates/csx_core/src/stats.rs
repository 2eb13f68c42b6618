//! Delta-RLE statistics over a model window: how many nonzeros each delta
//! (or block width) would capture, and how many pattern headers that costs.

use std::collections::BTreeMap;

use crate::config::SplitPolicy;
use crate::error::{CsxError, CsxResult};
use crate::rle::{delta_encode, rle_encode};
use crate::scalar::Scalar;
use crate::spm_model::{RowElem, SpmModel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsVal {
    pub nnz: usize,
    pub npatterns: usize,
}

/// Per-delta statistics of one iteration order.
pub type DeltaStats = BTreeMap<usize, StatsVal>;

/// Account one plain-element column run. Runs shorter than `min_limit` do
/// not justify a pattern header and are ignored.
pub fn update_stats(xs: &mut Vec<usize>, stats: &mut DeltaStats, min_limit: usize) {
    if xs.is_empty() {
        return;
    }
    let runs = rle_encode(&delta_encode(xs, 0));
    for run in runs {
        if run.freq >= min_limit {
            let entry = stats.entry(run.val).or_default();
            entry.nnz += run.freq;
            entry.npatterns += 1;
        }
    }
    xs.clear();
}

/// Block-order variant: only geometrically contiguous runs (delta 1) count,
/// and only their alignment-trimmed prefix; the key is the block's second
/// dimension. A run's head element joins the run except at the very start
/// of a segment, where no predecessor exists.
pub fn update_stats_block(xs: &mut Vec<usize>, stats: &mut DeltaStats, align: usize) {
    debug_assert!(align > 0);
    if xs.is_empty() {
        return;
    }
    let runs = rle_encode(&delta_encode(xs, 0));
    let mut pos = 0usize;
    for (k, run) in runs.iter().enumerate() {
        pos += run.val;
        if run.val == 1 {
            let (head, raw_elems) = if k == 0 {
                (pos, run.freq)
            } else {
                (pos - 1, run.freq + 1)
            };
            let skip_front = (align - head % align) % align;
            let nr_elem = raw_elems.saturating_sub(skip_front);
            let other_dim = nr_elem / align;
            if other_dim >= 2 {
                let entry = stats.entry(other_dim).or_default();
                entry.nnz += other_dim * align;
                entry.npatterns += 1;
            }
        }
        pos += run.val * (run.freq - 1);
    }
    xs.clear();
}

/// Scan the rows `[rs, re)` of the model (in its current order) and gather
/// statistics. Pattern elements from earlier encoding passes break runs.
pub fn generate_stats<V: Scalar>(
    model: &SpmModel<V>,
    rs: usize,
    re: usize,
    min_limit: usize,
) -> DeltaStats {
    let block_align = model.order().block_alignment();
    let mut stats = DeltaStats::new();
    let mut xs: Vec<usize> = Vec::new();

    let mut flush = |xs: &mut Vec<usize>, stats: &mut DeltaStats| match block_align {
        Some(align) => update_stats_block(xs, stats, align),
        None => update_stats(xs, stats, min_limit),
    };

    for i in rs..re {
        for e in model.row(i) {
            match e {
                RowElem::Plain { col, .. } => xs.push(*col),
                RowElem::Encoded { .. } => flush(&mut xs, &mut stats),
            }
        }
        flush(&mut xs, &mut stats);
    }
    stats
}

/// Merge window statistics into an accumulated map.
pub fn merge_stats(into: &mut DeltaStats, from: &DeltaStats) {
    for (&delta, val) in from {
        let entry = into.entry(delta).or_default();
        entry.nnz += val.nnz;
        entry.npatterns += val.npatterns;
    }
}

/// Linearly rescale sampled statistics to the full matrix.
pub fn correct_stats(stats: &mut DeltaStats, factor: f64, nnz_cap: usize) {
    for val in stats.values_mut() {
        val.nnz = ((val.nnz as f64 * factor) as usize).min(nnz_cap);
        val.npatterns = (val.npatterns as f64 * factor) as usize;
    }
}

/// Row boundaries of the sampling windows, or `None` when the window size
/// disables sampling (0 or the whole matrix).
pub fn compute_sort_splits<V: Scalar>(
    model: &SpmModel<V>,
    policy: SplitPolicy,
    window_size: usize,
) -> CsxResult<Option<Vec<usize>>> {
    match policy {
        SplitPolicy::ByRows => split_by_rows(model.nrows(), window_size),
        SplitPolicy::ByNnz => split_by_nnz(model, window_size),
    }
}

fn split_by_rows(nrows: usize, window: usize) -> CsxResult<Option<Vec<usize>>> {
    if window > nrows {
        return Err(CsxError::Config(format!(
            "sort window of {window} rows exceeds the matrix ({nrows} rows)"
        )));
    }
    if window == 0 || window == nrows {
        return Ok(None);
    }
    let mut splits: Vec<usize> = (0..nrows).step_by(window).collect();
    splits.push(nrows);
    merge_short_tail(&mut splits, window);
    Ok(Some(splits))
}

fn split_by_nnz<V: Scalar>(model: &SpmModel<V>, window: usize) -> CsxResult<Option<Vec<usize>>> {
    if window > model.nnz() {
        return Err(CsxError::Config(format!(
            "sort window of {window} nonzeros exceeds the matrix ({} nnz)",
            model.nnz()
        )));
    }
    if window == 0 || window == model.nnz() {
        return Ok(None);
    }
    let mut splits = vec![0usize];
    let mut acc = 0usize;
    for i in 0..model.nrows() {
        acc += model.row(i).iter().map(RowElem::nnz).sum::<usize>();
        if acc >= window {
            splits.push(i + 1);
            acc = 0;
        }
    }
    if acc > 0 {
        if acc > window / 2 {
            splits.push(model.nrows());
        } else {
            // the last window is too short; merge it with the previous
            *splits.last_mut().unwrap() = model.nrows();
        }
    }
    if splits.len() < 2 {
        splits.push(model.nrows());
    }
    Ok(Some(splits))
}

fn merge_short_tail(splits: &mut Vec<usize>, window: usize) {
    let n = splits.len();
    if n >= 3 && splits[n - 1] - splits[n - 2] < window / 2 {
        splits.remove(n - 2);
    }
}
