//! The cost-based encoder: pattern detection over iteration orders, row
//! rewriting, and its inverse.
//!
//! Automatic mode repeatedly scores every candidate order, rewrites the
//! matrix in the winner, and removes it from further consideration. Serial
//! mode applies a caller-given order/delta plan, which is what reproducible
//! benchmarks use.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::EncodeOptions;
use crate::coords::IterationOrder;
use crate::error::{CsxError, CsxResult};
use crate::patterns::{Pattern, PATTERN_ID_OFFSET};
use crate::rle::{delta_encode, rle_encode};
use crate::scalar::Scalar;
use crate::spm_model::{RowElem, SpmModel};
use crate::stats::{
    compute_sort_splits, correct_stats, generate_stats, merge_stats, DeltaStats,
};

/// Fixed sampling seed; part of the reproducibility contract.
const SAMPLING_SEED: u64 = 0;

/// Retries before a failed sampling round falls back to a full scan.
const MAX_SAMPLING_TRIES: u32 = 3;

pub struct Encoder<V> {
    spm: SpmModel<V>,
    opts: EncodeOptions,
    ignore: BTreeSet<IterationOrder>,
    deltas_to_encode: BTreeMap<IterationOrder, BTreeSet<usize>>,
    stats: BTreeMap<IterationOrder, DeltaStats>,
    sort_splits: Option<Vec<usize>>,
    sampling_portion: f64,
    samples_max: usize,
    rng: ChaCha8Rng,
}

impl<V: Scalar> Encoder<V> {
    pub fn new(spm: SpmModel<V>, opts: EncodeOptions) -> CsxResult<Self> {
        opts.validate()?;
        let sort_splits = compute_sort_splits(&spm, opts.split_policy, opts.window_size)?;

        let mut samples_max = opts.samples_max;
        let mut sampling_portion = opts.sampling_portion;
        if let Some(splits) = &sort_splits {
            let n_windows = splits.len() - 1;
            samples_max = samples_max.min(n_windows);
            if sampling_portion == 0.0 {
                // spread the samples uniformly over the matrix
                sampling_portion = ((samples_max as f64 + 1.0) / n_windows as f64).min(1.0);
            }
        }

        Ok(Encoder {
            spm,
            opts,
            ignore: BTreeSet::new(),
            deltas_to_encode: BTreeMap::new(),
            stats: BTreeMap::new(),
            sort_splits,
            sampling_portion,
            samples_max,
            rng: ChaCha8Rng::seed_from_u64(SAMPLING_SEED),
        })
    }

    pub fn model(&self) -> &SpmModel<V> {
        &self.spm
    }

    pub fn into_model(self) -> SpmModel<V> {
        self.spm
    }

    /// Run whichever mode the options select: serial when a delta plan is
    /// given, automatic otherwise.
    pub fn run(&mut self) -> CsxResult<()> {
        if let Some(plan) = self.opts.deltas_per_order.clone() {
            let orders: Vec<IterationOrder> = self
                .opts
                .iteration_orders
                .iter()
                .filter(|o| plan.contains_key(o))
                .copied()
                .collect();
            self.encode_serial(&orders, &plan)
        } else {
            self.encode_all()
        }
    }

    /// Automatic mode: greedily encode the best-scoring order until no
    /// candidate captures more nonzeros than it spends on unit headers.
    pub fn encode_all(&mut self) -> CsxResult<()> {
        loop {
            self.gen_all_stats()?;
            let Some(order) = self.choose_order() else {
                break;
            };
            log::debug!(
                "rows {}..: encoding to {} (score {})",
                self.spm.row_start(),
                order.name(),
                self.type_score(order)
            );
            self.encode(order);
        }
        Ok(())
    }

    /// Serial mode: apply `orders` in sequence, encoding exactly the listed
    /// deltas of each.
    pub fn encode_serial(
        &mut self,
        orders: &[IterationOrder],
        deltas: &BTreeMap<IterationOrder, BTreeSet<usize>>,
    ) -> CsxResult<()> {
        for order in orders {
            let set = deltas.get(order).ok_or_else(|| {
                CsxError::Config(format!("no delta set for {}", order.name()))
            })?;
            self.deltas_to_encode.insert(*order, set.clone());
            self.encode(*order);
        }
        Ok(())
    }

    /// Rewrite every row in `order`: qualifying runs become pattern
    /// elements, everything else stays plain.
    pub fn encode(&mut self, order: IterationOrder) {
        self.spm.transform(order);
        let n = self.spm.n_order_rows();
        for i in 0..n {
            let old = std::mem::take(&mut self.spm.rows[i]);
            self.spm.rows[i] = self.encode_row(old, order);
        }
        self.spm.assert_nnz_preserved();
        self.spm.transform(IterationOrder::Horizontal);
        self.ignore.insert(order);
    }

    /// Expand this order's pattern elements back into plain elements; exact
    /// inverse of [`encode`](Self::encode) and the backtracking step of the
    /// tree explorer.
    pub fn decode(&mut self, order: IterationOrder) {
        self.spm.transform(order);
        let n = self.spm.n_order_rows();
        for i in 0..n {
            let old = std::mem::take(&mut self.spm.rows[i]);
            let mut new_row = Vec::with_capacity(old.len());
            for e in old {
                match e {
                    RowElem::Encoded {
                        col,
                        pattern,
                        vals,
                    } if pattern.order() == order => {
                        let seed = crate::coords::Coord::new(i, col);
                        for (coord, value) in pattern.generator(seed).zip(vals) {
                            new_row.push(RowElem::Plain {
                                col: coord.col,
                                value,
                            });
                        }
                    }
                    other => new_row.push(other),
                }
            }
            self.spm.rows[i] = new_row;
        }
        self.spm.assert_nnz_preserved();
        self.spm.transform(IterationOrder::Horizontal);
        self.ignore.remove(&order);
    }

    /// Depth-first exploration of pattern-application orders with
    /// decode-based backtracking. Returns every maximal path with its
    /// cumulative score. Cost is exponential in the path depth; this is a
    /// diagnostic utility, not part of the encoding pipeline.
    pub fn explore(&mut self, max_depth: usize) -> CsxResult<Vec<(Vec<IterationOrder>, usize)>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.explore_rec(max_depth, &mut path, 0, &mut out)?;
        Ok(out)
    }

    fn explore_rec(
        &mut self,
        max_depth: usize,
        path: &mut Vec<IterationOrder>,
        score_acc: usize,
        out: &mut Vec<(Vec<IterationOrder>, usize)>,
    ) -> CsxResult<()> {
        let mut candidates = Vec::new();
        if path.len() < max_depth {
            self.gen_all_stats()?;
            let orders: Vec<IterationOrder> = self.stats.keys().copied().collect();
            for order in orders {
                let score = self.type_score(order);
                if score > 0 {
                    candidates.push((order, score));
                }
            }
        }
        if candidates.is_empty() {
            out.push((path.clone(), score_acc));
            return Ok(());
        }
        for (order, score) in candidates {
            self.encode(order);
            path.push(order);
            self.explore_rec(max_depth, path, score_acc + score, out)?;
            path.pop();
            self.decode(order);
        }
        Ok(())
    }

    /// Generate and filter statistics for every non-ignored order.
    fn gen_all_stats(&mut self) -> CsxResult<()> {
        self.stats.clear();
        let orders: Vec<IterationOrder> = self
            .opts
            .iteration_orders
            .iter()
            .filter(|o| !self.ignore.contains(o))
            .copied()
            .collect();

        for order in orders {
            let stats = if self.sort_splits.is_some() {
                self.sampled_stats(order)?
            } else {
                self.full_stats(order)
            };
            self.filter_stats(order, stats);
        }
        Ok(())
    }

    fn full_stats(&mut self, order: IterationOrder) -> DeltaStats {
        self.spm.transform(order);
        let stats = generate_stats(&self.spm, 0, self.spm.n_order_rows(), self.opts.min_limit);
        self.spm.transform(IterationOrder::Horizontal);
        stats
    }

    fn sampled_stats(&mut self, order: IterationOrder) -> CsxResult<DeltaStats> {
        let splits = self.sort_splits.clone().expect("sampling windows");
        let total_nnz = self.spm.nnz();

        for _ in 0..MAX_SAMPLING_TRIES {
            let mut acc = DeltaStats::new();
            let mut samples_nnz = 0usize;
            let mut samples_cnt = 0usize;

            for w in splits.windows(2) {
                if samples_cnt >= self.samples_max {
                    break;
                }
                if self.rng.gen::<f64>() < 1.0 - self.sampling_portion {
                    continue;
                }
                let mut window = self.spm.window(w[0], w[1]);
                // earlier patterns may have captured all of a window's nonzeros
                if window.nnz() == 0 {
                    continue;
                }
                samples_cnt += 1;
                samples_nnz += window.nnz();
                window.transform(order);
                let w_stats =
                    generate_stats(&window, 0, window.n_order_rows(), self.opts.min_limit);
                merge_stats(&mut acc, &w_stats);
            }

            if samples_nnz > 0 {
                correct_stats(&mut acc, total_nnz as f64 / samples_nnz as f64, total_nnz);
                return Ok(acc);
            }
        }

        log::warn!(
            "could not sample the matrix after {MAX_SAMPLING_TRIES} tries; \
             falling back to a full scan (increase the sampling portion or \
             decrease the window size)"
        );
        Ok(self.full_stats(order))
    }

    /// Keep only candidates worth a pattern: enough relative nonzero share,
    /// a representable delta, and (for blocks) an admissible block size.
    fn filter_stats(&mut self, order: IterationOrder, mut stats: DeltaStats) {
        let total = self.spm.nnz().max(1);
        let block_align = order.block_alignment();
        let min_perc = self.opts.min_perc;
        let max_limit = self.opts.max_limit;

        if let Some(align) = block_align {
            if self.opts.split_blocks {
                cut_max_limit(&mut stats, align, max_limit);
            }
        }

        let deltas = self.deltas_to_encode.entry(order).or_default();
        deltas.clear();
        stats.retain(|&delta, val| {
            let share = val.nnz as f64 / total as f64;
            if share < min_perc || delta as u32 >= PATTERN_ID_OFFSET {
                return false;
            }
            if let Some(align) = block_align {
                if delta * align > max_limit {
                    return false;
                }
            }
            deltas.insert(delta);
            true
        });
        self.stats.insert(order, stats);
    }

    /// `nnz_encoded - npatterns`: captured nonzeros minus the per-unit
    /// header cost.
    fn type_score(&self, order: IterationOrder) -> usize {
        let Some(stats) = self.stats.get(&order) else {
            return 0;
        };
        let nnz: usize = stats.values().map(|v| v.nnz).sum();
        let npatterns: usize = stats.values().map(|v| v.npatterns).sum();
        nnz.saturating_sub(npatterns)
    }

    /// Highest-scoring order, if any scores positive. Zero-scoring orders
    /// are dropped from further consideration.
    fn choose_order(&mut self) -> Option<IterationOrder> {
        let mut best = None;
        let mut best_score = 0;
        let orders: Vec<IterationOrder> = self.stats.keys().copied().collect();
        for order in orders {
            let score = self.type_score(order);
            if score == 0 {
                self.ignore.insert(order);
            } else if score > best_score {
                best_score = score;
                best = Some(order);
            }
        }
        best
    }

    fn encode_row(&self, old: Vec<RowElem<V>>, order: IterationOrder) -> Vec<RowElem<V>> {
        let mut newrow = Vec::with_capacity(old.len());
        let mut xs: Vec<usize> = Vec::new();
        let mut vs: Vec<V> = Vec::new();

        for e in old {
            match e {
                RowElem::Plain { col, value } => {
                    xs.push(col);
                    vs.push(value);
                }
                encoded => {
                    if !xs.is_empty() {
                        self.do_encode(&mut xs, &mut vs, &mut newrow, order);
                    }
                    newrow.push(encoded);
                }
            }
        }
        if !xs.is_empty() {
            self.do_encode(&mut xs, &mut vs, &mut newrow, order);
        }
        newrow
    }

    fn do_encode(
        &self,
        xs: &mut Vec<usize>,
        vs: &mut Vec<V>,
        newrow: &mut Vec<RowElem<V>>,
        order: IterationOrder,
    ) {
        if let Some(align) = order.block_alignment() {
            if self.opts.split_blocks {
                self.do_encode_block_split(xs, vs, newrow, order, align);
            } else {
                self.do_encode_block(xs, vs, newrow, order, align);
            }
            return;
        }

        let empty = BTreeSet::new();
        let deltas_set = self.deltas_to_encode.get(&order).unwrap_or(&empty);
        let runs = rle_encode(&delta_encode(xs, 0));

        let mut col = 0usize;
        let mut vi = 0usize;
        for mut run in runs {
            if deltas_set.contains(&run.val) {
                while run.freq >= self.opts.min_limit {
                    let freq = run.freq.min(self.opts.max_limit);
                    col += run.val;
                    let vals = vs[vi..vi + freq].to_vec();
                    vi += freq;
                    newrow.push(RowElem::Encoded {
                        col,
                        pattern: Pattern::delta_run(order, run.val, freq),
                        vals,
                    });
                    col += run.val * (freq - 1);
                    run.freq -= freq;
                }
            }
            for _ in 0..run.freq {
                col += run.val;
                newrow.push(RowElem::Plain {
                    col,
                    value: vs[vi],
                });
                vi += 1;
            }
        }
        debug_assert_eq!(vi, vs.len());
        xs.clear();
        vs.clear();
    }

    /// Block rewrite without run splitting: a run becomes equal-size blocks
    /// only when its whole trimmed width is an encodable dimension; oversize
    /// runs are chopped at the max-limit alignment.
    fn do_encode_block(
        &self,
        xs: &mut Vec<usize>,
        vs: &mut Vec<V>,
        newrow: &mut Vec<RowElem<V>>,
        order: IterationOrder,
        align: usize,
    ) {
        let empty = BTreeSet::new();
        let deltas_set = self.deltas_to_encode.get(&order).unwrap_or(&empty);
        let runs = rle_encode(&delta_encode(xs, 0));

        let mut col = 0usize;
        let mut vi = 0usize;
        for (k, run) in runs.iter().enumerate() {
            col += run.val;
            let (rle_start, skip_front, nr_elem, raw) = trim_run(k, col, run, align);

            let max_block_run = (self.opts.max_limit / (2 * align)) * (2 * align);
            if run.val == 1
                && nr_elem >= 2 * align
                && max_block_run > 0
                && deltas_set.contains(&(nr_elem / align))
            {
                if k != 0 {
                    // annex the head element emitted by the previous run
                    newrow.pop();
                    vi -= 1;
                }
                for i in 0..skip_front {
                    newrow.push(RowElem::Plain {
                        col: rle_start + i,
                        value: vs[vi],
                    });
                    vi += 1;
                }

                let mut nr_blocks = nr_elem / max_block_run;
                let nr_elem_block = nr_elem.min(max_block_run);
                // elements dropped by the alignment trim trail the blocks
                let mut skip_back = raw - skip_front - nr_elem;
                if nr_blocks == 0 {
                    nr_blocks = 1;
                } else {
                    skip_back += nr_elem - nr_elem_block * nr_blocks;
                }

                for b in 0..nr_blocks {
                    let start = rle_start + skip_front + b * nr_elem_block;
                    let vals = vs[vi..vi + nr_elem_block].to_vec();
                    vi += nr_elem_block;
                    newrow.push(RowElem::Encoded {
                        col: start,
                        pattern: Pattern::block(order, nr_elem_block / align),
                        vals,
                    });
                }

                let tail_start = rle_start + skip_front + nr_elem_block * nr_blocks;
                for i in 0..skip_back {
                    newrow.push(RowElem::Plain {
                        col: tail_start + i,
                        value: vs[vi],
                    });
                    vi += 1;
                }
            } else {
                for i in 0..run.freq {
                    newrow.push(RowElem::Plain {
                        col: col + i * run.val,
                        value: vs[vi],
                    });
                    vi += 1;
                }
            }
            col += run.val * (run.freq - 1);
        }
        debug_assert_eq!(vi, vs.len());
        xs.clear();
        vs.clear();
    }

    /// Block rewrite with run splitting: greedy descent over the delta set,
    /// always carving the largest block that still fits.
    fn do_encode_block_split(
        &self,
        xs: &mut Vec<usize>,
        vs: &mut Vec<V>,
        newrow: &mut Vec<RowElem<V>>,
        order: IterationOrder,
        align: usize,
    ) {
        let empty = BTreeSet::new();
        let deltas_set = self.deltas_to_encode.get(&order).unwrap_or(&empty);
        let runs = rle_encode(&delta_encode(xs, 0));

        let mut col = 0usize;
        let mut vi = 0usize;
        for (k, run) in runs.iter().enumerate() {
            col += run.val;
            let (rle_start, skip_front, nr_elem, raw) = trim_run(k, col, run, align);

            if run.val == 1 && nr_elem >= 2 * align && !deltas_set.is_empty() {
                if k != 0 {
                    newrow.pop();
                    vi -= 1;
                }
                let mut cursor = rle_start;
                for _ in 0..skip_front {
                    newrow.push(RowElem::Plain {
                        col: cursor,
                        value: vs[vi],
                    });
                    cursor += 1;
                    vi += 1;
                }

                let mut remaining = nr_elem;
                let mut other_dim = nr_elem / align;
                for &d in deltas_set.iter().rev() {
                    while other_dim >= d {
                        let nr_elem_block = align * d;
                        let vals = vs[vi..vi + nr_elem_block].to_vec();
                        vi += nr_elem_block;
                        newrow.push(RowElem::Encoded {
                            col: cursor,
                            pattern: Pattern::block(order, d),
                            vals,
                        });
                        cursor += nr_elem_block;
                        remaining -= nr_elem_block;
                        other_dim -= d;
                    }
                }

                // alignment tail plus whatever the descent could not place
                let tail = raw - skip_front - (nr_elem - remaining);
                for _ in 0..tail {
                    newrow.push(RowElem::Plain {
                        col: cursor,
                        value: vs[vi],
                    });
                    cursor += 1;
                    vi += 1;
                }
            } else {
                for i in 0..run.freq {
                    newrow.push(RowElem::Plain {
                        col: col + i * run.val,
                        value: vs[vi],
                    });
                    vi += 1;
                }
            }
            col += run.val * (run.freq - 1);
        }
        debug_assert_eq!(vi, vs.len());
        xs.clear();
        vs.clear();
    }
}

/// Alignment bookkeeping for one delta-1 run: the run's start position
/// (annexing the previous element except at a segment start), the elements
/// skipped to reach block alignment, the aligned element count, and the raw
/// element count of the segment.
fn trim_run(
    k: usize,
    col: usize,
    run: &crate::rle::Rle,
    align: usize,
) -> (usize, usize, usize, usize) {
    let (head, raw) = if k == 0 {
        (col, run.freq)
    } else {
        (col - run.val, run.freq + 1)
    };
    let skip_front = (align - head % align) % align;
    let mut nr_elem = raw.saturating_sub(skip_front);
    nr_elem -= nr_elem % align;
    (head, skip_front, nr_elem, raw)
}

/// Fold statistics of blocks wider than the admissible maximum into the
/// widest admissible block (plus a remainder entry), so the splitting
/// rewrite sees achievable dimensions.
fn cut_max_limit(stats: &mut DeltaStats, align: usize, max_limit: usize) {
    let max_block = max_limit / align;
    if max_block == 0 {
        stats.clear();
        return;
    }
    if stats.keys().next_back().map_or(true, |&d| d <= max_block) {
        return;
    }

    let mut folded = DeltaStats::new();
    for (&d, val) in stats.iter() {
        if d <= max_block {
            let entry = folded.entry(d).or_default();
            entry.nnz += val.nnz;
            entry.npatterns += val.npatterns;
            continue;
        }
        let div = d / max_block;
        let rem = d % max_block;
        let moved_nnz = val.npatterns * div * max_block * align;
        let entry = folded.entry(max_block).or_default();
        entry.nnz += moved_nnz;
        entry.npatterns += val.npatterns * div;
        if rem >= 2 {
            let entry = folded.entry(rem).or_default();
            entry.nnz += val.nnz.saturating_sub(moved_nnz);
            entry.npatterns += val.npatterns;
        }
    }
    *stats = folded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CsrMatrix;

    fn dense_row(cols: &[usize], ncols: usize) -> SpmModel<f64> {
        let triples: Vec<(usize, usize, f64)> =
            cols.iter().map(|&c| (0, c, (c + 1) as f64)).collect();
        let a = CsrMatrix::from_sorted_triples(1, ncols, triples).unwrap();
        SpmModel::from_csr_window(&a, 0, 1)
    }

    fn opts_with(orders: Vec<IterationOrder>, min_limit: usize) -> EncodeOptions {
        EncodeOptions {
            iteration_orders: orders,
            min_limit,
            min_perc: 0.0,
            ..Default::default()
        }
    }

    fn count_patterns(model: &SpmModel<f64>) -> usize {
        (0..model.n_order_rows())
            .flat_map(|i| model.row(i))
            .filter(|e| matches!(e, RowElem::Encoded { .. }))
            .count()
    }

    #[test]
    fn horizontal_run_is_encoded() {
        let model = dense_row(&[2, 3, 4, 5, 6, 20], 32);
        let opts = opts_with(vec![IterationOrder::Horizontal], 4);
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_all().unwrap();

        let m = enc.model();
        assert_eq!(count_patterns(m), 1);
        // run head at col 2 stays plain, the four delta-1 followers fold
        match &m.row(0)[1] {
            RowElem::Encoded { col, pattern, vals } => {
                assert_eq!(*col, 3);
                assert_eq!(pattern.delta(), 1);
                assert_eq!(pattern.size(), 4);
                assert_eq!(vals, &[4.0, 5.0, 6.0, 7.0]);
            }
            other => panic!("expected pattern, got {other:?}"),
        }
    }

    #[test]
    fn short_runs_stay_plain() {
        let model = dense_row(&[0, 1, 2, 9], 16);
        let opts = opts_with(vec![IterationOrder::Horizontal], 4);
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_all().unwrap();
        assert_eq!(count_patterns(enc.model()), 0);
    }

    #[test]
    fn max_limit_splits_long_runs() {
        let cols: Vec<usize> = (0..12).collect();
        let model = dense_row(&cols, 16);
        let mut opts = opts_with(vec![IterationOrder::Horizontal], 4);
        opts.max_limit = 8;
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_all().unwrap();

        // the 11-delta run becomes one size-8 pattern; the residue of 3 is
        // below min_limit and stays plain
        let m = enc.model();
        let sizes: Vec<usize> = m.row(0)
            .iter()
            .filter_map(|e| match e {
                RowElem::Encoded { pattern, .. } => Some(pattern.size()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![8]);
        let plains = m.row(0)
            .iter()
            .filter(|e| matches!(e, RowElem::Plain { .. }))
            .count();
        assert_eq!(plains, 4);
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let a = CsrMatrix::from_sorted_triples(
            4,
            8,
            vec![
                (0, 0, 1.0),
                (0, 1, 2.0),
                (0, 2, 3.0),
                (0, 3, 4.0),
                (0, 4, 5.0),
                (1, 2, 6.0),
                (2, 0, 7.0),
                (2, 4, 8.0),
                (3, 1, 9.0),
                (3, 3, 10.0),
                (3, 5, 11.0),
                (3, 7, 12.0),
            ],
        )
        .unwrap();
        let reference = SpmModel::from_csr_window(&a, 0, 4).to_csr().unwrap();

        for order in [
            IterationOrder::Horizontal,
            IterationOrder::Vertical,
            IterationOrder::Diagonal,
            IterationOrder::AntiDiagonal,
        ] {
            let model = SpmModel::from_csr_window(&a, 0, 4);
            let opts = opts_with(vec![order], 2);
            let mut enc = Encoder::new(model, opts).unwrap();
            enc.encode(order);
            enc.decode(order);
            let back = enc.into_model().to_csr().unwrap();
            assert_eq!(back.col_ind, reference.col_ind, "{order:?}");
            assert_eq!(back.values, reference.values, "{order:?}");
        }
    }

    #[test]
    fn block_run_forms_blocks() {
        // 2x6 dense strip: rows 0..2, cols 0..6
        let mut triples = Vec::new();
        for r in 0..2 {
            for c in 0..6 {
                triples.push((r, c, (r * 6 + c) as f64));
            }
        }
        let a = CsrMatrix::from_sorted_triples(2, 6, triples).unwrap();
        let model = SpmModel::from_csr_window(&a, 0, 2);
        let opts = opts_with(vec![IterationOrder::BlockRow(2)], 4);
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_all().unwrap();

        let mut m = enc.into_model();
        m.transform(IterationOrder::Horizontal);
        let mut found = Vec::new();
        for i in 0..m.n_order_rows() {
            for e in m.row(i) {
                if let RowElem::Encoded { col, pattern, vals } = e {
                    found.push((i, *col, pattern.order(), pattern.size(), vals.len()));
                }
            }
        }
        assert_eq!(found.len(), 1);
        let (row, col, order, size, nvals) = found[0];
        assert_eq!((row, col), (0, 0));
        assert_eq!(order, IterationOrder::BlockRow(2));
        assert_eq!(size, 12);
        assert_eq!(nvals, 12);
    }

    #[test]
    fn block_split_descends_delta_set() {
        // 2x7 dense strip with split_blocks: delta set {2,3} from serial plan
        let mut triples = Vec::new();
        for r in 0..2 {
            for c in 0..7 {
                triples.push((r, c, 1.0f64));
            }
        }
        let a = CsrMatrix::from_sorted_triples(2, 7, triples).unwrap();
        let model = SpmModel::from_csr_window(&a, 0, 2);

        let order = IterationOrder::BlockRow(2);
        let mut opts = opts_with(vec![order], 4);
        opts.split_blocks = true;
        let plan = BTreeMap::from([(order, BTreeSet::from([2usize, 3usize]))]);
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_serial(&[order], &plan).unwrap();

        let mut m = enc.into_model();
        m.transform(IterationOrder::Horizontal);
        let dims: Vec<usize> = (0..m.n_order_rows())
            .flat_map(|i| m.row(i))
            .filter_map(|e| match e {
                RowElem::Encoded { pattern, .. } => Some(pattern.delta()),
                _ => None,
            })
            .collect();
        // 7 block columns = greedy 3 + 3, remainder 1 stays plain
        assert_eq!(dims, vec![3, 3]);
    }

    #[test]
    fn diagonal_band_encodes_diagonally() {
        // A[i][i] = 2, A[i][i+1] = 1 on a 6x6 band
        let mut triples = Vec::new();
        for i in 0..6 {
            triples.push((i, i, 2.0f64));
            if i + 1 < 6 {
                triples.push((i, i + 1, 1.0));
            }
        }
        let a = CsrMatrix::from_sorted_triples(6, 6, triples).unwrap();
        let model = SpmModel::from_csr_window(&a, 0, 6);
        let opts = opts_with(vec![IterationOrder::Diagonal], 4);
        let mut enc = Encoder::new(model, opts).unwrap();
        enc.encode_all().unwrap();

        let m = enc.model();
        let patterns: Vec<(usize, usize)> = (0..m.n_order_rows())
            .flat_map(|i| m.row(i))
            .filter_map(|e| match e {
                RowElem::Encoded { pattern, .. } => {
                    Some((pattern.order().tag() as usize, pattern.size()))
                }
                _ => None,
            })
            .collect();
        // both the 6-long main diagonal and the 5-long superdiagonal qualify
        assert_eq!(patterns.len(), 2);
        assert!(patterns.iter().all(|&(tag, _)| tag == 3));
        let sizes: Vec<usize> = patterns.iter().map(|&(_, s)| s).collect();
        assert!(sizes.contains(&5));
        assert!(sizes.contains(&4));
    }

    #[test]
    fn explore_backtracks_cleanly() {
        let mut triples = Vec::new();
        for i in 0..6 {
            for c in 0..6 {
                if (i + c) % 2 == 0 {
                    triples.push((i, c, 1.0f64));
                }
            }
        }
        let a = CsrMatrix::from_sorted_triples(6, 6, triples).unwrap();
        let reference = SpmModel::from_csr_window(&a, 0, 6).to_csr().unwrap();

        let model = SpmModel::from_csr_window(&a, 0, 6);
        let opts = opts_with(
            vec![IterationOrder::Horizontal, IterationOrder::Vertical],
            2,
        );
        let mut enc = Encoder::new(model, opts).unwrap();
        let paths = enc.explore(2).unwrap();
        assert!(!paths.is_empty());

        // exploration must leave the matrix exactly as it found it
        let back = enc.into_model().to_csr().unwrap();
        assert_eq!(back.col_ind, reference.col_ind);
        assert_eq!(back.values, reference.values);
    }
}
