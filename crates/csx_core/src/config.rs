//! Encoder configuration and the legacy environment-variable bridge.

use std::collections::{BTreeMap, BTreeSet};
use std::env;

use serde::{Deserialize, Serialize};

use crate::coords::IterationOrder;
use crate::error::{CsxError, CsxResult};

/// Hard ceiling on the element count of one ctl unit (8-bit size field).
pub const UNIT_SIZE_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitPolicy {
    ByRows,
    ByNnz,
}

/// Options consumed by the encoder. `Default` carries the documented
/// defaults; [`EncodeOptions::validate`] rejects inconsistent combinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeOptions {
    /// Orders considered during automatic encoding, in preference order.
    pub iteration_orders: Vec<IterationOrder>,
    /// When set, forces serial encoding: apply `iteration_orders` in the
    /// given sequence, encoding exactly these deltas per order.
    pub deltas_per_order: Option<BTreeMap<IterationOrder, BTreeSet<usize>>>,
    /// Sampling window size for statistics; 0 scans the full matrix.
    pub window_size: usize,
    /// Cap on sampled windows.
    pub samples_max: usize,
    /// Window inclusion probability; 0 derives it from `samples_max`.
    pub sampling_portion: f64,
    pub split_policy: SplitPolicy,
    /// Allow splitting oversize block runs over the delta set.
    pub split_blocks: bool,
    /// Minimum RLE frequency that justifies a pattern header.
    pub min_limit: usize,
    /// Maximum unit size (hard ceiling 255).
    pub max_limit: usize,
    /// Minimum nnz share for a delta candidate to survive filtering.
    pub min_perc: f64,
    /// Pad the ctl stream so delta bodies are naturally aligned.
    pub aligned_ctl: bool,
    /// Store absolute 32-bit column indices instead of column jumps.
    pub full_column_indices: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            iteration_orders: vec![
                IterationOrder::Horizontal,
                IterationOrder::Vertical,
                IterationOrder::Diagonal,
                IterationOrder::AntiDiagonal,
            ],
            deltas_per_order: None,
            window_size: 0,
            samples_max: usize::MAX,
            sampling_portion: 0.0,
            split_policy: SplitPolicy::ByNnz,
            split_blocks: false,
            min_limit: 4,
            max_limit: UNIT_SIZE_MAX,
            min_perc: 0.1,
            aligned_ctl: false,
            full_column_indices: false,
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> CsxResult<()> {
        if self.iteration_orders.is_empty() {
            return Err(CsxError::Config("empty iteration-order list".to_string()));
        }
        if self.min_limit == 0 {
            return Err(CsxError::Config("min_limit must be positive".to_string()));
        }
        if self.max_limit < self.min_limit || self.max_limit > UNIT_SIZE_MAX {
            return Err(CsxError::Config(format!(
                "max_limit must lie in {}..={UNIT_SIZE_MAX}",
                self.min_limit
            )));
        }
        if !(0.0..=1.0).contains(&self.min_perc) {
            return Err(CsxError::Config(format!(
                "min_perc {} outside [0, 1]",
                self.min_perc
            )));
        }
        if !(0.0..=1.0).contains(&self.sampling_portion) {
            return Err(CsxError::Config(format!(
                "sampling_portion {} outside [0, 1]",
                self.sampling_portion
            )));
        }
        for order in &self.iteration_orders {
            if let Some(a) = order.block_alignment() {
                if !(1..=crate::coords::MAX_BLOCK_ALIGN).contains(&a) {
                    return Err(CsxError::Config(format!(
                        "block alignment {a} out of range"
                    )));
                }
            }
        }
        if let Some(deltas) = &self.deltas_per_order {
            for (order, set) in deltas {
                if set.is_empty() {
                    return Err(CsxError::Config(format!(
                        "empty delta set for {}",
                        order.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overlay the legacy environment variables onto `self`. Each variable
    /// corresponds one-to-one to a field: `XFORM_CONF` (comma-separated
    /// order tags), `ENCODE_DELTAS` (`{d,..},{d,..}` per order, switching to
    /// serial mode), `WINDOW_SIZE`, `SAMPLES`, `SAMPLING_PORTION`,
    /// `SPLIT_BLOCKS`.
    pub fn overlay_env(mut self) -> CsxResult<Self> {
        if let Some(conf) = env_nonempty("XFORM_CONF") {
            let mut orders = Vec::new();
            for tok in conf.split(',') {
                let tag: u32 = tok.trim().parse().map_err(|_| {
                    CsxError::Config(format!("XFORM_CONF: bad order tag '{tok}'"))
                })?;
                let order = IterationOrder::from_tag(tag).ok_or_else(|| {
                    CsxError::Config(format!("XFORM_CONF: unknown order tag {tag}"))
                })?;
                orders.push(order);
            }
            self.iteration_orders = orders;
        }

        if let Some(conf) = env_nonempty("ENCODE_DELTAS") {
            let mut per_order = BTreeMap::new();
            let groups: Vec<&str> = conf
                .split('}')
                .map(|g| g.trim_start_matches([',', ' ', '{']))
                .filter(|g| !g.is_empty())
                .collect();
            if groups.len() != self.iteration_orders.len() {
                return Err(CsxError::Config(format!(
                    "ENCODE_DELTAS has {} groups for {} orders",
                    groups.len(),
                    self.iteration_orders.len()
                )));
            }
            for (order, group) in self.iteration_orders.iter().zip(groups) {
                let mut set = BTreeSet::new();
                for tok in group.split(',') {
                    let d: usize = tok.trim().parse().map_err(|_| {
                        CsxError::Config(format!("ENCODE_DELTAS: bad delta '{tok}'"))
                    })?;
                    set.insert(d);
                }
                per_order.insert(*order, set);
            }
            self.deltas_per_order = Some(per_order);
        }

        if let Some(v) = env_nonempty("WINDOW_SIZE") {
            self.window_size = v
                .parse()
                .map_err(|_| CsxError::Config(format!("WINDOW_SIZE: bad value '{v}'")))?;
        }
        if let Some(v) = env_nonempty("SAMPLES") {
            self.samples_max = v
                .parse()
                .map_err(|_| CsxError::Config(format!("SAMPLES: bad value '{v}'")))?;
        }
        if let Some(v) = env_nonempty("SAMPLING_PORTION") {
            self.sampling_portion = v.parse().map_err(|_| {
                CsxError::Config(format!("SAMPLING_PORTION: bad value '{v}'"))
            })?;
        }
        if env::var_os("SPLIT_BLOCKS").is_some() {
            self.split_blocks = true;
        }

        self.validate()?;
        Ok(self)
    }
}

/// Worker count from `MT_CONF`. The original configured per-thread CPU
/// pinning here; affinity is a collaborator concern, so a cpu list degrades
/// to its length.
pub fn threads_from_env() -> CsxResult<Option<usize>> {
    let Some(conf) = env_nonempty("MT_CONF") else {
        return Ok(None);
    };
    if conf.split(',').any(|f| f.trim().parse::<usize>().is_err()) {
        return Err(CsxError::Config(format!("MT_CONF: bad cpu list '{conf}'")));
    }
    Ok(Some(conf.split(',').count()))
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EncodeOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_percentages() {
        let opts = EncodeOptions {
            min_perc: 1.5,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(CsxError::Config(_))));

        let opts = EncodeOptions {
            iteration_orders: vec![],
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(CsxError::Config(_))));
    }

    #[test]
    fn rejects_oversize_unit_limit() {
        let opts = EncodeOptions {
            max_limit: 300,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = EncodeOptions {
            min_limit: 10,
            max_limit: 5,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn env_overlay_parses_orders_and_deltas() {
        // process-global state: set everything up front, clean up after
        env::set_var("XFORM_CONF", "1,3,6");
        env::set_var("ENCODE_DELTAS", "{1,2},{1},{2}");
        env::set_var("WINDOW_SIZE", "128");
        env::set_var("SPLIT_BLOCKS", "1");

        let opts = EncodeOptions::default().overlay_env().unwrap();
        assert_eq!(
            opts.iteration_orders,
            vec![
                IterationOrder::Horizontal,
                IterationOrder::Diagonal,
                IterationOrder::BlockRow(2),
            ]
        );
        let deltas = opts.deltas_per_order.as_ref().unwrap();
        assert_eq!(
            deltas[&IterationOrder::Horizontal],
            BTreeSet::from([1, 2])
        );
        assert_eq!(opts.window_size, 128);
        assert!(opts.split_blocks);

        env::remove_var("XFORM_CONF");
        env::remove_var("ENCODE_DELTAS");
        env::remove_var("WINDOW_SIZE");
        env::remove_var("SPLIT_BLOCKS");
    }
}
