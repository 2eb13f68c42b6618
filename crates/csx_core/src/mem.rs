//! Vector allocation policy.
//!
//! Large shared vectors (`x`, `y`, `tmp`) go through a pluggable placement:
//! the default process allocator, or a NUMA-aware variant that relies on
//! first-touch page placement, touching each partition from the worker that
//! will own it. Allocation failures surface as `OutOfMemory` instead of
//! aborting.

use std::thread;

use crate::error::{CsxError, CsxResult};
use crate::scalar::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    System,
    /// First-touch interleaving over the given row partition.
    Interleaved,
}

/// Allocate a zeroed vector of `len` values. With `Placement::Interleaved`,
/// `parts` gives the partition lengths and each partition's pages are
/// first-touched by a dedicated thread.
pub fn alloc_vec<V: Scalar>(
    len: usize,
    placement: Placement,
    parts: &[usize],
) -> CsxResult<Vec<V>> {
    let mut v: Vec<V> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| CsxError::OutOfMemory {
        bytes: len * std::mem::size_of::<V>(),
    })?;

    match placement {
        Placement::System => {
            v.resize(len, V::zero());
        }
        Placement::Interleaved => {
            first_touch(&mut v, len, parts);
        }
    }
    Ok(v)
}

fn first_touch<V: Scalar>(v: &mut Vec<V>, len: usize, parts: &[usize]) {
    struct SendPtr<V>(*mut V);
    unsafe impl<V> Send for SendPtr<V> {}

    let base = v.as_mut_ptr();
    thread::scope(|s| {
        let mut offset = 0usize;
        for &part in parts {
            let part = part.min(len - offset);
            let ptr = SendPtr(unsafe { base.add(offset) });
            s.spawn(move || {
                let ptr = ptr;
                for i in 0..part {
                    // the first write binds the page to this thread's node
                    unsafe { ptr.0.add(i).write(V::zero()) };
                }
            });
            offset += part;
            if offset == len {
                break;
            }
        }
        // tail not covered by the partition (if any) stays with the caller
        if offset < len {
            for i in offset..len {
                unsafe { base.add(i).write(V::zero()) };
            }
        }
    });
    // every slot was initialised above
    unsafe { v.set_len(len) };
}

/// Best-effort page-residency validation. Without an OS query interface the
/// check degrades to a warning; a placement mismatch is never fatal.
pub fn verify_placement(placement: Placement, what: &str) {
    if placement == Placement::Interleaved && !cfg!(target_os = "linux") {
        log::warn!("{what}: first-touch placement is not verifiable on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_alloc_is_zeroed() {
        let v: Vec<f64> = alloc_vec(1000, Placement::System, &[]).unwrap();
        assert_eq!(v.len(), 1000);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn interleaved_alloc_is_zeroed() {
        let v: Vec<f64> = alloc_vec(1000, Placement::Interleaved, &[300, 300, 400]).unwrap();
        assert_eq!(v.len(), 1000);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn interleaved_handles_partial_partitions() {
        let v: Vec<f32> = alloc_vec(10, Placement::Interleaved, &[4, 4]).unwrap();
        assert_eq!(v.len(), 10);
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
