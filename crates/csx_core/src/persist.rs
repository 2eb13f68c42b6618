//! On-disk caching of an encoded matrix.
//!
//! ```text
//! HEADER      magic "CSX1" u32le, nrows u64, ncols u64, nnz u64,
//!             nthreads u32, flags u32
//! PER THREAD  row_start u64, nrows u64, nnz u64, ctl_size u64,
//!             id_map u32* terminated by 0xffff_ffff
//! STREAMS     values f64le (all threads),
//!             then dv f64le (all threads, symmetric caches only),
//!             then ctl bytes (all threads)
//! ```
//!
//! Symmetric caches store each thread's strictly-lower CSX block plus its
//! diagonal slice and set the `SYMMETRIC` flag; `nnz` stays the full
//! (mirrored) count while the per-thread counts cover the lower triangle.
//! The layout stores 64-bit values; readers and writers interoperate only
//! when they agree on the flag bits.

use std::io::{Read, Write};

use crate::assemble::CsxMatrix;
use crate::driver::{EncodedThread, SpmMt, SpmMtSym, SymThread};
use crate::error::{CsxError, CsxResult};
use crate::mem::Placement;

pub const MAGIC: u32 = u32::from_le_bytes(*b"CSX1");
pub const ID_MAP_END: u32 = u32::MAX;

pub const FLAG_ALIGNED: u32 = 1;
pub const FLAG_FULL_COLIND: u32 = 1 << 1;
pub const FLAG_ROW_JUMPS: u32 = 1 << 2;
pub const FLAG_SYMMETRIC: u32 = 1 << 3;

pub fn write_spm_mt<W: Write>(m: &SpmMt<f64>, w: &mut W) -> CsxResult<()> {
    let csxs: Vec<&CsxMatrix<f64>> = m.threads.iter().map(|t| &t.csx).collect();
    write_parts(w, m.nrows, m.ncols, m.nnz, &csxs, None)
}

pub fn write_spm_mt_sym<W: Write>(m: &SpmMtSym<f64>, w: &mut W) -> CsxResult<()> {
    let csxs: Vec<&CsxMatrix<f64>> = m.threads.iter().map(|t| &t.encoded.csx).collect();
    let dvs: Vec<&[f64]> = m.threads.iter().map(|t| t.dv.as_slice()).collect();
    write_parts(w, m.nrows, m.ncols, m.nnz, &csxs, Some(&dvs))
}

pub fn read_spm_mt<R: Read>(r: &mut R) -> CsxResult<SpmMt<f64>> {
    let parts = read_parts(r)?;
    if parts.flags & FLAG_SYMMETRIC != 0 {
        return Err(CsxError::BadInput(
            "CSX1 file holds a symmetric matrix; use the symmetric loader".to_string(),
        ));
    }
    if parts.threads.iter().map(|(c, _)| c.nnz).sum::<usize>() != parts.nnz {
        return Err(CsxError::BadInput(
            "partition nonzero counts disagree with the header".to_string(),
        ));
    }

    let threads = parts
        .threads
        .into_iter()
        .map(|(csx, _)| EncodedThread::new(csx, Vec::new()))
        .collect::<CsxResult<Vec<_>>>()?;

    Ok(SpmMt {
        nrows: parts.nrows,
        ncols: parts.ncols,
        nnz: parts.nnz,
        threads,
        placement: Placement::default(),
    })
}

pub fn read_spm_mt_sym<R: Read>(r: &mut R) -> CsxResult<SpmMtSym<f64>> {
    let parts = read_parts(r)?;
    if parts.flags & FLAG_SYMMETRIC == 0 {
        return Err(CsxError::BadInput(
            "CSX1 file holds a general matrix; use the general loader".to_string(),
        ));
    }

    let threads = parts
        .threads
        .into_iter()
        .map(|(csx, dv)| {
            let dv = dv.expect("symmetric cache carries diagonal slices");
            Ok(SymThread {
                encoded: EncodedThread::new(csx, Vec::new())?,
                dv,
            })
        })
        .collect::<CsxResult<Vec<_>>>()?;

    Ok(SpmMtSym {
        nrows: parts.nrows,
        ncols: parts.ncols,
        nnz: parts.nnz,
        threads,
        placement: Placement::default(),
    })
}

fn write_parts<W: Write>(
    w: &mut W,
    nrows: usize,
    ncols: usize,
    nnz: usize,
    csxs: &[&CsxMatrix<f64>],
    dvs: Option<&[&[f64]]>,
) -> CsxResult<()> {
    let first = csxs.first().ok_or_else(|| {
        CsxError::BadInput("cannot persist a matrix with no partitions".to_string())
    })?;
    let mut flags = 0u32;
    if first.aligned {
        flags |= FLAG_ALIGNED;
    }
    if first.full_column_indices {
        flags |= FLAG_FULL_COLIND;
    }
    if csxs.iter().any(|c| c.row_jumps) {
        flags |= FLAG_ROW_JUMPS;
    }
    if dvs.is_some() {
        flags |= FLAG_SYMMETRIC;
    }

    w.write_all(&MAGIC.to_le_bytes())?;
    w.write_all(&(nrows as u64).to_le_bytes())?;
    w.write_all(&(ncols as u64).to_le_bytes())?;
    w.write_all(&(nnz as u64).to_le_bytes())?;
    w.write_all(&(csxs.len() as u32).to_le_bytes())?;
    w.write_all(&flags.to_le_bytes())?;

    for c in csxs {
        w.write_all(&(c.row_start as u64).to_le_bytes())?;
        w.write_all(&(c.nrows as u64).to_le_bytes())?;
        w.write_all(&(c.nnz as u64).to_le_bytes())?;
        w.write_all(&(c.ctl_size() as u64).to_le_bytes())?;
        for &id in &c.id_map {
            w.write_all(&id.to_le_bytes())?;
        }
        w.write_all(&ID_MAP_END.to_le_bytes())?;
    }

    for c in csxs {
        for &v in &c.values {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    if let Some(dvs) = dvs {
        for dv in dvs {
            for &v in *dv {
                w.write_all(&v.to_le_bytes())?;
            }
        }
    }
    for c in csxs {
        w.write_all(&c.ctl)?;
    }
    Ok(())
}

struct Parts {
    nrows: usize,
    ncols: usize,
    nnz: usize,
    flags: u32,
    /// One CSX block per thread, plus its diagonal slice for symmetric
    /// caches.
    threads: Vec<(CsxMatrix<f64>, Option<Vec<f64>>)>,
}

fn read_parts<R: Read>(r: &mut R) -> CsxResult<Parts> {
    if read_u32(r)? != MAGIC {
        return Err(CsxError::BadInput("not a CSX1 file".to_string()));
    }
    let nrows = read_u64(r)? as usize;
    let ncols = read_u64(r)? as usize;
    let nnz = read_u64(r)? as usize;
    let nthreads = read_u32(r)? as usize;
    let flags = read_u32(r)?;
    if nthreads == 0 {
        return Err(CsxError::BadInput("CSX1 file with zero partitions".to_string()));
    }
    let symmetric = flags & FLAG_SYMMETRIC != 0;

    struct ThreadHeader {
        row_start: usize,
        nrows: usize,
        nnz: usize,
        ctl_size: usize,
        id_map: Vec<u32>,
    }

    let mut headers = Vec::with_capacity(nthreads);
    for _ in 0..nthreads {
        let row_start = read_u64(r)? as usize;
        let t_nrows = read_u64(r)? as usize;
        let t_nnz = read_u64(r)? as usize;
        let ctl_size = read_u64(r)? as usize;
        let mut id_map = Vec::new();
        loop {
            let id = read_u32(r)?;
            if id == ID_MAP_END {
                break;
            }
            id_map.push(id);
        }
        headers.push(ThreadHeader {
            row_start,
            nrows: t_nrows,
            nnz: t_nnz,
            ctl_size,
            id_map,
        });
    }

    // symmetric partitions cover the lower triangle of the full count
    if headers.iter().map(|h| h.nnz).sum::<usize>() > nnz {
        return Err(CsxError::BadInput(
            "partition nonzero counts exceed the header".to_string(),
        ));
    }

    let mut all_values = Vec::with_capacity(nthreads);
    for h in &headers {
        let mut values = Vec::with_capacity(h.nnz);
        for _ in 0..h.nnz {
            values.push(read_f64(r)?);
        }
        all_values.push(values);
    }

    let mut all_dv = Vec::with_capacity(nthreads);
    for h in &headers {
        if symmetric {
            let mut dv = Vec::with_capacity(h.nrows);
            for _ in 0..h.nrows {
                dv.push(read_f64(r)?);
            }
            all_dv.push(Some(dv));
        } else {
            all_dv.push(None);
        }
    }

    let mut threads = Vec::with_capacity(nthreads);
    for ((h, values), dv) in headers.into_iter().zip(all_values).zip(all_dv) {
        let mut ctl = vec![0u8; h.ctl_size];
        r.read_exact(&mut ctl)?;
        let csx = CsxMatrix {
            nrows: h.nrows,
            ncols,
            nnz: h.nnz,
            row_start: h.row_start,
            ctl,
            values,
            id_map: h.id_map,
            aligned: flags & FLAG_ALIGNED != 0,
            full_column_indices: flags & FLAG_FULL_COLIND != 0,
            row_jumps: flags & FLAG_ROW_JUMPS != 0,
        };
        threads.push((csx, dv));
    }

    Ok(Parts {
        nrows,
        ncols,
        nnz,
        flags,
        threads,
    })
}

fn read_u32<R: Read>(r: &mut R) -> CsxResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> CsxResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> CsxResult<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeOptions;
    use crate::csr::CsrMatrix;

    fn sample() -> CsrMatrix<f64> {
        let mut triples = Vec::new();
        for i in 0..20 {
            triples.push((i, i, 1.0 + i as f64));
            if i + 2 < 20 {
                triples.push((i, i + 2, 0.5));
            }
        }
        triples.sort_by_key(|&(r, c, _)| (r, c));
        CsrMatrix::from_sorted_triples(20, 20, triples).unwrap()
    }

    fn sample_symmetric() -> CsrMatrix<f64> {
        let n = 16;
        let mut triples = Vec::new();
        for i in 0..n {
            triples.push((i, i, 4.0 + i as f64));
            if i >= 2 {
                let v = 1.0 + (i % 3) as f64;
                triples.push((i, i - 2, v));
                triples.push((i - 2, i, v));
            }
        }
        triples.sort_by_key(|&(r, c, _)| (r, c));
        CsrMatrix::from_sorted_triples(n, n, triples).unwrap()
    }

    #[test]
    fn roundtrip_preserves_streams_and_results() {
        let a = sample();
        let m = SpmMt::from_csr(&a, 3, &EncodeOptions::default()).unwrap();

        let mut buf = Vec::new();
        write_spm_mt(&m, &mut buf).unwrap();
        let restored = read_spm_mt(&mut buf.as_slice()).unwrap();

        assert_eq!(restored.nrows, m.nrows);
        assert_eq!(restored.threads.len(), m.threads.len());
        for (t0, t1) in m.threads.iter().zip(restored.threads.iter()) {
            assert_eq!(t0.csx.ctl, t1.csx.ctl);
            assert_eq!(t0.csx.values, t1.csx.values);
            assert_eq!(t0.csx.id_map, t1.csx.id_map);
            assert_eq!(t0.csx.row_start, t1.csx.row_start);
        }

        let worst = restored.check_against(&a, 1).unwrap();
        assert!(worst < 1e-12);
    }

    #[test]
    fn symmetric_roundtrip_preserves_diagonals_and_results() {
        let a = sample_symmetric();
        let m = SpmMtSym::from_csr(&a, 2, &EncodeOptions::default()).unwrap();

        let mut buf = Vec::new();
        write_spm_mt_sym(&m, &mut buf).unwrap();
        let restored = read_spm_mt_sym(&mut buf.as_slice()).unwrap();

        assert_eq!(restored.nnz, m.nnz);
        assert_eq!(restored.threads.len(), m.threads.len());
        for (t0, t1) in m.threads.iter().zip(restored.threads.iter()) {
            assert_eq!(t0.encoded.csx.ctl, t1.encoded.csx.ctl);
            assert_eq!(t0.encoded.csx.values, t1.encoded.csx.values);
            assert_eq!(t0.dv, t1.dv);
        }

        let worst = restored.check_against(&a, 1).unwrap();
        assert!(worst < 1e-12);
    }

    #[test]
    fn loaders_reject_the_wrong_symmetry_flag() {
        let a = sample_symmetric();

        let sym = SpmMtSym::from_csr(&a, 2, &EncodeOptions::default()).unwrap();
        let mut buf = Vec::new();
        write_spm_mt_sym(&sym, &mut buf).unwrap();
        assert!(matches!(
            read_spm_mt(&mut buf.as_slice()),
            Err(CsxError::BadInput(_))
        ));

        let general = SpmMt::from_csr(&a, 2, &EncodeOptions::default()).unwrap();
        let mut buf = Vec::new();
        write_spm_mt(&general, &mut buf).unwrap();
        assert!(matches!(
            read_spm_mt_sym(&mut buf.as_slice()),
            Err(CsxError::BadInput(_))
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = b"NOPE".to_vec();
        assert!(matches!(
            read_spm_mt(&mut buf.as_slice()),
            Err(CsxError::BadInput(_))
        ));
    }

    #[test]
    fn rejects_inconsistent_nnz() {
        let a = sample();
        let m = SpmMt::from_csr(&a, 2, &EncodeOptions::default()).unwrap();
        let mut buf = Vec::new();
        write_spm_mt(&m, &mut buf).unwrap();
        // corrupt the global nnz field
        buf[20] ^= 0xff;
        assert!(read_spm_mt(&mut buf.as_slice()).is_err());
    }
}
