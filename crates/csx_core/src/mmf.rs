//! MatrixMarket coordinate-file loading.
//!
//! Supports the `matrix coordinate {real|integer|pattern}
//! {general|symmetric}` banners, `%` comments and the format's 1-based
//! indices (converted to 0-based here, at the boundary). Symmetric files
//! store the lower triangle; [`load_csr_from_reader`] mirrors the
//! off-diagonal entries so the returned CSR is always the full matrix, and
//! the header records that the file was symmetric.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::csr::CsrMatrix;
use crate::error::{CsxResult, MmfError};
use crate::scalar::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MmField {
    Integer,
    Real,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmfHeader {
    pub nrows: usize,
    pub ncols: usize,
    /// Entries stored in the file (for symmetric files, the lower triangle).
    pub stored_entries: usize,
    pub symmetric: bool,
}

pub fn load_csr_file<V: Scalar>(path: impl AsRef<Path>) -> CsxResult<(MmfHeader, CsrMatrix<V>)> {
    let f = File::open(path.as_ref()).map_err(MmfError::from)?;
    load_csr_from_reader(BufReader::new(f))
}

pub fn load_csr_from_reader<V: Scalar, R: BufRead>(
    reader: R,
) -> CsxResult<(MmfHeader, CsrMatrix<V>)> {
    let mut lines = reader.lines().enumerate();

    // Banner (first non-empty line)
    let (banner_line_no, banner) = loop {
        match lines.next() {
            None => return Err(MmfError::InvalidBanner("empty input".to_string()).into()),
            Some((i, line)) => {
                let line = line.map_err(MmfError::from)?;
                let t = line.trim();
                if t.is_empty() {
                    continue;
                }
                let t = t.trim_start_matches('\u{feff}');
                break (i + 1, t.to_string());
            }
        }
    };

    let tokens: Vec<&str> = banner.split_whitespace().collect();
    if tokens.len() != 5 {
        return Err(MmfError::InvalidBanner(format!(
            "expected 5 tokens, got {} at line {}: {:?}",
            tokens.len(),
            banner_line_no,
            banner
        ))
        .into());
    }

    if tokens[0] != "%%MatrixMarket" {
        return Err(MmfError::InvalidBanner(format!(
            "missing %%MatrixMarket at line {banner_line_no}: {banner}"
        ))
        .into());
    }
    let object = tokens[1].to_ascii_lowercase();
    let format = tokens[2].to_ascii_lowercase();
    if object != "matrix" || format != "coordinate" {
        return Err(MmfError::UnsupportedType(format!(
            "only 'matrix coordinate' is supported, got '{}' '{}' (line {}): {}",
            tokens[1], tokens[2], banner_line_no, banner
        ))
        .into());
    }

    let field = match tokens[3].to_ascii_lowercase().as_str() {
        "integer" => MmField::Integer,
        "real" => MmField::Real,
        "pattern" => MmField::Pattern,
        other => {
            return Err(MmfError::UnsupportedType(format!(
                "only 'integer', 'real' and 'pattern' fields are supported, got '{other}' \
                 (line {banner_line_no}): {banner}"
            ))
            .into())
        }
    };

    let symmetric = match tokens[4].to_ascii_lowercase().as_str() {
        "general" => false,
        "symmetric" => true,
        other => {
            return Err(MmfError::UnsupportedType(format!(
                "only 'general' and 'symmetric' symmetry is supported, got '{other}' \
                 (line {banner_line_no}): {banner}"
            ))
            .into())
        }
    };

    // Size line (skip comments/empty)
    let (size_line_no, size_line) = loop {
        match lines.next() {
            None => {
                return Err(MmfError::InvalidSizeLine("missing size line".to_string()).into())
            }
            Some((i, line)) => {
                let line = line.map_err(MmfError::from)?;
                let t = line.trim();
                if t.is_empty() || t.starts_with('%') {
                    continue;
                }
                break (i + 1, t.to_string());
            }
        }
    };

    let parts: Vec<&str> = size_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(MmfError::InvalidSizeLine(format!(
            "expected 3 integers at line {size_line_no}: {size_line}"
        ))
        .into());
    }
    let parse_dim = |s: &str, what: &str| -> Result<usize, MmfError> {
        s.parse().map_err(|e| {
            MmfError::InvalidSizeLine(format!(
                "bad {what} '{s}' at line {size_line_no}: {size_line} ({e})"
            ))
        })
    };
    let nrows = parse_dim(parts[0], "nrows")?;
    let ncols = parse_dim(parts[1], "ncols")?;
    let stored = parse_dim(parts[2], "nnz")?;

    let expected_tokens = if field == MmField::Pattern { 2 } else { 3 };
    let mut triples: Vec<(usize, usize, V)> = Vec::with_capacity(stored);
    let mut read_entries = 0usize;

    for (i, line) in lines {
        let line_no = i + 1;
        let line = line.map_err(MmfError::from)?;
        let t = line.trim();
        if t.is_empty() || t.starts_with('%') {
            continue;
        }
        if read_entries >= stored {
            return Err(MmfError::InvalidEntry {
                line: line_no,
                msg: format!("found more than nnz={stored} entries"),
            }
            .into());
        }

        let parts: Vec<&str> = t.split_whitespace().collect();
        if parts.len() != expected_tokens {
            return Err(MmfError::InvalidEntry {
                line: line_no,
                msg: format!("expected {expected_tokens} tokens, got: {t}"),
            }
            .into());
        }

        let row_1: usize = parts[0].parse().map_err(|e| MmfError::InvalidEntry {
            line: line_no,
            msg: format!("bad row index '{}': {}", parts[0], e),
        })?;
        let col_1: usize = parts[1].parse().map_err(|e| MmfError::InvalidEntry {
            line: line_no,
            msg: format!("bad col index '{}': {}", parts[1], e),
        })?;
        if row_1 == 0 || col_1 == 0 {
            return Err(MmfError::InvalidEntry {
                line: line_no,
                msg: "MatrixMarket indices are 1-based; found 0".to_string(),
            }
            .into());
        }
        let row = row_1 - 1;
        let col = col_1 - 1;

        let val = match field {
            MmField::Pattern => V::one(),
            MmField::Integer => {
                let v: i64 = parts[2].parse().map_err(|e| MmfError::InvalidEntry {
                    line: line_no,
                    msg: format!("bad integer value '{}': {}", parts[2], e),
                })?;
                V::from_f64(v as f64)
            }
            MmField::Real => {
                let v: f64 = parts[2].parse().map_err(|e| MmfError::InvalidEntry {
                    line: line_no,
                    msg: format!("bad real value '{}': {}", parts[2], e),
                })?;
                V::from_f64(v)
            }
        };

        if symmetric && col > row {
            return Err(MmfError::InvalidEntry {
                line: line_no,
                msg: format!(
                    "symmetric file stores the lower triangle, found ({row_1},{col_1})"
                ),
            }
            .into());
        }

        triples.push((row, col, val));
        if symmetric && col < row {
            triples.push((col, row, val));
        }
        read_entries += 1;
    }

    if read_entries != stored {
        return Err(MmfError::EntryCountMismatch {
            expected: stored,
            actual: read_entries,
        }
        .into());
    }

    triples.sort_unstable_by_key(|&(r, c, _)| (r, c));
    let a = CsrMatrix::from_sorted_triples(nrows, ncols, triples)?;

    let header = MmfHeader {
        nrows,
        ncols,
        stored_entries: stored,
        symmetric,
    };
    Ok((header, a))
}
