use thiserror::Error;

pub type CsxResult<T> = Result<T, CsxError>;

/// Engine-level errors. Sampling failures and NUMA placement mismatches are
/// recoverable and reported through the logger instead of this enum.
#[derive(Debug, Error)]
pub enum CsxError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: usize },

    /// A unit with an unknown pattern id, or a unit whose decoded span would
    /// exceed the bounds of `values`, `ctl`, `x` or the thread's row slice.
    #[error("corrupt ctl stream at byte {offset}: {reason}")]
    CorruptCtl { offset: usize, reason: String },

    #[error(transparent)]
    Csr(#[from] CsrError),

    #[error(transparent)]
    Mmf(#[from] MmfError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CsxError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        CsxError::CorruptCtl {
            offset,
            reason: reason.into(),
        }
    }
}

/// CSR structural violations, raised by the builder and the invariant
/// checker.
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("out of bounds index: {index} (max: {max})")]
    OutOfBoundsIndex { index: usize, max: usize },

    #[error("duplicate entry at ({row}, {col})")]
    DuplicateEntry { row: usize, col: usize },

    #[error("entries not sorted at ({row}, {col})")]
    EntriesNotSorted { row: usize, col: usize },

    #[error("invalid row pointers length: {expected} (actual: {actual})")]
    InvalidRowPointersLength { expected: usize, actual: usize },

    #[error("invalid row pointers: {index} (expected: {expected}, actual: {actual})")]
    InvalidRowPointers { index: usize, expected: usize, actual: usize },

    #[error("column indices values length mismatch: {values} (actual: {column_indices})")]
    ColumnIndicesValuesLengthMismatch { values: usize, column_indices: usize },

    #[error("columns not strictly increasing: {index} (expected: {expected}, actual: {actual})")]
    ColumnsNotStrictlyIncreasing { index: usize, expected: usize, actual: usize },
}

/// MatrixMarket loader errors, kept separate so the CLI can map parse
/// failures to their own exit code.
#[derive(Debug, Error)]
pub enum MmfError {
    #[error("invalid banner: {0}")]
    InvalidBanner(String),

    #[error("unsupported matrix type: {0}")]
    UnsupportedType(String),

    #[error("invalid size line: {0}")]
    InvalidSizeLine(String),

    #[error("invalid entry at line {line}: {msg}")]
    InvalidEntry { line: usize, msg: String },

    #[error("entry count mismatch: header says {expected}, file has {actual}")]
    EntryCountMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
