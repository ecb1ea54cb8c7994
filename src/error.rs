// Error taxonomy for parsing, persistence, reconciliation and ingestion.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurrencyError {
    #[error("unsupported currency: {0}")]
    Unsupported(String),
}

/// Any failure that aborts a whole report. No records are kept.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("read header: {0}")]
    Header(String),

    #[error("expected {expected} columns, got {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("line {line} {field}: invalid number {value:?}")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line} date: cannot parse {value:?}")]
    InvalidDate { line: usize, value: String },

    #[error("line {line} currency: {source}")]
    Currency {
        line: usize,
        #[source]
        source: CurrencyError,
    },

    #[error("line {line}: {source}")]
    Csv {
        line: usize,
        #[source]
        source: csv::Error,
    },

    #[error("unmarshal: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{count} transactions share reference {reference} for {processor}")]
    AmbiguousReference {
        processor: String,
        reference: String,
        count: usize,
    },

    #[error("lock {name} no longer held by {owner}")]
    LockLost { name: String, owner: String },
}

/// Failure of one step of a full reconciliation run.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("clear discrepancies: {0}")]
    Clear(#[source] StoreError),

    #[error("match settlements: {0}")]
    Match(#[source] StoreError),

    #[error("detect missing: {0}")]
    DetectMissing(#[source] StoreError),

    #[error("detect mismatches: {0}")]
    DetectMismatches(#[source] StoreError),

    #[error("detect orphaned: {0}")]
    DetectOrphaned(#[source] StoreError),

    #[error("acquire run lock: {0}")]
    Lock(#[source] StoreError),

    #[error("another reconciliation run still holds the lock after {waited:?}")]
    Busy { waited: std::time::Duration },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported format: {0}")]
    UnknownFormat(String),

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("format {format} does not belong to processor {processor}")]
    ProcessorMismatch {
        processor: String,
        format: &'static str,
    },

    #[error("parse {format}: {source}")]
    Parse {
        format: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
