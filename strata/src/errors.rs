//! Engine error types.

use thiserror::Error;

use crate::{Rid, TxnId};

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file {0} already exists")]
    FileExists(String),

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("buffer pool exhausted, every frame is pinned")]
    PoolExhausted,

    #[error("no record at {0:?}")]
    RecordNotFound(Rid),

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("uniqueness violation on index {0}")]
    UniquenessViolation(String),

    #[error("transaction {0} acquired a lock in its shrinking phase")]
    LockOnShrinking(TxnId),

    #[error("transaction {0} aborted to prevent deadlock")]
    DeadlockPrevention(TxnId),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
