//! Errors surfaced by skeletal tree operations.

use std::fmt::Debug;

use thiserror::Error;

use crate::archive::{ArchiveError, ObjectMeta};

/// Terminal failure of one archival task, with the key range of the
/// subtree it concerned.
#[derive(Debug)]
pub struct TaskFailure<K> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
    pub cause: ArchiveError,
}

/// Errors of the skeletal tree operations.
#[derive(Error, Debug)]
pub enum Error<K: Debug> {
    /// The node covering `key` is a ghost, or its entries map is still
    /// tagged bare. The caller inflates and retries; `key` is the search
    /// key (`None` when the miss happened during a full traversal), `meta`
    /// the storage handle of the ghost when one was hit.
    #[error("node covering {key:?} is not loaded")]
    NotLoaded {
        key: Option<K>,
        meta: Option<ObjectMeta>,
    },
    /// Archived data disagreed with the tree. Never retried.
    #[error("archived data malformed: {0}")]
    DataFormat(String),
    /// Terminal failure of a push or pull batch. Carries every failed
    /// task with its range context.
    #[error("{} archival task(s) aborted", .failures.len())]
    TaskAbort { failures: Vec<TaskFailure<K>> },
    /// Contract violation by the caller. Always fatal.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// Surface area not available in this build.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl<K: Debug> Error<K> {
    /// Shorthand for a single-task abort.
    pub(crate) fn task_abort(lkey: Option<K>, rkey: Option<K>, cause: ArchiveError) -> Self {
        Error::TaskAbort {
            failures: vec![TaskFailure { lkey, rkey, cause }],
        }
    }
}
