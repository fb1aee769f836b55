//! Errors of the archive layer.

use super::ObjectMeta;
use thiserror::Error;

/// Failure of a single pull or push against an archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// No object is archived under the requested handle.
    #[error("no object archived under {0:?}")]
    UnknownObject(ObjectMeta),
    /// The stored bytes no longer match the handle's digest.
    #[error("object {0:?} failed its digest check")]
    DigestMismatch(ObjectMeta),
    /// Object (de)serialization failed.
    #[error("object codec failed: {0}")]
    Codec(#[from] bincode::Error),
    /// The task's work was already covered by a concurrent task. Callers
    /// treat this as success after confirming the expected post-state.
    #[error("task already covered by concurrent work")]
    Covered,
    /// Backend-specific terminal failure.
    #[error("archive backend failed: {0}")]
    Backend(String),
}
