//! Error taxonomy shared across every component.
//!
//! Kinds are stable across transports: the HTTP layer maps them to status
//! codes, the CLI prints them, and the workers use [`Error::is_transient`]
//! to decide between "throw so the queue retries" and "record on the row
//! and return success".
//!
//! | Kind | Retried? | Surfaced? |
//! |------|----------|-----------|
//! | `InvalidUrl`, `InvalidInput` | no | yes |
//! | `PermissionDenied` | no | yes, with actionable message |
//! | `NotFound` | no | yes |
//! | `EmptyFolder`, `FolderCapExceeded` | no | yes |
//! | `RateLimitExhausted` | waited on | only with caller timeout |
//! | `TransientUpstream` | by the queue | becomes `ProcessingFailed` on exhaustion |
//! | `ProcessingFailed` | no | recorded on the image row |
//! | `VectorBackendUnavailable` | no | degrades search, never fails ingest |
//! | `QueueUnavailable`, `StoreUnavailable` | no | health endpoint / fail fast |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request input other than a folder URL (bad topK, bad size).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The folder URL is not a recognized drive folder URL.
    #[error("Invalid drive folder URL: {0}")]
    InvalidUrl(String),

    /// Drive returned 403/404. The message distinguishes "private folder, no
    /// credential supplied" from "the supplied credential lacks access".
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The folder contains no supported images.
    #[error("Folder contains no supported images")]
    EmptyFolder,

    /// Admitting the folder (or the sync delta) would exceed the per-folder cap.
    #[error("Folder exceeds the per-folder image cap: {found} images, cap {cap}")]
    FolderCapExceeded { found: usize, cap: usize },

    /// A limiter `acquire_timeout` expired. Never produced by plain `acquire`.
    #[error("Rate limit capacity not available within {0:?}")]
    RateLimitExhausted(std::time::Duration),

    /// Network/5xx/timeout from an upstream API. Workers rethrow these so the
    /// queue applies its retry policy.
    #[error("Transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Permanent per-row failure (unsupported MIME, corrupt image, definitive
    /// upstream rejection). Recorded on the row, not retried.
    #[error("{0}")]
    ProcessingFailed(String),

    /// The store's vector extension or index is unavailable. Search degrades
    /// to the lexical path; ingestion still persists captions and tags.
    #[error("Vector backend unavailable: {0}")]
    VectorBackendUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Whether the queue should retry a job that failed with this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientUpstream(_)
                | Error::QueueUnavailable(_)
                | Error::StoreUnavailable(_)
                | Error::RateLimitExhausted(_)
        )
    }

    /// Machine-readable code used in JSON error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::InvalidUrl(_) => "invalid_url",
            Error::PermissionDenied(_) => "permission_denied",
            Error::NotFound(_) => "not_found",
            Error::EmptyFolder => "empty_folder",
            Error::FolderCapExceeded { .. } => "folder_cap_exceeded",
            Error::RateLimitExhausted(_) => "rate_limit_exhausted",
            Error::TransientUpstream(_) => "transient_upstream",
            Error::ProcessingFailed(_) => "processing_failed",
            Error::VectorBackendUnavailable(_) => "vector_backend_unavailable",
            Error::QueueUnavailable(_) => "queue_unavailable",
            Error::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TransientUpstream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(Error::TransientUpstream("timeout".into()).is_transient());
        assert!(Error::StoreUnavailable("down".into()).is_transient());
        assert!(!Error::ProcessingFailed("bad image".into()).is_transient());
        assert!(!Error::PermissionDenied("private".into()).is_transient());
        assert!(!Error::EmptyFolder.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::EmptyFolder.code(), "empty_folder");
        assert_eq!(
            Error::FolderCapExceeded { found: 3, cap: 2 }.code(),
            "folder_cap_exceeded"
        );
        assert_eq!(
            Error::VectorBackendUnavailable("no pgvector".into()).code(),
            "vector_backend_unavailable"
        );
    }
}
