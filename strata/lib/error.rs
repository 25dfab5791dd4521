use std::path::PathBuf;

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a strata-related operation.
pub type StrataResult<T> = Result<T, StrataError>;

/// An error raised while materializing an image.
///
/// Each fatal condition class gets its own variant so that callers can
/// discriminate without string matching.
#[derive(Debug, Error)]
pub enum StrataError {
    /// An image coordinate could not be constructed from the given inputs.
    #[error("invalid image coordinate: {0}")]
    CoordinateInvalid(String),

    /// A manifest was structurally invalid (missing keys, wrong schema
    /// version, misaligned layer lists, or an unresolvable layer graph).
    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    /// Content failed digest verification.
    #[error("digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// What was being verified (manifest, or a blob digest).
        subject: String,
        /// The digest the content was required to have.
        expected: String,
        /// The digest the content actually hashed to.
        actual: String,
    },

    /// The registry or blob store misbehaved at the transport level
    /// (unexpected status, missing required header, truncated body).
    #[error("transport error: {0}")]
    TransportError(String),

    /// Authentication with the registry failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A save archive was structurally invalid.
    #[error("malformed save archive: {0}")]
    ArchiveMalformed(String),

    /// A blob cache entry failed revalidation twice.
    #[error("cached blob {0} failed validation after refetch")]
    BlobUnrecoverable(String),

    /// A required file was not found on disk.
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred when decoding a JSON document.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred during a directory walk.
    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StrataError {
    /// Creates a `DigestMismatch` for the named subject.
    pub fn digest_mismatch(
        subject: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DigestMismatch {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
