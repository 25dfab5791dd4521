//! Content digests and hashing helpers.

use std::{fmt, path::Path, str::FromStr};

use sha2::{Digest as _, Sha256};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{StrataError, StrataResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The blob sum of the well-known empty tar layer. Registries hand this out
/// for layers that carry no filesystem changes; it is never downloaded.
pub const EMPTY_TAR_BLOB_SUM: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// Buffer size for whole-file hashing.
const HASH_READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The hash algorithm of a [`ContentDigest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256.
    Sha256,
}

/// A content digest in `algorithm:hex` text form, e.g.
/// `sha256:4bcdc4…`. Only lower-hex digests of the right length parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

/// Incrementally hashes a byte stream, e.g. a blob body as it is written to
/// disk, so validation does not need a second read of the file.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContentDigest {
    /// Returns the digest algorithm.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the hex portion of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl StreamingHasher {
    /// Creates a fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the hasher.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Consumes the hasher and returns the lower-hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the lower-hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hashes a file on disk, reading in chunks so large blobs do not get
/// buffered whole.
pub async fn file_sha256_hex(path: &Path) -> StrataResult<String> {
    let mut file = File::open(path).await?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ContentDigest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            StrataError::ManifestMalformed(format!("digest missing algorithm prefix: {s}"))
        })?;

        let algorithm = match algorithm {
            "sha256" => DigestAlgorithm::Sha256,
            other => {
                return Err(StrataError::ManifestMalformed(format!(
                    "unsupported digest algorithm: {other}"
                )))
            }
        };

        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StrataError::ManifestMalformed(format!(
                "digest is not 64 chars of lower hex: {s}"
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
