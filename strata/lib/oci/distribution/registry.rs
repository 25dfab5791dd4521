//! The Docker Registry v2 client: manifest retrieval with digest
//! verification, and blob downloads into the shared cache.

use std::path::{Path, PathBuf};

use reqwest::{header, StatusCode, Url};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    oci::{
        coordinate::{AuthMethod, ImageCoordinate},
        manifest::ManifestV1,
    },
    utils::{blob_cache_path, file_sha256_hex, ContentDigest, StreamingHasher, PARTIAL_BLOB_SUFFIX},
    StrataError, StrataResult,
};

use super::{auth::AuthSession, transport::Transport};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound on `Location` hops while chasing a blob.
const MAX_BLOB_REDIRECTS: usize = 5;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client bound to one image coordinate.
///
/// Holds the per-coordinate transport (CA bundle, proxy, no auto-redirect)
/// and authentication session (cached bearer token). All protocol-level
/// verification lives here: manifest headers and canonical digest, blob
/// digests, content lengths.
#[derive(Debug)]
pub struct RegistryClient {
    coordinate: ImageCoordinate,
    transport: Transport,
    auth: AuthSession,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryClient {
    /// Builds a client for the coordinate.
    pub fn new(coordinate: ImageCoordinate) -> StrataResult<Self> {
        let transport = Transport::for_coordinate(&coordinate)?;
        let auth = AuthSession::for_coordinate(&coordinate);
        Ok(Self {
            coordinate,
            transport,
            auth,
        })
    }

    /// Returns the coordinate this client serves.
    pub fn coordinate(&self) -> &ImageCoordinate {
        &self.coordinate
    }

    /// Fetches, verifies and parses the image manifest.
    ///
    /// A 401 is answered with one token exchange and one retry; a second
    /// 401 is fatal. The response must carry `Docker-Content-Digest` and
    /// `Content-Length`, the body must be exactly that long, and the
    /// canonical signed-subrange digest must match the declared one.
    pub async fn fetch_manifest(&self) -> StrataResult<ManifestV1> {
        let url = self.coordinate.manifest_url();
        tracing::debug!(%url, "fetching manifest");

        let mut response = self.transport.get(&url, self.auth.auth_header().as_ref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge_headers = response.headers().clone();
            response = self.retry_unauthorized(&challenge_headers, &url).await?;
        }
        if response.status() != StatusCode::OK {
            return Err(StrataError::TransportError(format!(
                "bad response from registry status={}",
                response.status().as_u16()
            )));
        }

        let declared: ContentDigest = required_header(&response, "docker-content-digest")?
            .parse()
            .map_err(|_| {
                StrataError::TransportError("unparseable docker-content-digest header".into())
            })?;
        let content_length: u64 = required_header(&response, "content-length")?
            .parse()
            .map_err(|_| StrataError::TransportError("unparseable content-length header".into()))?;

        let body = response.bytes().await?;
        if body.len() as u64 != content_length {
            return Err(StrataError::TransportError(format!(
                "failed to read manifest: {}/{} bytes read",
                body.len(),
                content_length
            )));
        }

        let manifest = ManifestV1::parse(&body)?;
        manifest.verify_canonical_digest(&body, declared.hex())?;

        Ok(manifest)
    }

    /// Ensures `<cache>/<blob_sum>.tar` holds a validated copy of the blob
    /// and returns its path.
    ///
    /// A cached entry is revalidated (unless the coordinate disables
    /// checksums); on mismatch it is deleted and refetched. A freshly
    /// downloaded blob that fails validation is downloaded once more; a
    /// second failure is fatal.
    pub async fn download_layer(&self, blob_sum: &str, cache_dir: &Path) -> StrataResult<PathBuf> {
        let digest: ContentDigest = blob_sum
            .parse()
            .map_err(|_| StrataError::ManifestMalformed(format!("invalid blob sum: {blob_sum}")))?;
        let target = blob_cache_path(cache_dir, blob_sum);
        fs::create_dir_all(cache_dir).await?;

        if fs::try_exists(&target).await? {
            if !self.coordinate.get_check_blob_checksums() {
                return Ok(target);
            }
            let actual_hex = file_sha256_hex(&target).await?;
            if actual_hex == digest.hex() {
                tracing::info!(%blob_sum, "layer already cached, skipping download");
                return Ok(target);
            }
            tracing::warn!(%blob_sum, "cached layer failed revalidation, refetching");
            fs::remove_file(&target).await?;
        }

        match self.fetch_blob(blob_sum, &digest, cache_dir, &target).await {
            Ok(()) => Ok(target),
            Err(StrataError::DigestMismatch { .. }) => {
                tracing::warn!(%blob_sum, "downloaded layer failed validation, retrying once");
                self.fetch_blob(blob_sum, &digest, cache_dir, &target)
                    .await
                    .map_err(|e| match e {
                        StrataError::DigestMismatch { .. } => {
                            StrataError::BlobUnrecoverable(blob_sum.to_string())
                        }
                        other => other,
                    })?;
                Ok(target)
            }
            Err(other) => Err(other),
        }
    }

    /// Downloads one blob into the cache: request loop (401 negotiation,
    /// redirect chasing with `Authorization` stripped off cross-origin
    /// hops), then a streamed, hashed write into a partial file that is
    /// renamed over the target only after validation.
    async fn fetch_blob(
        &self,
        blob_sum: &str,
        digest: &ContentDigest,
        cache_dir: &Path,
        target: &Path,
    ) -> StrataResult<()> {
        let registry_origin = Url::parse(&self.coordinate.registry_url())
            .map_err(|e| StrataError::TransportError(format!("bad registry url: {e}")))?
            .origin();

        let mut url = Url::parse(&self.coordinate.blob_url(blob_sum))
            .map_err(|e| StrataError::TransportError(format!("bad blob url: {e}")))?;
        let mut send_auth = true;
        let mut negotiated = false;
        let mut redirects = 0;

        let mut response = loop {
            let auth_header = if send_auth {
                self.auth.auth_header()
            } else {
                None
            };
            let response = self.transport.get(url.as_str(), auth_header.as_ref()).await?;
            let status = response.status();

            if status.is_success() {
                break response;
            }

            if status == StatusCode::UNAUTHORIZED
                && send_auth
                && !negotiated
                && self.auth.method() == AuthMethod::Token
            {
                let challenge = required_header(&response, "www-authenticate")?;
                self.auth.negotiate(&self.transport, &challenge).await?;
                negotiated = true;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(StrataError::AuthFailed(format!(
                    "blob {blob_sum} still unauthorized"
                )));
            }

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_BLOB_REDIRECTS {
                    return Err(StrataError::TransportError(format!(
                        "too many redirects fetching blob {blob_sum}"
                    )));
                }
                let location = required_header(&response, "location")?;
                url = url.join(&location).map_err(|e| {
                    StrataError::TransportError(format!("unparseable redirect location: {e}"))
                })?;
                // Blob CDNs reject the registry token, and forwarding it
                // off-origin would leak credentials.
                send_auth = send_auth && url.origin() == registry_origin;
                tracing::debug!(%url, send_auth, "following blob redirect");
                continue;
            }

            return Err(StrataError::TransportError(format!(
                "got status {} fetching blob {blob_sum}",
                status.as_u16()
            )));
        };

        let content_length: u64 = required_header(&response, "content-length")?
            .parse()
            .map_err(|_| StrataError::TransportError("unparseable content-length header".into()))?;

        // The partial file is unlinked on drop, so an error or a
        // cancellation anywhere below leaves the cache untouched.
        let partial = tempfile::Builder::new()
            .prefix(&format!("{blob_sum}{PARTIAL_BLOB_SUFFIX}"))
            .tempfile_in(cache_dir)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(partial.path())
            .await?;

        let mut hasher = StreamingHasher::new();
        let mut received: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            received += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if received != content_length {
            return Err(StrataError::TransportError(format!(
                "truncated blob {blob_sum}: {received}/{content_length} bytes read"
            )));
        }

        let actual_hex = hasher.finalize_hex();
        if actual_hex != digest.hex() {
            return Err(StrataError::digest_mismatch(
                format!("blob {blob_sum}"),
                digest.hex(),
                actual_hex,
            ));
        }

        partial.persist(target).map_err(|e| e.error)?;
        tracing::info!(%blob_sum, "pulled layer into cache");

        Ok(())
    }

    /// Answers a manifest 401: one token exchange, one retry. Works only
    /// in token mode; in basic mode the credentials were already attached,
    /// so a 401 is final.
    async fn retry_unauthorized(
        &self,
        headers: &header::HeaderMap,
        url: &str,
    ) -> StrataResult<reqwest::Response> {
        if self.auth.method() != AuthMethod::Token {
            return Err(StrataError::AuthFailed(
                "registry rejected basic credentials".into(),
            ));
        }

        let challenge = headers
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                StrataError::AuthFailed("401 without WWW-Authenticate challenge".into())
            })?;
        self.auth.negotiate(&self.transport, challenge).await?;

        let response = self
            .transport
            .get(url, self.auth.auth_header().as_ref())
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StrataError::AuthFailed(
                "still unauthorized after token exchange".into(),
            ));
        }
        Ok(response)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads a header the protocol requires, as a string.
fn required_header(response: &reqwest::Response, name: &str) -> StrataResult<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| StrataError::TransportError(format!("no {name} header found")))
}
