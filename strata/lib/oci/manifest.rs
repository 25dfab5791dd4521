//! Docker Registry v2, schema 1 image manifests.
//!
//! A v1 manifest is a JWS-ish document: the payload the registry digests is
//! not the raw body but a canonical subrange of it, reconstructed from the
//! `protected` headers of its signature blocks. Verification here is digest
//! equality only; cryptographic validation of the signature chain is out of
//! scope.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use getset::Getters;
use serde::Deserialize;

use crate::{utils::sha256_hex, StrataError, StrataResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed schema-1 manifest. `fs_layers` and `history` are index-aligned:
/// `history[i].v1Compatibility` describes the layer stored at
/// `fs_layers[i].blob_sum`.
#[derive(Debug, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ManifestV1 {
    /// The manifest schema version. Must be 1.
    #[serde(rename = "schemaVersion")]
    schema_version: u64,

    /// The layer blobs, tip-first as served by the registry.
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,

    /// Per-layer history rows carrying embedded v1 config JSON.
    history: Vec<HistoryRow>,

    /// The JWS signature blocks. Only their `protected` headers are
    /// consumed, to reconstruct the canonical payload.
    signatures: Vec<ManifestSignature>,
}

/// One `fsLayers` element.
#[derive(Debug, Clone, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct FsLayer {
    /// The digest of the gzipped layer tar.
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

/// One `history` element; the interesting content is the embedded JSON
/// string in `v1Compatibility`.
#[derive(Debug, Clone, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HistoryRow {
    /// The v1 image config for this layer, as a JSON string.
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

/// One `signatures` element.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSignature {
    /// The JOSE protected header, base64url-encoded.
    protected: String,
}

/// A parsed `v1Compatibility` document: the layer's identity, its parent
/// link, and (on the youngest layer) the runtime configuration.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LayerHistory {
    /// The layer id (a hex string).
    id: String,

    /// The parent layer id; absent exactly once, on the root layer.
    parent: Option<String>,

    /// The container runtime configuration carried by this layer.
    config: Option<RuntimeConfig>,
}

/// The subset of the v1 container configuration that downstream launchers
/// consume.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Environment assignments, each `KEY=VALUE`, in image order.
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,

    /// The entrypoint argv.
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,

    /// The default command argv.
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,

    /// The working directory for the launched process.
    #[serde(rename = "WorkingDir")]
    pub workdir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V1CompatibilityDoc {
    id: Option<String>,
    parent: Option<String>,
    config: Option<RuntimeConfig>,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,

    #[serde(rename = "formatTail")]
    format_tail: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ManifestV1 {
    /// Parses and structurally validates a manifest body.
    ///
    /// Rejects bodies that are not JSON objects with the four required
    /// keys, any schema version other than 1, and history/fsLayers lists
    /// of different lengths.
    pub fn parse(raw: &[u8]) -> StrataResult<Self> {
        let manifest: ManifestV1 = serde_json::from_slice(raw)
            .map_err(|e| StrataError::ManifestMalformed(format!("incorrect format: {e}")))?;

        if manifest.schema_version != 1 {
            return Err(StrataError::ManifestMalformed(format!(
                "incompatible manifest schema: {}",
                manifest.schema_version
            )));
        }

        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(StrataError::ManifestMalformed(format!(
                "layer size mismatch: {} fsLayers vs {} history rows",
                manifest.fs_layers.len(),
                manifest.history.len()
            )));
        }

        Ok(manifest)
    }

    /// Recomputes the canonical signed-subrange digest of `raw` and checks
    /// it against the hex the server declared in `Docker-Content-Digest`.
    ///
    /// Every signature block must agree on `formatLength` and `formatTail`;
    /// the canonical payload is `raw[..formatLength] ++ decode(formatTail)`.
    /// With no signature blocks the payload degenerates to the whole body.
    pub fn verify_canonical_digest(&self, raw: &[u8], expected_hex: &str) -> StrataResult<()> {
        let mut format_length: Option<usize> = None;
        let mut format_tail: Option<Vec<u8>> = None;

        for signature in &self.signatures {
            let protected_json = jose_decode(&signature.protected)?;
            let protected: ProtectedHeader = serde_json::from_slice(&protected_json)
                .map_err(|e| StrataError::ManifestMalformed(format!("bad protected header: {e}")))?;
            let tail = jose_decode(&protected.format_tail)?;

            match &format_tail {
                None => format_tail = Some(tail),
                Some(seen) if *seen == tail => {}
                Some(_) => {
                    return Err(StrataError::ManifestMalformed(
                        "formatTail did not match between signature blocks".into(),
                    ))
                }
            }
            match format_length {
                None => format_length = Some(protected.format_length),
                Some(seen) if seen == protected.format_length => {}
                Some(_) => {
                    return Err(StrataError::ManifestMalformed(
                        "formatLength did not match between signature blocks".into(),
                    ))
                }
            }
        }

        let actual_hex = match (format_length, format_tail) {
            (Some(length), Some(tail)) => {
                if length > raw.len() {
                    return Err(StrataError::ManifestMalformed(format!(
                        "formatLength {length} exceeds manifest body of {} bytes",
                        raw.len()
                    )));
                }
                let mut payload = raw[..length].to_vec();
                payload.extend_from_slice(&tail);
                sha256_hex(&payload)
            }
            _ => sha256_hex(raw),
        };

        if actual_hex != expected_hex {
            return Err(StrataError::digest_mismatch(
                "manifest",
                expected_hex,
                actual_hex,
            ));
        }

        Ok(())
    }

    /// Parses every history row's embedded `v1Compatibility` JSON, paired
    /// in order with its blob sum.
    pub fn layer_histories(&self) -> StrataResult<Vec<(LayerHistory, String)>> {
        self.history
            .iter()
            .zip(&self.fs_layers)
            .map(|(row, fs_layer)| {
                let history = parse_v1_compatibility(&row.v1_compatibility)?;
                Ok((history, fs_layer.blob_sum.clone()))
            })
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decodes JOSE base64url-without-padding, the alphabet `protected` headers
/// and `formatTail` are encoded with.
fn jose_decode(input: &str) -> StrataResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| StrataError::ManifestMalformed(format!("invalid base64 in signature: {e}")))
}

/// Parses one `v1Compatibility` document.
pub fn parse_v1_compatibility(raw: &str) -> StrataResult<LayerHistory> {
    let doc: V1CompatibilityDoc = serde_json::from_str(raw)
        .map_err(|e| StrataError::ManifestMalformed(format!("unknown layer format: {e}")))?;

    let id = doc
        .id
        .ok_or_else(|| StrataError::ManifestMalformed("malformed layer, missing id".into()))?;

    Ok(LayerHistory {
        id,
        parent: doc.parent,
        config: doc.config,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
