//! Loading images from Docker save archives.
//!
//! A save archive is the combined image-JSON + filesystem-changeset format
//! (schema v1.1): a tar whose root holds `manifest.json`, a per-image
//! `<image_id>.json`, and one directory per layer containing `json`,
//! `VERSION` and `layer.tar`. The layer list is already ordered base→top,
//! and the trust root is the local filesystem, so nothing is digest
//! verified here.

use std::path::{Path, PathBuf};

use getset::Getters;
use serde::Deserialize;
use tar::Archive;
use tempfile::TempDir;

use crate::{
    oci::{compositor::open_layer_reader, manifest::RuntimeConfig},
    utils::{SAVE_LAYER_CONFIG_FILENAME, SAVE_MANIFEST_FILENAME},
    StrataError, StrataResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An opened save archive: unpacked into a scratch directory that lives as
/// long as this value, with the manifest and youngest-layer config parsed.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SaveArchive {
    /// The scratch directory holding the unpacked archive. Removed on
    /// drop.
    #[getset(skip)]
    scratch: TempDir,

    /// The image id, recovered from the manifest's `Config` filename.
    image_id: String,

    /// The repository from `RepoTags[0]`.
    repo: String,

    /// The tag from `RepoTags[0]`.
    tag: String,

    /// The runtime configuration from the youngest layer's `json`.
    config: Option<RuntimeConfig>,

    /// Absolute paths of the layer tars, base→top.
    layer_tars: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SaveManifestEntry {
    #[serde(rename = "Config")]
    config: String,

    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,

    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LayerConfigDoc {
    config: Option<RuntimeConfig>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SaveArchive {
    /// Unpacks and indexes a save archive.
    ///
    /// Only the first `RepoTags` entry is honored; multi-tag archives are
    /// not modeled. An archive with no `manifest.json`, an empty manifest
    /// array, or an empty `RepoTags` list is rejected as malformed.
    pub async fn open(archive_path: impl Into<PathBuf>) -> StrataResult<Self> {
        let archive_path = archive_path.into();
        if !archive_path.exists() {
            return Err(StrataError::PathNotFound(archive_path));
        }

        tokio::task::spawn_blocking(move || Self::open_blocking(&archive_path, None)).await?
    }

    /// Like [`SaveArchive::open`], but places the scratch directory under
    /// `scratch_parent` instead of the system temp directory.
    pub async fn open_in(
        archive_path: impl Into<PathBuf>,
        scratch_parent: impl Into<PathBuf>,
    ) -> StrataResult<Self> {
        let archive_path = archive_path.into();
        let scratch_parent = scratch_parent.into();
        if !archive_path.exists() {
            return Err(StrataError::PathNotFound(archive_path));
        }

        tokio::task::spawn_blocking(move || {
            Self::open_blocking(&archive_path, Some(&scratch_parent))
        })
        .await?
    }

    fn open_blocking(archive_path: &Path, scratch_parent: Option<&Path>) -> StrataResult<Self> {
        let scratch = match scratch_parent {
            Some(parent) => TempDir::with_prefix_in("strata-save-", parent)?,
            None => TempDir::with_prefix("strata-save-")?,
        };

        tracing::debug!(
            archive = %archive_path.display(),
            scratch = %scratch.path().display(),
            "unpacking save archive"
        );
        let mut archive = Archive::new(open_layer_reader(archive_path)?);
        archive.unpack(scratch.path())?;

        let manifest_path = scratch.path().join(SAVE_MANIFEST_FILENAME);
        let manifest_raw = std::fs::read(&manifest_path).map_err(|_| {
            StrataError::ArchiveMalformed(format!("archive has no {SAVE_MANIFEST_FILENAME}"))
        })?;
        let manifest: Vec<SaveManifestEntry> = serde_json::from_slice(&manifest_raw)
            .map_err(|e| StrataError::ArchiveMalformed(format!("bad manifest.json: {e}")))?;

        let entry = manifest.first().ok_or_else(|| {
            StrataError::ArchiveMalformed("manifest.json carries no images".into())
        })?;

        let image_id = entry
            .config
            .split('.')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                StrataError::ArchiveMalformed(format!("unusable Config name: {}", entry.config))
            })?
            .to_string();

        let repo_tag = entry.repo_tags.first().ok_or_else(|| {
            StrataError::ArchiveMalformed("image carries no RepoTags".into())
        })?;
        // last colon: registry hosts may carry ports
        let (repo, tag) = repo_tag.rsplit_once(':').ok_or_else(|| {
            StrataError::ArchiveMalformed(format!("RepoTags entry has no tag: {repo_tag}"))
        })?;

        if entry.layers.is_empty() {
            return Err(StrataError::ArchiveMalformed(
                "image carries no Layers".into(),
            ));
        }

        let layer_tars: Vec<PathBuf> = entry
            .layers
            .iter()
            .map(|layer| {
                let path = scratch.path().join(layer);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(StrataError::ArchiveMalformed(format!(
                        "layer missing from archive: {layer}"
                    )))
                }
            })
            .collect::<StrataResult<_>>()?;

        // the youngest layer's `json` carries the runtime config
        let youngest_dir = entry
            .layers
            .last()
            .and_then(|layer| layer.split('/').next())
            .unwrap_or_default();
        let config_path = scratch
            .path()
            .join(youngest_dir)
            .join(SAVE_LAYER_CONFIG_FILENAME);
        let config_raw = std::fs::read(&config_path).map_err(|_| {
            StrataError::ArchiveMalformed(format!(
                "archive has no config for layer {youngest_dir}"
            ))
        })?;
        let config_doc: LayerConfigDoc = serde_json::from_slice(&config_raw)
            .map_err(|e| StrataError::ArchiveMalformed(format!("bad layer config: {e}")))?;

        Ok(Self {
            scratch,
            image_id,
            repo: repo.to_string(),
            tag: tag.to_string(),
            config: config_doc.config,
            layer_tars,
        })
    }

    /// Returns the scratch directory path the archive was unpacked into.
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
