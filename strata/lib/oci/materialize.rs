//! The materializer façade: one entry point per mode.
//!
//! `pull_image` drives registry → chain → blobs → composition;
//! `load_image` drives save archive → composition. Both report progress at
//! phase boundaries, emit `FAILURE` before propagating any error, and
//! return the metadata record a launcher needs.

use std::path::PathBuf;

use futures::future;
use getset::Getters;

use crate::{
    oci::{
        chain::LayerChain,
        compositor::compose_layers,
        coordinate::ImageCoordinate,
        distribution::RegistryClient,
        manifest::RuntimeConfig,
        progress::{Phase, StatusUpdater},
        savefile::SaveArchive,
    },
    utils::blob_cache_path,
    StrataResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a launcher needs to start a container from a materialized image.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageMetadata {
    /// The image id.
    id: String,

    /// The repository the image came from.
    repo: String,

    /// The tag the image came from.
    tag: String,

    /// Environment assignments, each `KEY=VALUE`, in image order.
    env: Option<Vec<String>>,

    /// The entrypoint argv.
    entrypoint: Option<Vec<String>>,

    /// The working directory.
    workdir: Option<String>,

    /// The directory holding the merged root filesystem.
    expanded_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Materializes an image from a registry.
///
/// Fetches and verifies the manifest, resolves the layer chain, downloads
/// every non-excluded layer blob into `cache_dir` (concurrently; the cache
/// filename is the coordination point), and composes the layers into
/// `<expand_dir>/<image_id>`.
///
/// Rerunning against an intact cache performs no network blob writes and
/// redoes only the extraction work.
pub async fn pull_image(
    coordinate: ImageCoordinate,
    cache_dir: impl Into<PathBuf>,
    expand_dir: impl Into<PathBuf>,
    updater: &dyn StatusUpdater,
) -> StrataResult<ImageMetadata> {
    let cache_dir = cache_dir.into();
    let expand_dir = expand_dir.into();

    match pull_image_inner(coordinate, cache_dir, expand_dir, updater).await {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            updater.update_status(Phase::Failure, &e.to_string());
            Err(e)
        }
    }
}

/// Materializes an image from a local Docker save archive.
///
/// The archive is unpacked into a scratch directory under `cache_dir`,
/// `manifest.json` is read, and the already-ordered layer tars are
/// composed into `<expand_dir>/<image_id>`. No digests are verified; the
/// trust root is the local filesystem.
pub async fn load_image(
    archive_path: impl Into<PathBuf>,
    cache_dir: impl Into<PathBuf>,
    expand_dir: impl Into<PathBuf>,
    updater: &dyn StatusUpdater,
) -> StrataResult<ImageMetadata> {
    let archive_path = archive_path.into();
    let cache_dir = cache_dir.into();
    let expand_dir = expand_dir.into();

    match load_image_inner(archive_path, cache_dir, expand_dir, updater).await {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            updater.update_status(Phase::Failure, &e.to_string());
            Err(e)
        }
    }
}

async fn pull_image_inner(
    coordinate: ImageCoordinate,
    cache_dir: PathBuf,
    expand_dir: PathBuf,
    updater: &dyn StatusUpdater,
) -> StrataResult<ImageMetadata> {
    let client = RegistryClient::new(coordinate)?;
    let coordinate = client.coordinate();

    updater.update_status(Phase::Pulling, "Getting manifest");
    let manifest = client.fetch_manifest().await?;

    updater.update_status(Phase::Pulling, "Constructing manifest");
    let chain = LayerChain::resolve(manifest.layer_histories()?)?;

    tokio::fs::create_dir_all(&cache_dir).await?;

    let mut downloads = Vec::new();
    for layer in chain.iter() {
        let blob_sum = layer.get_blob_sum();
        if coordinate.is_excluded(blob_sum) {
            continue;
        }
        updater.update_status(Phase::Pulling, &format!("Pulling layer {blob_sum}"));
        downloads.push(client.download_layer(blob_sum, &cache_dir));
    }
    for result in future::join_all(downloads).await {
        result?;
    }

    updater.update_status(Phase::Pulling, "Extracting layers");
    let youngest = chain.youngest_layer();
    let expanded_path = expand_dir.join(youngest.get_id());
    tokio::fs::create_dir_all(&expanded_path).await?;

    let layer_tars: Vec<PathBuf> = chain
        .iter()
        .filter(|layer| !coordinate.is_excluded(layer.get_blob_sum()))
        .map(|layer| blob_cache_path(&cache_dir, layer.get_blob_sum()))
        .collect();
    compose_layers(layer_tars, expanded_path.clone()).await?;

    Ok(metadata_from_parts(
        youngest.get_id().clone(),
        coordinate.get_repository().clone(),
        coordinate.get_tag().clone(),
        youngest.get_config().clone(),
        expanded_path,
    ))
}

async fn load_image_inner(
    archive_path: PathBuf,
    cache_dir: PathBuf,
    expand_dir: PathBuf,
    updater: &dyn StatusUpdater,
) -> StrataResult<ImageMetadata> {
    tokio::fs::create_dir_all(&cache_dir).await?;
    let archive = SaveArchive::open_in(archive_path, &cache_dir).await?;

    updater.update_status(Phase::Loading, "Extracting layers");
    let expanded_path = expand_dir.join(archive.get_image_id());
    tokio::fs::create_dir_all(&expanded_path).await?;

    compose_layers(archive.get_layer_tars().clone(), expanded_path.clone()).await?;

    Ok(metadata_from_parts(
        archive.get_image_id().clone(),
        archive.get_repo().clone(),
        archive.get_tag().clone(),
        archive.get_config().clone(),
        expanded_path,
    ))
}

fn metadata_from_parts(
    id: String,
    repo: String,
    tag: String,
    config: Option<RuntimeConfig>,
    expanded_path: PathBuf,
) -> ImageMetadata {
    let config = config.unwrap_or_default();
    ImageMetadata {
        id,
        repo,
        tag,
        env: config.env,
        entrypoint: config.entrypoint,
        workdir: config.workdir,
        expanded_path,
    }
}
