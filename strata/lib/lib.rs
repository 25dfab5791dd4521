//! `strata` materializes OCI/Docker images into on-disk root filesystem
//! trees.
//!
//! # Overview
//!
//! Given a registry coordinate (host + repository + tag) or a local Docker
//! save archive, strata produces a merged root filesystem that faithfully
//! reflects the image's layered filesystem, plus the metadata record a
//! launcher needs (id, environment, entrypoint, working directory).
//!
//! The work splits into three parts:
//!
//! - **Distribution**: a Docker Registry v2 client that negotiates
//!   bearer-token authentication, verifies manifests against their
//!   canonical digest, follows blob redirects without leaking credentials,
//!   and maintains a digest-addressed blob cache published via atomic
//!   rename.
//! - **Composition**: a layered filesystem compositor that honors whiteout
//!   markers, filters forbidden entries, and extracts from each layer only
//!   the members that survive into the merged tree.
//! - **Loading**: a save-archive loader that feeds the same compositor
//!   from a locally unpacked archive.
//!
//! Downstream stages (format conversion, transfer, job orchestration) are
//! external collaborators; they observe progress through the
//! [`oci::StatusUpdater`] callback and consume the returned
//! [`oci::ImageMetadata`].
//!
//! # Usage Example
//!
//! ```no_run
//! use strata::oci::{
//!     coordinate::{ImageCoordinate, RegistryOptions},
//!     pull_image, NullUpdater,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinate = ImageCoordinate::parse("ubuntu:14.04", RegistryOptions::default())?;
//!     let metadata = pull_image(coordinate, "/var/cache/strata", "/srv/images", &NullUpdater).await?;
//!     println!("rootfs at {}", metadata.get_expanded_path().display());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`oci`] - Image pulling, loading and layer composition
//! - [`utils`] - Digests, hashing and filesystem layout helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod oci;
pub mod utils;

pub use error::*;
