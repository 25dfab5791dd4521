//! Layered filesystem composition.
//!
//! Layers are merged with the classic union semantics: later layers win
//! for non-directory paths, whiteout markers delete entries from the
//! layers below, and a handful of entry names are never allowed out of a
//! tar at all. Rather than extract-then-delete, the compositor first plans
//! the minimal member set each layer must contribute (pass 1), then
//! extracts exactly those members in layer order (pass 2).

use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use walkdir::WalkDir;

use crate::{StrataError, StrataResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The basename prefix marking a whiteout.
const WHITEOUT_PREFIX: &str = ".wh.";

/// The basename marking an opaque-directory whiteout.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Gzip magic bytes; layer tars from a registry are gzipped, save-archive
/// layers are plain.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a tar member means to the composition.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MemberKind {
    /// Never extracted, never considered: `/`-rooted names, `dev`
    /// entries, anything with a `..` segment.
    Forbidden,

    /// A whiteout marker. The target (when the marker names one) is the
    /// path deleted from all layers below.
    Whiteout { target: Option<String> },

    /// An ordinary member that may survive into the merged tree.
    Live { name: String, is_dir: bool },
}

/// One surviving member of a scanned layer.
#[derive(Debug, Clone)]
struct LayerMember {
    name: String,
    is_dir: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Merges the ordered layer tars (eldest first) into `target_dir`, then
/// normalizes permissions so every file is world-readable, directories are
/// world-traversable, and the owner can write (`a+rX,u+w`).
///
/// Tar scanning, extraction and the permission walk are blocking work and
/// run on the blocking pool.
pub async fn compose_layers(layer_tars: Vec<PathBuf>, target_dir: PathBuf) -> StrataResult<()> {
    tracing::info!(
        layers = layer_tars.len(),
        target = %target_dir.display(),
        "composing layers"
    );

    tokio::task::spawn_blocking(move || -> StrataResult<()> {
        let retained = plan_layers(&layer_tars)?;
        extract_layers(&layer_tars, &retained, &target_dir)?;
        normalize_permissions(&target_dir)
    })
    .await??;

    Ok(())
}

/// Pass 1: scans each layer in order and computes, per layer, the set of
/// member names that must actually be extracted.
///
/// Walking root→tip, each layer
/// - contributes its live members,
/// - deletes whiteout targets (and their subtrees) from every earlier
///   layer's set, and
/// - supersedes earlier non-directory members that share a name with its
///   own non-directory members (directories merge instead).
fn plan_layers(layer_tars: &[PathBuf]) -> StrataResult<Vec<HashSet<String>>> {
    let mut retained: Vec<Vec<LayerMember>> = Vec::with_capacity(layer_tars.len());

    for tar_path in layer_tars {
        let mut live: Vec<LayerMember> = Vec::new();
        let mut whiteout_targets: Vec<String> = Vec::new();

        let mut archive = Archive::new(open_layer_reader(tar_path)?);
        for entry in archive.entries()? {
            let entry = entry?;
            if is_pseudo_entry(entry.header().entry_type()) {
                continue;
            }
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let is_dir = entry.header().entry_type().is_dir() || raw.ends_with('/');

            match classify_member(&raw, is_dir) {
                MemberKind::Forbidden => {
                    tracing::debug!(layer = %tar_path.display(), name = %raw, "dropping forbidden member");
                }
                MemberKind::Whiteout { target } => {
                    if let Some(target) = target {
                        whiteout_targets.push(target);
                    }
                }
                MemberKind::Live { name, is_dir } => live.push(LayerMember { name, is_dir }),
            }
        }

        // whiteouts delete the target and anything under it from all
        // layers below
        if !whiteout_targets.is_empty() {
            let subtree_prefixes: Vec<String> =
                whiteout_targets.iter().map(|t| format!("{t}/")).collect();
            for ancestor in retained.iter_mut() {
                ancestor.retain(|member| {
                    !whiteout_targets.iter().any(|t| member.name == *t)
                        && !subtree_prefixes.iter().any(|p| member.name.starts_with(p))
                });
            }
        }

        // later non-directory members supersede earlier same-named ones;
        // directories merge
        let not_dirs: HashSet<&str> = live
            .iter()
            .filter(|member| !member.is_dir)
            .map(|member| member.name.as_str())
            .collect();
        if !not_dirs.is_empty() {
            for ancestor in retained.iter_mut() {
                ancestor.retain(|member| !not_dirs.contains(member.name.as_str()));
            }
        }

        retained.push(live);
    }

    Ok(retained
        .into_iter()
        .map(|members| members.into_iter().map(|m| m.name).collect())
        .collect())
}

/// Pass 2: re-reads each layer and unpacks only its surviving members.
/// Later layers extract after earlier ones, so residual directory-metadata
/// conflicts resolve in favor of the newest layer.
fn extract_layers(
    layer_tars: &[PathBuf],
    retained: &[HashSet<String>],
    target_dir: &Path,
) -> StrataResult<()> {
    std::fs::create_dir_all(target_dir)?;

    for (tar_path, names) in layer_tars.iter().zip(retained) {
        tracing::debug!(layer = %tar_path.display(), members = names.len(), "extracting layer");

        let mut archive = Archive::new(open_layer_reader(tar_path)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(true);

        for entry in archive.entries()? {
            let mut entry = entry?;
            if is_pseudo_entry(entry.header().entry_type()) {
                continue;
            }
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = normalize_member_name(&raw);
            if !names.contains(&name) {
                continue;
            }

            let is_dir = entry.header().entry_type().is_dir();
            entry.unpack_in(target_dir)?;

            // A directory unpacked with restrictive modes would block its
            // own contents from landing. Owner bits added here are a
            // subset of what the final permission pass grants, so the end
            // state is unchanged.
            if is_dir {
                let path = target_dir.join(&name);
                let mode = std::fs::metadata(&path)?.permissions().mode();
                if mode & 0o700 != 0o700 {
                    std::fs::set_permissions(
                        &path,
                        std::fs::Permissions::from_mode(mode | 0o700),
                    )?;
                }
            }
        }
    }

    Ok(())
}

/// Makes every extracted file at least readable and every directory
/// traversable by all, and everything writable by the owner. Images built
/// with restrictive modes would otherwise be unreadable to the converters
/// that consume the tree. Symlinks are left alone.
pub fn normalize_permissions(root: &Path) -> StrataResult<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_symlink() {
            continue;
        }

        let metadata = entry.metadata()?;
        let mode = metadata.permissions().mode();

        let mut new_mode = mode | 0o444 | 0o200;
        if entry.file_type().is_dir() || mode & 0o111 != 0 {
            new_mode |= 0o111;
        }

        if new_mode != mode {
            std::fs::set_permissions(
                entry.path(),
                std::fs::Permissions::from_mode(new_mode),
            )?;
        }
    }

    Ok(())
}

/// Opens a layer tar for reading, transparently ungzipping when the file
/// starts with the gzip magic.
pub(crate) fn open_layer_reader(path: &Path) -> StrataResult<Box<dyn Read>> {
    let mut file = File::open(path).map_err(|e| {
        StrataError::Io(std::io::Error::new(
            e.kind(),
            format!("unable to open layer {}: {e}", path.display()),
        ))
    })?;

    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if n == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Classifies one raw tar member name.
fn classify_member(raw: &str, is_dir: bool) -> MemberKind {
    let name = normalize_member_name(raw);

    if name.is_empty()
        || name.starts_with('/')
        || name == "dev"
        || name.starts_with("dev/")
        || name.split('/').any(|segment| segment == "..")
    {
        return MemberKind::Forbidden;
    }

    if let Some((parent, basename)) = split_basename(&name) {
        if basename == OPAQUE_WHITEOUT {
            let target = (!parent.is_empty()).then(|| parent.to_string());
            return MemberKind::Whiteout { target };
        }
        if let Some(stripped) = basename.strip_prefix(WHITEOUT_PREFIX) {
            let target = if stripped.is_empty() {
                None
            } else if parent.is_empty() {
                Some(stripped.to_string())
            } else {
                Some(format!("{parent}/{stripped}"))
            };
            return MemberKind::Whiteout { target };
        }
    }

    MemberKind::Live { name, is_dir }
}

/// Normalizes a tar member name for comparison: strips a leading `./` and
/// any trailing `/`.
fn normalize_member_name(raw: &str) -> String {
    let mut name = raw;
    while let Some(stripped) = name.strip_prefix("./") {
        name = stripped;
    }
    name.trim_end_matches('/').to_string()
}

/// Splits a normalized name into (parent, basename). The parent is empty
/// for top-level names.
fn split_basename(name: &str) -> Option<(&str, &str)> {
    if name.is_empty() {
        return None;
    }
    match name.rsplit_once('/') {
        Some((parent, basename)) => Some((parent, basename)),
        None => Some(("", name)),
    }
}

/// True for tar pseudo-entries that carry metadata for their successors
/// rather than filesystem content.
fn is_pseudo_entry(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::XHeader | EntryType::XGlobalHeader | EntryType::GNULongName | EntryType::GNULongLink
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
