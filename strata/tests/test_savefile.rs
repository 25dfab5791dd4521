//! Save-archive loading: the combined image-JSON + filesystem-changeset
//! format, end to end through the compositor.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
};

use strata::{
    oci::{load_image, Phase, StatusUpdater},
    StrataError,
};
use tar::Builder;
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

/// Records every status update for later assertions.
#[derive(Default)]
struct CollectingUpdater {
    events: Mutex<Vec<(Phase, String)>>,
}

impl StatusUpdater for CollectingUpdater {
    fn update_status(&self, phase: Phase, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((phase, message.to_string()));
    }
}

impl CollectingUpdater {
    fn phases(&self) -> Vec<Phase> {
        self.events.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

fn layer_tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (name, content) in members {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Builds a two-layer save archive:
/// L1 carries `file1.txt` + `file2.txt`, L2 whites out `file1.txt` and adds
/// `file3.txt`, and L2's `json` carries the runtime config.
fn build_save_archive(dir: &Path, repo_tag: &str) -> PathBuf {
    let staging = dir.join("staging");
    std::fs::create_dir_all(staging.join("L1")).unwrap();
    std::fs::create_dir_all(staging.join("L2")).unwrap();

    std::fs::write(
        staging.join("manifest.json"),
        format!(
            r#"[{{"Config":"abc.json","RepoTags":["{repo_tag}"],"Layers":["L1/layer.tar","L2/layer.tar"]}}]"#
        ),
    )
    .unwrap();
    std::fs::write(staging.join("abc.json"), "{}").unwrap();

    std::fs::write(
        staging.join("L1/layer.tar"),
        layer_tar_bytes(&[("file1.txt", b"one"), ("file2.txt", b"two")]),
    )
    .unwrap();
    std::fs::write(staging.join("L1/json"), r#"{"id":"L1"}"#).unwrap();
    std::fs::write(staging.join("L1/VERSION"), "1.0").unwrap();

    std::fs::write(
        staging.join("L2/layer.tar"),
        layer_tar_bytes(&[(".wh.file1.txt", b""), ("file3.txt", b"three")]),
    )
    .unwrap();
    std::fs::write(
        staging.join("L2/json"),
        r#"{"id":"L2","parent":"L1","config":{"Env":["PATH=/usr/bin:/bin","HOME=/root"],"Entrypoint":["/bin/app"],"WorkingDir":"/srv"}}"#,
    )
    .unwrap();
    std::fs::write(staging.join("L2/VERSION"), "1.0").unwrap();

    let archive_path = dir.join("image.save.tar");
    let mut builder = Builder::new(File::create(&archive_path).unwrap());
    builder.append_dir_all(".", &staging).unwrap();
    builder.finish().unwrap();

    archive_path
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_load_composes_layers_and_returns_metadata() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let archive = build_save_archive(temp_dir.path(), "repo:v1");
    let cache_dir = temp_dir.path().join("cache");
    let expand_dir = temp_dir.path().join("expand");
    let updater = CollectingUpdater::default();

    let metadata = load_image(&archive, &cache_dir, &expand_dir, &updater).await?;

    assert_eq!(metadata.get_id(), "abc");
    assert_eq!(metadata.get_repo(), "repo");
    assert_eq!(metadata.get_tag(), "v1");
    assert_eq!(
        metadata.get_env().as_deref(),
        Some(&["PATH=/usr/bin:/bin".to_string(), "HOME=/root".to_string()][..])
    );
    assert_eq!(
        metadata.get_entrypoint().as_deref(),
        Some(&["/bin/app".to_string()][..])
    );
    assert_eq!(metadata.get_workdir().as_deref(), Some("/srv"));

    let rootfs = expand_dir.join("abc");
    assert_eq!(metadata.get_expanded_path(), &rootfs);
    assert!(!rootfs.join("file1.txt").exists(), "whited out by L2");
    assert!(rootfs.join("file2.txt").exists());
    assert!(rootfs.join("file3.txt").exists());

    let phases = updater.phases();
    assert!(phases.contains(&Phase::Loading));
    assert!(!phases.contains(&Phase::Failure));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_load_honors_registry_port_in_repo_tag() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let archive = build_save_archive(temp_dir.path(), "localhost:5000/team/app:v2");

    let metadata = load_image(
        &archive,
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await?;

    assert_eq!(metadata.get_repo(), "localhost:5000/team/app");
    assert_eq!(metadata.get_tag(), "v2");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_load_rejects_archive_without_manifest() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let staging = temp_dir.path().join("staging");
    std::fs::create_dir_all(&staging)?;
    std::fs::write(staging.join("stray.txt"), "not an image")?;

    let archive_path = temp_dir.path().join("bad.save.tar");
    let mut builder = Builder::new(File::create(&archive_path)?);
    builder.append_dir_all(".", &staging)?;
    builder.finish()?;

    let updater = CollectingUpdater::default();
    let result = load_image(
        &archive_path,
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &updater,
    )
    .await;

    assert!(matches!(result, Err(StrataError::ArchiveMalformed(_))));
    assert!(updater.phases().contains(&Phase::Failure));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_load_rejects_empty_repo_tags() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let staging = temp_dir.path().join("staging");
    std::fs::create_dir_all(staging.join("L1"))?;
    std::fs::write(
        staging.join("manifest.json"),
        r#"[{"Config":"abc.json","RepoTags":[],"Layers":["L1/layer.tar"]}]"#,
    )?;
    std::fs::write(
        staging.join("L1/layer.tar"),
        layer_tar_bytes(&[("a.txt", b"a")]),
    )?;
    std::fs::write(staging.join("L1/json"), r#"{"id":"L1"}"#)?;

    let archive_path = temp_dir.path().join("untagged.save.tar");
    let mut builder = Builder::new(File::create(&archive_path)?);
    builder.append_dir_all(".", &staging)?;
    builder.finish()?;

    let result = load_image(
        &archive_path,
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await;

    assert!(matches!(result, Err(StrataError::ArchiveMalformed(_))));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_load_rejects_missing_archive_file() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let result = load_image(
        temp_dir.path().join("nope.save.tar"),
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await;

    assert!(matches!(result, Err(StrataError::PathNotFound(_))));
    Ok(())
}
