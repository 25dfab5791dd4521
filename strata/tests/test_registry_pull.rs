//! Registry pulls against a mock Docker Registry v2: token negotiation,
//! manifest verification, blob downloads, redirects, caching.

use std::{io::Write, sync::Mutex};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use flate2::{write::GzEncoder, Compression};
use strata::{
    oci::{
        coordinate::{ImageCoordinate, RegistryOptions},
        pull_image, Phase, StatusUpdater,
    },
    utils::{sha256_hex, EMPTY_TAR_BLOB_SUM},
    StrataError,
};
use tempfile::tempdir;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

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
    fn messages(&self) -> Vec<(Phase, String)> {
        self.events.lock().unwrap().clone()
    }
}

/// Builds a gzipped layer tar from (name, content) pairs and returns
/// `(bytes, blob_sum)`.
fn gz_layer(members: &[(&str, &[u8])]) -> (Vec<u8>, String) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in members {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *content).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    let gz_bytes = encoder.finish().unwrap();

    let blob_sum = format!("sha256:{}", sha256_hex(&gz_bytes));
    (gz_bytes, blob_sum)
}

/// Builds a signed schema-1 manifest body and returns `(body, digest)`
/// where `digest` is what the registry would declare in
/// `Docker-Content-Digest`.
fn signed_manifest(fs_layers: &[&str], v1_compats: &[serde_json::Value]) -> (Vec<u8>, String) {
    let fs_json: Vec<String> = fs_layers
        .iter()
        .map(|blob_sum| format!(r#"{{"blobSum":"{blob_sum}"}}"#))
        .collect();
    let history_json: Vec<String> = v1_compats
        .iter()
        .map(|compat| serde_json::json!({ "v1Compatibility": compat.to_string() }).to_string())
        .collect();

    let core = format!(
        r#"{{"schemaVersion":1,"fsLayers":[{}],"history":[{}]"#,
        fs_json.join(","),
        history_json.join(",")
    );
    let tail = "}";

    let protected = serde_json::json!({
        "formatLength": core.len(),
        "formatTail": URL_SAFE_NO_PAD.encode(tail),
    });
    let body = format!(
        "{core},\"signatures\":[{{\"protected\":\"{}\"}}]}}",
        URL_SAFE_NO_PAD.encode(protected.to_string())
    );
    let digest = format!("sha256:{}", sha256_hex(format!("{core}{tail}").as_bytes()));

    (body.into_bytes(), digest)
}

fn bearer_challenge(realm_base: &str) -> String {
    format!(
        r#"Bearer realm="{realm_base}/token",service="registry.mock",scope="repository:testrepo:pull""#
    )
}

fn coordinate_for(server: &MockServer) -> ImageCoordinate {
    ImageCoordinate::parse(
        "testrepo:v1",
        RegistryOptions {
            base_url: Some(server.uri()),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Mounts the token endpoint plus the 401-then-200 manifest pair.
async fn mount_authenticated_manifest(
    server: &MockServer,
    body: &[u8],
    digest: &str,
    manifest_hits: u64,
    token_hits: u64,
) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok"})))
        .expect(token_hits)
        .named("token exchange")
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body.to_vec(), "application/json")
                .insert_header("Docker-Content-Digest", digest),
        )
        .with_priority(1)
        .expect(manifest_hits)
        .named("manifest with token")
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("WWW-Authenticate", bearer_challenge(&server.uri()).as_str()),
        )
        .with_priority(5)
        .expect(manifest_hits)
        .named("manifest challenge")
        .mount(server)
        .await;
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_pull_negotiates_token_composes_and_reuses_cache() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let (base_layer, base_sum) = gz_layer(&[("etc/a", b"alpha"), ("etc/b", b"beta")]);
    let (top_layer, top_sum) = gz_layer(&[("etc/.wh.a", b""), ("etc/c", b"gamma")]);

    // tip-first, with an empty-tar layer in the middle that must never be
    // requested
    let (manifest_body, manifest_digest) = signed_manifest(
        &[&top_sum, EMPTY_TAR_BLOB_SUM, &base_sum],
        &[
            serde_json::json!({
                "id": "younglayer",
                "parent": "midlayer",
                "config": {"Env": ["A=1"], "Entrypoint": ["/bin/sh"], "WorkingDir": "/app"},
            }),
            serde_json::json!({"id": "midlayer", "parent": "oldlayer"}),
            serde_json::json!({"id": "oldlayer"}),
        ],
    );

    // both pulls build a fresh client, so both negotiate
    mount_authenticated_manifest(&server, &manifest_body, &manifest_digest, 2, 2).await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{base_sum}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(base_layer.clone()))
        .expect(1)
        .named("base blob")
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{top_sum}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(top_layer.clone()))
        .expect(1)
        .named("top blob")
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{EMPTY_TAR_BLOB_SUM}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .named("empty-tar blob must be skipped")
        .mount(&server)
        .await;

    let temp_dir = tempdir()?;
    let cache_dir = temp_dir.path().join("cache");
    let expand_dir = temp_dir.path().join("expand");
    let updater = CollectingUpdater::default();

    let metadata = pull_image(
        coordinate_for(&server),
        &cache_dir,
        &expand_dir,
        &updater,
    )
    .await?;

    assert_eq!(metadata.get_id(), "younglayer");
    assert_eq!(metadata.get_repo(), "testrepo");
    assert_eq!(metadata.get_tag(), "v1");
    assert_eq!(metadata.get_env().as_deref(), Some(&["A=1".to_string()][..]));
    assert_eq!(
        metadata.get_entrypoint().as_deref(),
        Some(&["/bin/sh".to_string()][..])
    );
    assert_eq!(metadata.get_workdir().as_deref(), Some("/app"));

    let rootfs = expand_dir.join("younglayer");
    assert!(!rootfs.join("etc/a").exists(), "whited out by top layer");
    assert_eq!(std::fs::read(rootfs.join("etc/b"))?, b"beta");
    assert_eq!(std::fs::read(rootfs.join("etc/c"))?, b"gamma");

    // validated blobs live in the cache under their digest
    assert!(cache_dir.join(format!("{base_sum}.tar")).exists());
    assert!(cache_dir.join(format!("{top_sum}.tar")).exists());

    let messages = updater.messages();
    assert_eq!(
        messages[0],
        (Phase::Pulling, "Getting manifest".to_string())
    );
    let pulling_layers: Vec<_> = messages
        .iter()
        .filter(|(_, m)| m.starts_with("Pulling layer"))
        .collect();
    assert_eq!(pulling_layers.len(), 2, "excluded layer emits no event");
    assert!(messages.contains(&(Phase::Pulling, "Extracting layers".to_string())));

    // a second pull with a warm cache downloads no blobs (the blob mocks
    // expect exactly one hit each) and produces the same tree
    let metadata2 = pull_image(
        coordinate_for(&server),
        &cache_dir,
        &expand_dir,
        &CollectingUpdater::default(),
    )
    .await?;
    assert_eq!(metadata2.get_id(), "younglayer");
    assert!(!rootfs.join("etc/a").exists());
    assert!(rootfs.join("etc/c").exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_second_401_after_token_exchange_is_fatal() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok"})))
        .expect(1)
        .named("token exchange")
        .mount(&server)
        .await;

    // the registry keeps answering 401 even with the fresh token
    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("WWW-Authenticate", bearer_challenge(&server.uri()).as_str()),
        )
        .expect(2)
        .named("manifest always 401")
        .mount(&server)
        .await;

    let temp_dir = tempdir()?;
    let updater = CollectingUpdater::default();
    let result = pull_image(
        coordinate_for(&server),
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &updater,
    )
    .await;

    assert!(matches!(result, Err(StrataError::AuthFailed(_))));
    assert!(updater
        .messages()
        .iter()
        .any(|(phase, _)| *phase == Phase::Failure));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_blob_redirect_drops_authorization() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let cdn = MockServer::start().await;

    let (layer, blob_sum) = gz_layer(&[("hello.txt", b"hello")]);
    let (manifest_body, manifest_digest) = signed_manifest(
        &[&blob_sum],
        &[serde_json::json!({"id": "solo", "config": {"Env": ["X=1"]}})],
    );

    mount_authenticated_manifest(&server, &manifest_body, &manifest_digest, 1, 1).await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{blob_sum}")))
        .respond_with(
            ResponseTemplate::new(307)
                .insert_header("Location", format!("{}/cdn/blob", cdn.uri()).as_str()),
        )
        .expect(1)
        .named("registry redirects blob")
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cdn/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.clone()))
        .expect(1)
        .named("cdn serves blob")
        .mount(&cdn)
        .await;

    let temp_dir = tempdir()?;
    let cache_dir = temp_dir.path().join("cache");
    let metadata = pull_image(
        coordinate_for(&server),
        &cache_dir,
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await?;

    assert_eq!(metadata.get_id(), "solo");
    assert!(cache_dir.join(format!("{blob_sum}.tar")).exists());

    // the token went to the registry…
    let registry_requests = server.received_requests().await.unwrap();
    let blob_request = registry_requests
        .iter()
        .find(|r| r.url.path().contains("/blobs/"))
        .unwrap();
    assert!(blob_request.headers.contains_key("authorization"));

    // …but never crossed origin to the blob store
    let cdn_requests = cdn.received_requests().await.unwrap();
    assert_eq!(cdn_requests.len(), 1);
    assert!(!cdn_requests[0].headers.contains_key("authorization"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_manifest_digest_mismatch_aborts_before_blobs() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let (layer, blob_sum) = gz_layer(&[("a.txt", b"a")]);
    let (manifest_body, manifest_digest) =
        signed_manifest(&[&blob_sum], &[serde_json::json!({"id": "solo"})]);

    // tamper with a byte inside the signed subrange, keep the declared
    // digest
    let tampered = String::from_utf8(manifest_body)?.replacen("solo", "sol0", 1);

    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(tampered.into_bytes(), "application/json")
                .insert_header("Docker-Content-Digest", manifest_digest.as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{blob_sum}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(layer))
        .expect(0)
        .named("no blob may be fetched")
        .mount(&server)
        .await;

    let temp_dir = tempdir()?;
    let result = pull_image(
        coordinate_for(&server),
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await;

    assert!(matches!(result, Err(StrataError::DigestMismatch { .. })));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_blob_digest_mismatch_retries_once_then_fails() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let (_, blob_sum) = gz_layer(&[("a.txt", b"a")]);
    let (manifest_body, manifest_digest) =
        signed_manifest(&[&blob_sum], &[serde_json::json!({"id": "solo"})]);

    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(manifest_body, "application/json")
                .insert_header("Docker-Content-Digest", manifest_digest.as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    // the served bytes never hash to the declared digest
    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{blob_sum}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"garbage".to_vec()))
        .expect(2)
        .named("blob served twice, both invalid")
        .mount(&server)
        .await;

    let temp_dir = tempdir()?;
    let cache_dir = temp_dir.path().join("cache");
    let result = pull_image(
        coordinate_for(&server),
        &cache_dir,
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await;

    assert!(matches!(result, Err(StrataError::BlobUnrecoverable(_))));
    // nothing invalid was published into the cache
    assert!(!cache_dir.join(format!("{blob_sum}.tar")).exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_corrupted_cache_entry_is_refetched() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let (layer, blob_sum) = gz_layer(&[("a.txt", b"a")]);
    let (manifest_body, manifest_digest) =
        signed_manifest(&[&blob_sum], &[serde_json::json!({"id": "solo"})]);

    Mock::given(method("GET"))
        .and(path("/v2/testrepo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(manifest_body, "application/json")
                .insert_header("Docker-Content-Digest", manifest_digest.as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/testrepo/blobs/{blob_sum}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.clone()))
        .expect(1)
        .named("refetch after cache corruption")
        .mount(&server)
        .await;

    let temp_dir = tempdir()?;
    let cache_dir = temp_dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir)?;
    std::fs::write(cache_dir.join(format!("{blob_sum}.tar")), b"corrupted")?;

    pull_image(
        coordinate_for(&server),
        &cache_dir,
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await?;

    let cached = std::fs::read(cache_dir.join(format!("{blob_sum}.tar")))?;
    assert_eq!(cached, layer);
    Ok(())
}

#[test_log::test(tokio::test)]
#[ignore = "requires Docker Hub access"]
async fn test_pull_from_docker_hub() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let coordinate = ImageCoordinate::parse("alpine:latest", RegistryOptions::default())?;

    let metadata = pull_image(
        coordinate,
        temp_dir.path().join("cache"),
        temp_dir.path().join("expand"),
        &CollectingUpdater::default(),
    )
    .await?;

    assert!(!metadata.get_id().is_empty());
    assert!(metadata.get_expanded_path().join("etc").exists());
    Ok(())
}
