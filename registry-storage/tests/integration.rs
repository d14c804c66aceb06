//! Integration tests for the registry HTTP surface

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use registry_storage::manifest::{MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_SCHEMA2};
use registry_storage::{RegistryBuilder, RegistryConfig};
use serde_json::json;
use sha2::{Digest, Sha256};
use storage::{MemoryStorage, Storage, TempDriver};
use tower::ServiceExt;

fn app_with(storage: Storage, config: RegistryConfig) -> axum::Router {
    let registry = RegistryBuilder::new()
        .storage(storage)
        .bucket("test-registry")
        .config(config)
        .build()
        .unwrap();
    registry_storage::api::router(registry)
}

/// Helper to create a test registry
fn test_registry() -> axum::Router {
    app_with(
        MemoryStorage::with_buckets(&["test-registry"]).into(),
        RegistryConfig::default(),
    )
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: impl Into<Body>) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Push a blob in one request and return its digest.
async fn push_blob(app: &axum::Router, name: &str, data: &[u8]) -> String {
    let digest = sha256(data);
    let response = send(
        app,
        "POST",
        &format!("/v2/{name}/blobs/uploads/?digest={digest}"),
        data.to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

/// Push a schema 2 manifest and return its digest.
async fn push_manifest(
    app: &axum::Router,
    name: &str,
    reference: Option<&str>,
    config: (&str, usize),
    layers: &[(&str, usize)],
) -> String {
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_SCHEMA2,
        "config": {
            "mediaType": MEDIA_TYPE_IMAGE_CONFIG,
            "size": config.1,
            "digest": config.0,
        },
        "layers": layers.iter().map(|(digest, size)| json!({
            "mediaType": MEDIA_TYPE_LAYER,
            "size": size,
            "digest": digest,
        })).collect::<Vec<_>>(),
    });
    let payload = serde_json::to_vec(&manifest).unwrap();
    let digest = sha256(&payload);
    let reference = reference.unwrap_or(&digest);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{name}/manifests/{reference}"))
                .header(header::CONTENT_TYPE, MEDIA_TYPE_SCHEMA2)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        digest.as_str()
    );
    digest
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let response = send(&app, "GET", "/v2/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "{}");
}

#[tokio::test]
async fn test_blob_upload_and_download() {
    let app = test_registry();

    let data = b"Hello, OCI Registry!";
    let digest = sha256(data);

    // Start blob upload
    let response = send(&app, "POST", "/v2/test-repo/blobs/uploads/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers().get(header::RANGE).unwrap(), "0-0");
    let upload_url = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    // Send the first chunk
    let response = send(&app, "PATCH", &upload_url, &data[..5]).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers().get(header::RANGE).unwrap(), "0-4");

    // Complete blob upload with the rest
    let response = send(
        &app,
        "PUT",
        &format!("{upload_url}?digest={digest}"),
        &data[5..],
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        format!("/v2/test-repo/blobs/{digest}").as_str()
    );

    // The session is gone
    let response = send(&app, "GET", &upload_url, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Download blob
    let response = send(&app, "GET", &format!("/v2/test-repo/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), data);

    // Check size with HEAD
    let response = send(&app, "HEAD", &format!("/v2/test-repo/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        data.len().to_string().as_str()
    );
}

#[tokio::test]
async fn test_blob_not_linked_into_other_repository() {
    let app = test_registry();
    let digest = push_blob(&app, "first", b"private layer").await;

    let response = send(&app, "GET", &format!("/v2/second/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_bytes(response).await;
    let errors: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(errors["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_digest_mismatch_rejected() {
    let app = test_registry();
    let wrong = sha256(b"something else");

    let response = send(
        &app,
        "POST",
        &format!("/v2/test-repo/blobs/uploads/?digest={wrong}"),
        b"payload".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, "HEAD", &format!("/v2/test-repo/blobs/{wrong}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_put_get_and_tags() {
    let app = test_registry();
    let name = "library/app";

    let config = b"{\"architecture\":\"amd64\"}";
    let layer = b"layer bytes";
    let config_digest = push_blob(&app, name, config).await;
    let layer_digest = push_blob(&app, name, layer).await;

    let digest = push_manifest(
        &app,
        name,
        Some("v1"),
        (&config_digest, config.len()),
        &[(&layer_digest, layer.len())],
    )
    .await;

    // By tag
    let response = send(&app, "GET", &format!("/v2/{name}/manifests/v1"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        MEDIA_TYPE_SCHEMA2
    );
    assert_eq!(sha256(&body_bytes(response).await), digest);

    // By digest
    let response = send(&app, "HEAD", &format!("/v2/{name}/manifests/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown tag
    let response = send(&app, "GET", &format!("/v2/{name}/manifests/v2"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, "GET", &format!("/v2/{name}/tags/list"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let tags: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(tags, json!({"name": name, "tags": ["v1"]}));
}

#[tokio::test]
async fn test_manifest_with_missing_layer_rejected() {
    let app = test_registry();
    let config = b"{}";
    let config_digest = push_blob(&app, "app", config).await;

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_SCHEMA2,
        "config": {"mediaType": MEDIA_TYPE_IMAGE_CONFIG, "size": 2, "digest": config_digest},
        "layers": [{"mediaType": MEDIA_TYPE_LAYER, "size": 4, "digest": sha256(b"gone")}],
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v2/app/manifests/latest")
                .header(header::CONTENT_TYPE, MEDIA_TYPE_SCHEMA2)
                .body(Body::from(serde_json::to_vec(&manifest).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let errors: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(errors["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");

    let response = send(&app, "GET", "/v2/app/tags/list", Body::empty()).await;
    let tags: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(tags["tags"], json!([]));
}

#[tokio::test]
async fn test_delete_requires_configuration() {
    let app = test_registry();
    let digest = push_blob(&app, "app", b"keep me").await;

    let response = send(&app, "DELETE", &format!("/v2/app/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let app = app_with(
        MemoryStorage::with_buckets(&["test-registry"]).into(),
        RegistryConfig::builder().delete_enabled(true).build().unwrap(),
    );
    let digest = push_blob(&app, "app", b"delete me").await;
    let response = send(&app, "DELETE", &format!("/v2/app/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(&app, "HEAD", &format!("/v2/app/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_housekeeping_collects_unreachable_content() {
    let app = test_registry();
    let name = "library/app";

    let config = b"{}";
    let a = b"layer a";
    let b = b"layer b";
    let config_digest = push_blob(&app, name, config).await;
    let a_digest = push_blob(&app, name, a).await;
    let b_digest = push_blob(&app, name, b).await;

    let tagged = push_manifest(
        &app,
        name,
        Some("latest"),
        (&config_digest, config.len()),
        &[(&a_digest, a.len())],
    )
    .await;
    let untagged = push_manifest(
        &app,
        name,
        None,
        (&config_digest, config.len()),
        &[(&b_digest, b.len())],
    )
    .await;

    let response = send(&app, "DELETE", "/v2/_housekeeping", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());

    for (digest, status) in [
        (&config_digest, StatusCode::OK),
        (&a_digest, StatusCode::OK),
        (&b_digest, StatusCode::NOT_FOUND),
    ] {
        let response = send(&app, "HEAD", &format!("/v2/{name}/blobs/{digest}"), Body::empty()).await;
        assert_eq!(response.status(), status, "blob {digest}");
    }

    let response = send(&app, "GET", &format!("/v2/{name}/manifests/latest"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sha256(&body_bytes(response).await), tagged);

    let response = send(&app, "GET", &format!("/v2/{name}/manifests/{untagged}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_repository_housekeeping() {
    let app = test_registry();
    let orphan = push_blob(&app, "org/app", b"orphan").await;

    let response = send(&app, "GET", "/v2/org/app/_housekeeping", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = send(&app, "DELETE", "/v2/org/app/_housekeeping", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, "HEAD", &format!("/v2/org/app/blobs/{orphan}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_read_only_mode() {
    let storage: Storage = MemoryStorage::with_buckets(&["test-registry"]).into();

    let writable = app_with(storage.clone(), RegistryConfig::default());
    let digest = push_blob(&writable, "app", b"existing").await;

    let app = app_with(
        storage,
        RegistryConfig::builder().read_only(true).build().unwrap(),
    );

    let response = send(&app, "DELETE", "/v2/_housekeeping", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = send(&app, "POST", "/v2/app/blobs/uploads/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = send(&app, "GET", &format!("/v2/app/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), b"existing");
}

#[tokio::test]
async fn test_filesystem_backed_registry() {
    let storage: Storage = TempDriver::new().unwrap().into();
    let app = app_with(
        storage,
        RegistryConfig::builder()
            .repository_blob_store(true)
            .build()
            .unwrap(),
    );

    let config = b"{}";
    let layer = b"on disk";
    let config_digest = push_blob(&app, "disk/app", config).await;
    let layer_digest = push_blob(&app, "disk/app", layer).await;
    let orphan = push_blob(&app, "disk/app", b"orphan").await;
    push_manifest(
        &app,
        "disk/app",
        Some("stable"),
        (&config_digest, config.len()),
        &[(&layer_digest, layer.len())],
    )
    .await;

    let response = send(&app, "DELETE", "/v2/_housekeeping", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, "GET", &format!("/v2/disk/app/blobs/{layer_digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), layer);

    let response = send(&app, "HEAD", &format!("/v2/disk/app/blobs/{orphan}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_paths() {
    let app = test_registry();

    let response = send(&app, "GET", "/v2/app/unknown/thing", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, "GET", "/v2/App/tags/list", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
