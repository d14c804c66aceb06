//! Manifest and tag handlers

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde_json::json;

use super::DOCKER_CONTENT_DIGEST;
use super::route::Reference;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::Manifest;
use crate::registry::{Registry, Repository};

async fn resolve(repository: &Repository, reference: &Reference) -> RegistryResult<Digest> {
    match reference {
        Reference::Digest(digest) => Ok(digest.clone()),
        Reference::Tag(tag) => match repository.tags().get(tag).await {
            Ok(descriptor) => Ok(descriptor.digest),
            Err(RegistryError::TagUnknown(_)) => Err(RegistryError::ManifestUnknown {
                name: repository.name().to_string(),
                reference: tag.clone(),
            }),
            Err(err) => Err(err),
        },
    }
}

/// Get a manifest by tag or digest
pub(super) async fn get_manifest(
    repository: &Repository,
    reference: &Reference,
) -> RegistryResult<Response> {
    let digest = resolve(repository, reference).await?;
    let manifest = repository.manifests().get(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type().to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        manifest.payload().to_vec(),
    )
        .into_response())
}

/// Check if a manifest exists
pub(super) async fn head_manifest(
    repository: &Repository,
    reference: &Reference,
) -> RegistryResult<Response> {
    let digest = resolve(repository, reference).await?;
    let manifest = repository.manifests().get(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type().to_string()),
            (header::CONTENT_LENGTH, manifest.payload().len().to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Store a manifest
///
/// A digest reference must match the pushed bytes; a tag reference tags the
/// stored manifest.
pub(super) async fn put_manifest(
    registry: &Registry,
    repository: &Repository,
    reference: &Reference,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let manifest = Manifest::unmarshal(content_type, &body)?;

    let tag = match reference {
        Reference::Digest(expected) => {
            let actual = manifest.digest();
            if &actual != expected {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            None
        }
        Reference::Tag(tag) => Some(tag.as_str()),
    };

    let _guard = registry.write_guard().await?;
    let descriptor = repository.manifests().put(manifest, tag).await?;

    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{}/manifests/{}", repository.name(), descriptor.digest),
            ),
            (DOCKER_CONTENT_DIGEST, descriptor.digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a manifest. Only digest references can be deleted.
pub(super) async fn delete_manifest(
    registry: &Registry,
    repository: &Repository,
    reference: &Reference,
) -> RegistryResult<Response> {
    let Reference::Digest(digest) = reference else {
        return Err(RegistryError::Unsupported("delete by tag"));
    };

    let _guard = registry.write_guard().await?;
    repository.manifests().delete(digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// List the repository's tags
pub(super) async fn list_tags(repository: &Repository) -> RegistryResult<Response> {
    let tags = repository.tags().all().await?;
    Ok(Json(json!({
        "name": repository.name().to_string(),
        "tags": tags,
    }))
    .into_response())
}
