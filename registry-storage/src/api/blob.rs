//! Blob and upload handlers

use std::collections::HashMap;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use crate::descriptor::MEDIA_TYPE_OCTET_STREAM;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Registry, Repository};
use crate::upload::BlobUpload;

/// Get a blob, or redirect to the backend when redirects are enabled.
pub(super) async fn get_blob(repository: &Repository, digest: &Digest) -> RegistryResult<Response> {
    if let Some(url) = repository.blobs().redirect(digest).await? {
        return Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [
                (header::LOCATION, url.to_string()),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
        )
            .into_response());
    }

    let data = repository.blobs().get(digest).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
pub(super) async fn head_blob(repository: &Repository, digest: &Digest) -> RegistryResult<Response> {
    let descriptor = repository.blobs().stat(digest).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM.to_string()),
            (header::CONTENT_LENGTH, descriptor.size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
pub(super) async fn delete_blob(
    registry: &Registry,
    repository: &Repository,
    digest: &Digest,
) -> RegistryResult<Response> {
    let _guard = registry.write_guard().await?;
    repository.blobs().delete(digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

fn blob_location(repository: &Repository, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{}", repository.name(), digest)
}

fn upload_response(status: StatusCode, repository: &Repository, upload: &BlobUpload) -> Response {
    let range = format!("0-{}", upload.offset.saturating_sub(1));
    (
        status,
        [
            (
                header::LOCATION,
                format!("/v2/{}/blobs/uploads/{}", repository.name(), upload.id),
            ),
            (header::RANGE, range),
            (DOCKER_UPLOAD_UUID, upload.id.clone()),
        ],
    )
        .into_response()
}

fn created(repository: &Repository, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(repository, digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response()
}

fn digest_param(query: &HashMap<String, String>) -> Option<RegistryResult<Digest>> {
    query.get("digest").map(|digest| digest.parse())
}

/// Start a blob upload session, or store the whole blob when `?digest=` is given
pub(super) async fn start_upload(
    registry: &Registry,
    repository: &Repository,
    query: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    let _guard = registry.write_guard().await?;

    if let Some(digest) = digest_param(query) {
        let digest = digest?;
        repository.uploads().monolithic(&digest, &body).await?;
        return Ok(created(repository, &digest));
    }

    let upload = repository.uploads().start().await?;
    Ok(upload_response(StatusCode::ACCEPTED, repository, &upload))
}

/// Report the progress of an upload session
pub(super) async fn upload_status(repository: &Repository, id: &str) -> RegistryResult<Response> {
    let upload = repository.uploads().status(id).await?;
    Ok(upload_response(StatusCode::NO_CONTENT, repository, &upload))
}

/// Append a chunk to an upload session
pub(super) async fn append_upload(
    registry: &Registry,
    repository: &Repository,
    id: &str,
    body: Bytes,
) -> RegistryResult<Response> {
    let _guard = registry.write_guard().await?;
    let upload = repository.uploads().append(id, &body).await?;
    Ok(upload_response(StatusCode::ACCEPTED, repository, &upload))
}

/// Complete a blob upload
///
/// The digest comes from the `digest` query parameter, or a `digest` header.
pub(super) async fn complete_upload(
    registry: &Registry,
    repository: &Repository,
    id: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let digest = match digest_param(query) {
        Some(digest) => digest?,
        None => headers
            .get("digest")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".into()))?
            .parse()?,
    };

    let _guard = registry.write_guard().await?;
    repository.uploads().commit(id, &digest, &body).await?;
    Ok(created(repository, &digest))
}

/// Cancel a blob upload
pub(super) async fn cancel_upload(
    registry: &Registry,
    repository: &Repository,
    id: &str,
) -> RegistryResult<Response> {
    let _guard = registry.write_guard().await?;
    repository.uploads().cancel(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
