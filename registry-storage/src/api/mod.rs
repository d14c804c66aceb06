//! HTTP surface over a [`Registry`]

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use serde_json::json;

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

mod blob;
mod housekeeping;
mod manifest;
mod route;

use self::route::Route;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    config: RegistryConfig,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            config: RegistryConfig::default(),
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the registry configuration
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the registry.
    ///
    /// The bucket defaults to `registry`.
    pub fn build(self) -> RegistryResult<Registry> {
        let storage = self
            .storage
            .ok_or_else(|| RegistryError::Config("storage backend must be configured".into()))?;
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
        Ok(Registry::new(storage, bucket, self.config))
    }
}

/// The registry's HTTP routes.
///
/// Serves the `/v2/` version check, blob and upload endpoints, manifests,
/// tag listing and `DELETE` housekeeping triggers.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/{*path}", any(dispatch))
        .with_state(registry)
}

/// API version check endpoint
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn dispatch(
    State(registry): State<Registry>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let Some(route) = Route::parse(&path)? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    tracing::trace!(%method, ?route, "dispatch");

    match route {
        Route::Blob { name, digest } => {
            let repository = registry.repository(name)?;
            match method {
                Method::GET => blob::get_blob(&repository, &digest).await,
                Method::HEAD => blob::head_blob(&repository, &digest).await,
                Method::DELETE => blob::delete_blob(&registry, &repository, &digest).await,
                _ => Ok(method_not_allowed()),
            }
        }
        Route::Uploads { name } => {
            let repository = registry.repository(name)?;
            match method {
                Method::POST => blob::start_upload(&registry, &repository, &query, body).await,
                _ => Ok(method_not_allowed()),
            }
        }
        Route::Upload { name, id } => {
            let repository = registry.repository(name)?;
            match method {
                Method::GET => blob::upload_status(&repository, &id).await,
                Method::PATCH => blob::append_upload(&registry, &repository, &id, body).await,
                Method::PUT => {
                    blob::complete_upload(&registry, &repository, &id, &query, &headers, body).await
                }
                Method::DELETE => blob::cancel_upload(&registry, &repository, &id).await,
                _ => Ok(method_not_allowed()),
            }
        }
        Route::Manifest { name, reference } => {
            let repository = registry.repository(name)?;
            match method {
                Method::GET => manifest::get_manifest(&repository, &reference).await,
                Method::HEAD => manifest::head_manifest(&repository, &reference).await,
                Method::PUT => {
                    manifest::put_manifest(&registry, &repository, &reference, &headers, body).await
                }
                Method::DELETE => {
                    manifest::delete_manifest(&registry, &repository, &reference).await
                }
                _ => Ok(method_not_allowed()),
            }
        }
        Route::Tags { name } => {
            let repository = registry.repository(name)?;
            match method {
                Method::GET => manifest::list_tags(&repository).await,
                _ => Ok(method_not_allowed()),
            }
        }
        Route::Housekeeping { name } => {
            // Not served at all in read-only mode.
            if method != Method::DELETE || registry.config().read_only() {
                return Ok(method_not_allowed());
            }
            Ok(housekeeping::run(&registry, name).await)
        }
    }
}

fn method_not_allowed() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .build()
            .unwrap();
        let _router = router(registry);
    }

    #[test]
    fn builder_needs_storage() {
        assert!(matches!(
            RegistryBuilder::new().build(),
            Err(RegistryError::Config(_))
        ));
    }
}
