//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found, or not linked into the repository
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    /// Manifest not found
    #[error("manifest unknown: {name}@{reference}")]
    ManifestUnknown {
        /// Repository name
        name: String,
        /// Tag or digest
        reference: String,
    },

    /// Tag not found
    #[error("unknown tag: {0}")]
    TagUnknown(String),

    /// Upload session not found
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    TagInvalid(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Malformed or unsupported manifest
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// A manifest references content the repository does not have
    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(Digest),

    /// A manifest references a URL outside the configured policy
    #[error("manifest references a disallowed url: {0}")]
    ManifestUrlDenied(String),

    /// A signed manifest failed signature verification
    #[error("manifest failed signature verification: {0}")]
    ManifestUnverified(String),

    /// Legacy schema push while schema 1 support is disabled
    #[error("manifest schema v1 unsupported")]
    SchemaV1Unsupported,

    /// Operation disabled by configuration
    #[error("operation unsupported: {0}")]
    Unsupported(&'static str),

    /// The registry is in read-only mode
    #[error("registry is in read-only mode")]
    ReadOnly,

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Listing manifests, blobs or repositories failed
    #[error("failed to enumerate {what}: {source}")]
    Enumeration {
        /// What was being listed
        what: String,
        /// The underlying failure
        #[source]
        source: Box<RegistryError>,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
}

impl RegistryError {
    /// Wrap an error raised while listing `what`.
    pub(crate) fn enumeration(what: impl Into<String>) -> impl FnOnce(RegistryError) -> Self {
        let what = what.into();
        move |source| RegistryError::Enumeration {
            what,
            source: Box::new(source),
        }
    }

    /// Whether this is an expected negative result rather than a fault.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::ManifestUnknown { .. }
            | RegistryError::TagUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => true,
            RegistryError::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::ManifestUnknown { .. }
            | RegistryError::TagUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::DigestInvalid(_)
            | RegistryError::NameInvalid(_)
            | RegistryError::TagInvalid(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::ManifestInvalid(_)
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::ManifestUrlDenied(_)
            | RegistryError::ManifestUnverified(_)
            | RegistryError::SchemaV1Unsupported
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::Unsupported(_) | RegistryError::ReadOnly => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            RegistryError::Config(_)
            | RegistryError::Enumeration { .. }
            | RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestUnknown { .. } => "MANIFEST_UNKNOWN",
            RegistryError::TagUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::DigestInvalid(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::TagInvalid(_) => "TAG_INVALID",
            RegistryError::ManifestInvalid(_)
            | RegistryError::ManifestUrlDenied(_)
            | RegistryError::SchemaV1Unsupported => "MANIFEST_INVALID",
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestUnverified(_) => "MANIFEST_UNVERIFIED",
            RegistryError::Unsupported(_) | RegistryError::ReadOnly => "UNSUPPORTED",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::Config(_)
            | RegistryError::Enumeration { .. }
            | RegistryError::Storage(_) => "UNKNOWN",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_family() {
        let digest = Digest::from_bytes(b"x");
        assert!(RegistryError::BlobUnknown(digest.clone()).is_not_found());
        assert!(RegistryError::TagUnknown("latest".into()).is_not_found());
        assert!(!RegistryError::ManifestBlobUnknown(digest).is_not_found());
        assert!(!RegistryError::SchemaV1Unsupported.is_not_found());
    }

    #[test]
    fn enumeration_wraps_source() {
        let err = RegistryError::enumeration("manifests in library/app")(
            RegistryError::Config("boom".into()),
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.to_string(),
            "failed to enumerate manifests in library/app: invalid configuration: boom"
        );
    }
}
