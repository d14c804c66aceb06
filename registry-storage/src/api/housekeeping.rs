//! The garbage collection trigger

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::gc::GcOptions;
use crate::name::RepositoryName;
use crate::registry::Registry;

/// Collect the whole registry, or a single repository when `name` is given.
///
/// Answers 200 with an empty body on success, or 500 with the error text.
pub(super) async fn run(registry: &Registry, name: Option<RepositoryName>) -> Response {
    let collector = registry.garbage_collector(GcOptions::default());
    let result = match &name {
        Some(name) => collector.run_repository(name).await,
        None => collector.run().await,
    };

    match result {
        Ok(report) => {
            tracing::info!(
                repository = name.as_ref().map(tracing::field::display),
                marked = report.marked,
                manifests = report.manifests_deleted.len(),
                blobs = report.blobs_deleted.len(),
                "housekeeping finished"
            );
            (StatusCode::OK, [(header::CONTENT_LENGTH, "0")]).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "housekeeping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
