//! Blob upload sessions

use std::sync::Arc;

use camino::Utf8Path;
use storage::StorageBucket;
use uuid::Uuid;

use crate::blobs::list_keys;
use crate::config::RegistryConfig;
use crate::descriptor::{Descriptor, MEDIA_TYPE_OCTET_STREAM};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::linked::LinkedBlobStore;
use crate::name::RepositoryName;
use crate::paths;

/// The state of an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpload {
    /// Session id.
    pub id: String,
    /// Bytes received so far.
    pub offset: u64,
}

/// Upload sessions for one repository.
///
/// Session data lives under the repository's `_uploads` directory until the
/// upload is committed into the linked blob store, or cancelled.
#[derive(Debug, Clone)]
pub struct UploadStore {
    bucket: StorageBucket,
    repository: RepositoryName,
    blobs: LinkedBlobStore,
    config: Arc<RegistryConfig>,
}

impl UploadStore {
    pub(crate) fn new(
        bucket: StorageBucket,
        repository: RepositoryName,
        blobs: LinkedBlobStore,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            bucket,
            repository,
            blobs,
            config,
        }
    }

    fn session(&self, id: &str) -> RegistryResult<String> {
        Uuid::parse_str(id)
            .map(|uuid| uuid.hyphenated().to_string())
            .map_err(|_| RegistryError::BlobUploadUnknown(id.to_owned()))
    }

    async fn read(&self, id: &str) -> RegistryResult<Vec<u8>> {
        match self
            .bucket
            .get_content(&paths::upload_data_path(&self.repository, id))
            .await
        {
            Ok(data) => Ok(data),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUploadUnknown(id.to_owned())),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a new session.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn start(&self) -> RegistryResult<BlobUpload> {
        let id = Uuid::new_v4().hyphenated().to_string();
        let started = chrono::Utc::now().to_rfc3339();

        self.bucket
            .put_content(&paths::upload_data_path(&self.repository, &id), b"")
            .await?;
        self.bucket
            .put_content(
                &paths::upload_started_at_path(&self.repository, &id),
                started.as_bytes(),
            )
            .await?;

        tracing::debug!(%id, "upload started");
        Ok(BlobUpload { id, offset: 0 })
    }

    /// The current state of a session.
    pub async fn status(&self, id: &str) -> RegistryResult<BlobUpload> {
        let id = self.session(id)?;
        let metadata = match self
            .bucket
            .metadata(&paths::upload_data_path(&self.repository, &id))
            .await
        {
            Ok(metadata) => metadata,
            Err(err) if err.is_not_found() => return Err(RegistryError::BlobUploadUnknown(id)),
            Err(err) => return Err(err.into()),
        };
        Ok(BlobUpload {
            id,
            offset: metadata.size,
        })
    }

    /// Append a chunk. Only available when resumable uploads are enabled.
    #[tracing::instrument(level = "debug", skip(self, chunk), fields(repository = %self.repository, size = chunk.len()))]
    pub async fn append(&self, id: &str, chunk: &[u8]) -> RegistryResult<BlobUpload> {
        if !self.config.resumable_digest() {
            return Err(RegistryError::Unsupported("chunked upload"));
        }
        let id = self.session(id)?;

        let mut data = self.read(&id).await?;
        data.extend_from_slice(chunk);
        self.bucket
            .put_content(&paths::upload_data_path(&self.repository, &id), &data)
            .await?;

        Ok(BlobUpload {
            id,
            offset: data.len() as u64,
        })
    }

    /// Finish a session with an optional final chunk, verifying the digest.
    #[tracing::instrument(level = "debug", skip(self, last), fields(repository = %self.repository))]
    pub async fn commit(&self, id: &str, digest: &Digest, last: &[u8]) -> RegistryResult<Descriptor> {
        let id = self.session(id)?;
        let mut data = self.read(&id).await?;
        data.extend_from_slice(last);

        digest.verify(&data)?;
        let descriptor = self.blobs.put(MEDIA_TYPE_OCTET_STREAM, &data).await?;
        self.remove(&id).await?;
        Ok(descriptor)
    }

    /// Store a whole blob in one request.
    pub async fn monolithic(&self, digest: &Digest, content: &[u8]) -> RegistryResult<Descriptor> {
        digest.verify(content)?;
        self.blobs.put(MEDIA_TYPE_OCTET_STREAM, content).await
    }

    /// Abandon a session.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn cancel(&self, id: &str) -> RegistryResult<()> {
        let id = self.session(id)?;
        if !self.remove(&id).await? {
            return Err(RegistryError::BlobUploadUnknown(id));
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> RegistryResult<bool> {
        let keys = list_keys(&self.bucket, &paths::upload_root(&self.repository, id)).await?;
        for key in &keys {
            self.bucket.delete(Utf8Path::new(key)).await?;
        }
        Ok(!keys.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use storage::MemoryStorage;

    use crate::registry::Registry;

    fn registry(config: RegistryConfig) -> Registry {
        Registry::new(MemoryStorage::with_buckets(&["registry"]).into(), "registry", config)
    }

    fn repo() -> RepositoryName {
        RepositoryName::new("library/app").unwrap()
    }

    #[tokio::test]
    async fn chunked_upload() {
        let registry = registry(RegistryConfig::default());
        let repo = registry.repository(repo()).unwrap();
        let uploads = repo.uploads();

        let session = uploads.start().await.unwrap();
        assert_eq!(session.offset, 0);

        let session = uploads.append(&session.id, b"hello ").await.unwrap();
        assert_eq!(session.offset, 6);
        assert_eq!(uploads.status(&session.id).await.unwrap().offset, 6);

        let digest = Digest::from_bytes(b"hello world");
        let descriptor = uploads.commit(&session.id, &digest, b"world").await.unwrap();
        assert_eq!(descriptor.digest, digest);
        assert_eq!(repo.blobs().get(&digest).await.unwrap(), b"hello world");

        assert!(matches!(
            uploads.status(&session.id).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn digest_mismatch_keeps_session() {
        let registry = registry(RegistryConfig::default());
        let repo = registry.repository(repo()).unwrap();
        let uploads = repo.uploads();

        let session = uploads.start().await.unwrap();
        let wrong = Digest::from_bytes(b"other");
        assert!(matches!(
            uploads.commit(&session.id, &wrong, b"data").await,
            Err(RegistryError::DigestMismatch { .. })
        ));
        assert!(!repo.blobs().exists(&wrong).await.unwrap());

        uploads.cancel(&session.id).await.unwrap();
        assert!(matches!(
            uploads.cancel(&session.id).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn chunks_need_resumable_digest() {
        let registry = registry(
            RegistryConfig::builder()
                .resumable_digest(false)
                .build()
                .unwrap(),
        );
        let repo = registry.repository(repo()).unwrap();
        let session = repo.uploads().start().await.unwrap();
        assert!(matches!(
            repo.uploads().append(&session.id, b"x").await,
            Err(RegistryError::Unsupported(_))
        ));

        let digest = Digest::from_bytes(b"whole");
        repo.uploads()
            .commit(&session.id, &digest, b"whole")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_sessions() {
        let registry = registry(RegistryConfig::default());
        let repo = registry.repository(repo()).unwrap();
        for id in ["../../etc", "not-a-uuid", "6a2f41a3-c54c-fce8-32d2-0324e1c32e22"] {
            assert!(matches!(
                repo.uploads().status(id).await,
                Err(RegistryError::BlobUploadUnknown(_))
            ));
        }
    }
}
