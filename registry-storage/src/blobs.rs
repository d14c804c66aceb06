//! Content-addressable blob storage

use std::collections::BTreeSet;

use axum::http::Uri;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, BoxStream, StreamExt};
use storage::StorageBucket;

use crate::cache::BlobDescriptorService;
use crate::descriptor::{Descriptor, MEDIA_TYPE_OCTET_STREAM};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;
use crate::paths;

/// Where blob bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlobScope {
    /// One copy per digest, shared by every repository.
    Global,
    /// One copy per digest per repository.
    Repository(RepositoryName),
}

impl std::fmt::Display for BlobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobScope::Global => f.write_str("global"),
            BlobScope::Repository(name) => write!(f, "repository {name}"),
        }
    }
}

/// Immutable blobs keyed by digest, in one [`BlobScope`].
///
/// Writing a digest that already exists is a no-op, so concurrent pushes of
/// the same content are safe.
#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket: StorageBucket,
    scope: BlobScope,
}

impl BlobStore {
    /// A blob store over `bucket`, fixed to `scope`.
    pub fn new(bucket: StorageBucket, scope: BlobScope) -> Self {
        Self { bucket, scope }
    }

    /// The scope this store writes to.
    pub fn scope(&self) -> &BlobScope {
        &self.scope
    }

    fn path(&self, digest: &Digest) -> Utf8PathBuf {
        paths::blob_data_path(&self.scope, digest)
    }

    /// Store `content`, returning its descriptor.
    #[tracing::instrument(level = "debug", skip(self, content), fields(scope = %self.scope, size = content.len()))]
    pub async fn put(&self, media_type: &str, content: &[u8]) -> RegistryResult<Descriptor> {
        let digest = Digest::from_bytes(content);
        let descriptor = Descriptor::new(media_type, content.len() as u64, digest.clone());

        let path = self.path(&digest);
        if self.bucket.exists(&path).await? {
            tracing::trace!(%digest, "blob already present");
            return Ok(descriptor);
        }

        self.bucket.put_content(&path, content).await?;
        Ok(descriptor)
    }

    /// Read a whole blob.
    #[tracing::instrument(level = "debug", skip(self), fields(scope = %self.scope))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Vec<u8>> {
        self.bucket
            .get_content(&self.path(digest))
            .await
            .map_err(|err| blob_error(err, digest))
    }

    /// Describe a blob. The media type of raw blobs is not recorded.
    pub async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        let metadata = self
            .bucket
            .metadata(&self.path(digest))
            .await
            .map_err(|err| blob_error(err, digest))?;
        Ok(Descriptor::new(
            MEDIA_TYPE_OCTET_STREAM,
            metadata.size,
            digest.clone(),
        ))
    }

    /// Whether the blob is present.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&self.path(digest)).await?)
    }

    /// Remove this scope's copy of a blob.
    #[tracing::instrument(level = "debug", skip(self), fields(scope = %self.scope))]
    pub async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        let path = self.path(digest);
        if !self.bucket.exists(&path).await? {
            return Err(RegistryError::BlobUnknown(digest.clone()));
        }
        self.bucket.delete(&path).await?;
        Ok(())
    }

    /// A direct backend URL for the blob, when the driver offers one.
    pub async fn redirect_url(&self, digest: &Digest) -> RegistryResult<Option<Uri>> {
        self.bucket
            .url_for(&self.path(digest))
            .await
            .map_err(|err| blob_error(err, digest))
    }

    /// Every digest stored in this scope, in digest order.
    pub fn enumerate(&self) -> BoxStream<'static, RegistryResult<Digest>> {
        digest_stream(
            self.bucket.clone(),
            paths::blobs_root(&self.scope),
            paths::digest_from_blob_data,
        )
    }
}

#[async_trait::async_trait]
impl BlobDescriptorService for BlobStore {
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        BlobStore::stat(self, digest).await
    }

    async fn set_descriptor(&self, _digest: &Digest, _descriptor: &Descriptor) -> RegistryResult<()> {
        Ok(())
    }

    async fn clear(&self, _digest: &Digest) -> RegistryResult<()> {
        Err(RegistryError::Unsupported("clearing raw blob descriptors"))
    }
}

pub(crate) fn blob_error(err: storage::StorageError, digest: &Digest) -> RegistryError {
    if err.is_not_found() {
        RegistryError::BlobUnknown(digest.clone())
    } else {
        err.into()
    }
}

/// List every key under `root`. A missing root lists as empty.
pub(crate) async fn list_keys(bucket: &StorageBucket, root: &Utf8Path) -> RegistryResult<Vec<String>> {
    match bucket.list(Some(root)).await {
        Ok(keys) => Ok(keys),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Lazily list `root` and parse each key into a digest.
///
/// The listing happens on first poll. Keys that do not parse are skipped;
/// duplicates collapse and the output is sorted.
pub(crate) fn digest_stream(
    bucket: StorageBucket,
    root: Utf8PathBuf,
    parse: fn(&Utf8Path, &str) -> Option<Digest>,
) -> BoxStream<'static, RegistryResult<Digest>> {
    stream::once(async move {
        let keys = list_keys(&bucket, &root).await?;
        let digests: BTreeSet<Digest> = keys.iter().filter_map(|key| parse(&root, key)).collect();
        Ok::<_, RegistryError>(digests)
    })
    .flat_map(|listed| match listed {
        Ok(digests) => stream::iter(digests.into_iter().map(Ok)).left_stream(),
        Err(err) => stream::iter([Err(err)]).right_stream(),
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::TryStreamExt;
    use storage::{MemoryStorage, Storage};

    fn bucket() -> StorageBucket {
        let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
        storage.bucket("registry")
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = BlobStore::new(bucket(), BlobScope::Global);

        let first = store.put("application/octet-stream", b"layer").await.unwrap();
        let second = store.put("application/octet-stream", b"layer").await.unwrap();
        assert_eq!(first, second);

        let all: Vec<_> = store.enumerate().try_collect().await.unwrap();
        assert_eq!(all, vec![first.digest.clone()]);
        assert_eq!(store.get(&first.digest).await.unwrap(), b"layer");
        assert_eq!(store.stat(&first.digest).await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn missing_blob_is_unknown() {
        let store = BlobStore::new(bucket(), BlobScope::Global);
        let digest = Digest::from_bytes(b"nothing");

        assert!(matches!(store.get(&digest).await, Err(RegistryError::BlobUnknown(_))));
        assert!(matches!(store.stat(&digest).await, Err(RegistryError::BlobUnknown(_))));
        assert!(matches!(store.delete(&digest).await, Err(RegistryError::BlobUnknown(_))));
        assert!(!store.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn scoped_stores_are_isolated() {
        let bucket = bucket();
        let one = BlobStore::new(
            bucket.clone(),
            BlobScope::Repository(RepositoryName::new("one").unwrap()),
        );
        let two = BlobStore::new(
            bucket.clone(),
            BlobScope::Repository(RepositoryName::new("two").unwrap()),
        );

        let x = one.put("", b"x").await.unwrap();
        two.put("", b"x").await.unwrap();

        one.delete(&x.digest).await.unwrap();
        assert!(!one.exists(&x.digest).await.unwrap());
        assert!(two.exists(&x.digest).await.unwrap());

        let global = BlobStore::new(bucket, BlobScope::Global);
        let listed: Vec<_> = global.enumerate().try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn enumerate_is_sorted_and_restartable() {
        let store = BlobStore::new(bucket(), BlobScope::Global);
        let mut expected = Vec::new();
        for content in [&b"a"[..], b"b", b"c"] {
            expected.push(store.put("", content).await.unwrap().digest);
        }
        expected.sort();

        let once: Vec<_> = store.enumerate().try_collect().await.unwrap();
        let twice: Vec<_> = store.enumerate().try_collect().await.unwrap();
        assert_eq!(once, expected);
        assert_eq!(twice, expected);
    }
}
