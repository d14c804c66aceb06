//! Repository links onto the blob store
//!
//! A digest is visible in a repository once a link file naming it exists under
//! one of the repository's link schemes. New links go to the current scheme only;
//! lookups and removals consider every scheme, in order, so content linked by
//! older layouts stays reachable.

use std::sync::Arc;

use axum::http::Uri;
use camino::Utf8PathBuf;
use futures::stream::BoxStream;
use storage::StorageBucket;

use crate::blobs::{self, BlobStore};
use crate::cache::{BlobDescriptorService, CachedBlobStatter};
use crate::config::RegistryConfig;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;
use crate::paths;

/// A place where a repository records that it holds a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScheme {
    /// `_manifests/revisions/<alg>/<hex>/link`
    ManifestRevision,
    /// `_layers/<alg>/<hex>/link`, used for blobs and, historically, manifests.
    Layer,
}

impl LinkScheme {
    fn root(self, repository: &RepositoryName) -> Utf8PathBuf {
        match self {
            LinkScheme::ManifestRevision => paths::manifest_revisions_root(repository),
            LinkScheme::Layer => paths::layer_links_root(repository),
        }
    }

    pub(crate) fn path(self, repository: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
        match self {
            LinkScheme::ManifestRevision => paths::manifest_revision_link_path(repository, digest),
            LinkScheme::Layer => paths::layer_link_path(repository, digest),
        }
    }
}

/// Resolves digests through a repository's link files.
#[derive(Debug)]
struct LinkedBlobStatter {
    bucket: StorageBucket,
    repository: RepositoryName,
    blob_store: BlobStore,
    schemes: Vec<LinkScheme>,
}

impl LinkedBlobStatter {
    async fn read_link(&self, scheme: LinkScheme, digest: &Digest) -> RegistryResult<Option<Digest>> {
        let path = scheme.path(&self.repository, digest);
        let content = match self.bucket.get_content(&path).await {
            Ok(content) => content,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let target = std::str::from_utf8(&content)
            .map_err(|_| RegistryError::DigestInvalid(path.to_string()))?
            .trim()
            .parse()?;
        Ok(Some(target))
    }

    async fn remove_links(&self, digest: &Digest) -> RegistryResult<bool> {
        let mut removed = false;
        for scheme in &self.schemes {
            let path = scheme.path(&self.repository, digest);
            if self.bucket.exists(&path).await? {
                tracing::debug!(repository = %self.repository, %digest, ?scheme, "removing link");
                self.bucket.delete(&path).await?;
                removed = true;
            }
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl BlobDescriptorService for LinkedBlobStatter {
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        for scheme in &self.schemes {
            let Some(target) = self.read_link(*scheme, digest).await? else {
                continue;
            };

            if &target != digest {
                tracing::warn!(
                    repository = %self.repository,
                    %digest,
                    %target,
                    "link target does not match requested digest"
                );
            }
            return self.blob_store.stat(&target).await;
        }

        Err(RegistryError::BlobUnknown(digest.clone()))
    }

    async fn set_descriptor(&self, _digest: &Digest, _descriptor: &Descriptor) -> RegistryResult<()> {
        Ok(())
    }

    async fn clear(&self, digest: &Digest) -> RegistryResult<()> {
        if self.remove_links(digest).await? {
            Ok(())
        } else {
            Err(RegistryError::BlobUnknown(digest.clone()))
        }
    }
}

/// A repository's view of the blob store, through its links.
#[derive(Debug, Clone)]
pub struct LinkedBlobStore {
    bucket: StorageBucket,
    repository: RepositoryName,
    blob_store: BlobStore,
    current: LinkScheme,
    links: Arc<LinkedBlobStatter>,
    cache: Option<Arc<dyn BlobDescriptorService>>,
    statter: Arc<dyn BlobDescriptorService>,
    config: Arc<RegistryConfig>,
}

impl LinkedBlobStore {
    /// Links for `repository`. New links go under `current`; lookups also
    /// fall back to `legacy`, in order.
    pub(crate) fn new(
        bucket: StorageBucket,
        repository: RepositoryName,
        blob_store: BlobStore,
        current: LinkScheme,
        legacy: &[LinkScheme],
        config: Arc<RegistryConfig>,
    ) -> RegistryResult<Self> {
        let schemes = std::iter::once(current)
            .chain(legacy.iter().copied().filter(|scheme| *scheme != current))
            .collect();

        let links = Arc::new(LinkedBlobStatter {
            bucket: bucket.clone(),
            repository: repository.clone(),
            blob_store: blob_store.clone(),
            schemes,
        });

        let cache = config
            .blob_descriptor_cache()
            .map(|provider| provider.repository_scoped(&repository))
            .transpose()?;

        let mut statter: Arc<dyn BlobDescriptorService> = links.clone();
        if let Some(cache) = &cache {
            statter = Arc::new(CachedBlobStatter::new(cache.clone(), statter));
        }
        if let Some(controller) = config.blob_access_controller() {
            statter = controller.blob_access_controller(statter);
        }

        Ok(Self {
            bucket,
            repository,
            blob_store,
            current,
            links,
            cache,
            statter,
            config,
        })
    }

    /// The repository these links belong to.
    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    /// The store holding the linked bytes.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// Resolve a digest through the link files alone, checking each scheme in order.
    pub async fn resolve(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        self.links.stat(digest).await
    }

    /// Describe a linked digest, through the cache and access controller.
    pub async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        self.statter.stat(digest).await
    }

    /// Whether the digest is linked into this repository.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        match self.stat(digest).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Read a linked blob.
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Vec<u8>> {
        let descriptor = self.stat(digest).await?;
        self.blob_store.get(&descriptor.digest).await
    }

    /// Store bytes and link them into the repository.
    #[tracing::instrument(level = "debug", skip(self, content), fields(repository = %self.repository))]
    pub async fn put(&self, media_type: &str, content: &[u8]) -> RegistryResult<Descriptor> {
        let descriptor = self.blob_store.put(media_type, content).await?;
        self.link(&descriptor.digest).await?;
        self.statter
            .set_descriptor(&descriptor.digest, &descriptor)
            .await?;
        Ok(descriptor)
    }

    /// Link an already stored digest under the current scheme.
    pub async fn link(&self, digest: &Digest) -> RegistryResult<()> {
        let path = self.current.path(&self.repository, digest);
        tracing::debug!(repository = %self.repository, %digest, %path, "linking");
        self.bucket
            .put_content(&path, digest.to_string().as_bytes())
            .await?;
        Ok(())
    }

    /// Remove the digest's link under every scheme where one exists.
    ///
    /// Returns whether any link was removed.
    pub async fn unlink(&self, digest: &Digest) -> RegistryResult<bool> {
        let removed = self.links.remove_links(digest).await?;
        if let Some(cache) = &self.cache {
            match cache.clear(digest).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    /// Delete a digest from the repository. Requires deletes to be enabled.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        if !self.config.delete_enabled() {
            return Err(RegistryError::Unsupported("delete"));
        }

        self.stat(digest).await?;
        if !self.unlink(digest).await? {
            return Err(RegistryError::BlobUnknown(digest.clone()));
        }
        Ok(())
    }

    /// Every digest linked under the current scheme.
    pub fn enumerate(&self) -> BoxStream<'static, RegistryResult<Digest>> {
        blobs::digest_stream(
            self.bucket.clone(),
            self.current.root(&self.repository),
            paths::digest_from_link,
        )
    }

    /// A backend URL to redirect clients to, when redirects are enabled.
    pub async fn redirect(&self, digest: &Digest) -> RegistryResult<Option<Uri>> {
        if !self.config.redirect() {
            return Ok(None);
        }
        let descriptor = self.stat(digest).await?;
        self.blob_store.redirect_url(&descriptor.digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::TryStreamExt;
    use storage::{MemoryStorage, Storage};

    use crate::blobs::BlobScope;
    use crate::cache::InMemoryBlobDescriptorCacheProvider;

    fn bucket() -> StorageBucket {
        let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
        storage.bucket("registry")
    }

    fn repo() -> RepositoryName {
        RepositoryName::new("library/app").unwrap()
    }

    fn manifests(bucket: &StorageBucket, config: RegistryConfig) -> LinkedBlobStore {
        LinkedBlobStore::new(
            bucket.clone(),
            repo(),
            BlobStore::new(bucket.clone(), BlobScope::Global),
            LinkScheme::ManifestRevision,
            &[LinkScheme::Layer],
            Arc::new(config),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_links_current_scheme_only() {
        let bucket = bucket();
        let store = manifests(&bucket, RegistryConfig::default());

        let descriptor = store.put("application/json", b"{}").await.unwrap();
        assert!(
            bucket
                .exists(&paths::manifest_revision_link_path(&repo(), &descriptor.digest))
                .await
                .unwrap()
        );
        assert!(
            !bucket
                .exists(&paths::layer_link_path(&repo(), &descriptor.digest))
                .await
                .unwrap()
        );

        let listed: Vec<_> = store.enumerate().try_collect().await.unwrap();
        assert_eq!(listed, vec![descriptor.digest]);
    }

    #[tokio::test]
    async fn legacy_link_still_resolves() {
        let bucket = bucket();
        let global = BlobStore::new(bucket.clone(), BlobScope::Global);
        let descriptor = global.put("", b"old manifest").await.unwrap();
        bucket
            .put_content(
                &paths::layer_link_path(&repo(), &descriptor.digest),
                descriptor.digest.to_string().as_bytes(),
            )
            .await
            .unwrap();

        let store = manifests(&bucket, RegistryConfig::default());
        let resolved = store.resolve(&descriptor.digest).await.unwrap();
        assert_eq!(resolved.digest, descriptor.digest);
        assert_eq!(store.get(&descriptor.digest).await.unwrap(), b"old manifest");

        assert!(store.unlink(&descriptor.digest).await.unwrap());
        assert!(!store.exists(&descriptor.digest).await.unwrap());
        assert!(!store.unlink(&descriptor.digest).await.unwrap());
    }

    #[tokio::test]
    async fn unlinked_digest_is_unknown() {
        let bucket = bucket();
        let store = manifests(&bucket, RegistryConfig::default());

        // Present in the blob store but not linked.
        let global = BlobStore::new(bucket.clone(), BlobScope::Global);
        let descriptor = global.put("", b"elsewhere").await.unwrap();

        assert!(matches!(
            store.stat(&descriptor.digest).await,
            Err(RegistryError::BlobUnknown(_))
        ));
    }

    #[tokio::test]
    async fn delete_requires_enabled() {
        let bucket = bucket();
        let store = manifests(&bucket, RegistryConfig::default());
        let descriptor = store.put("", b"x").await.unwrap();
        assert!(matches!(
            store.delete(&descriptor.digest).await,
            Err(RegistryError::Unsupported(_))
        ));

        let config = RegistryConfig::builder().delete_enabled(true).build().unwrap();
        let store = manifests(&bucket, config);
        store.delete(&descriptor.digest).await.unwrap();
        assert!(!store.exists(&descriptor.digest).await.unwrap());
        assert!(matches!(
            store.delete(&descriptor.digest).await,
            Err(RegistryError::BlobUnknown(_))
        ));
    }

    #[tokio::test]
    async fn cache_is_cleared_on_unlink() {
        let bucket = bucket();
        let config = RegistryConfig::builder()
            .blob_descriptor_cache(Arc::new(InMemoryBlobDescriptorCacheProvider::new()))
            .build()
            .unwrap();
        let store = manifests(&bucket, config);

        let descriptor = store.put("", b"cached").await.unwrap();
        assert!(store.exists(&descriptor.digest).await.unwrap());

        store.unlink(&descriptor.digest).await.unwrap();
        assert!(!store.exists(&descriptor.digest).await.unwrap());
    }

    #[tokio::test]
    async fn store_without_legacy_schemes() {
        let bucket = bucket();
        let store = LinkedBlobStore::new(
            bucket.clone(),
            repo(),
            BlobStore::new(bucket.clone(), BlobScope::Global),
            LinkScheme::Layer,
            &[],
            Arc::new(RegistryConfig::default()),
        )
        .unwrap();

        let descriptor = store.put("", b"layer").await.unwrap();
        assert!(
            bucket
                .exists(&paths::layer_link_path(&repo(), &descriptor.digest))
                .await
                .unwrap()
        );
        assert_eq!(store.get(&descriptor.digest).await.unwrap(), b"layer");

        let listed: Vec<_> = store.enumerate().try_collect().await.unwrap();
        assert_eq!(listed, vec![descriptor.digest.clone()]);
        assert!(store.unlink(&descriptor.digest).await.unwrap());
    }
}
