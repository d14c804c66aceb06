//! The registry namespace and its repositories

use std::collections::BTreeSet;
use std::sync::Arc;

use storage::{Storage, StorageBucket};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::blobs::{BlobScope, BlobStore, list_keys};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::gc::{GarbageCollector, GcOptions};
use crate::linked::{LinkScheme, LinkedBlobStore};
use crate::manifest::ManifestStore;
use crate::name::RepositoryName;
use crate::paths;
use crate::tags::TagStore;
use crate::upload::UploadStore;
use crate::vacuum::Vacuum;

#[derive(Debug)]
struct Inner {
    bucket: StorageBucket,
    config: Arc<RegistryConfig>,
    global: BlobStore,
    maintenance: RwLock<()>,
}

/// Every repository in one storage bucket, plus the shared blob store.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// A registry over `bucket` in `storage`.
    pub fn new(storage: Storage, bucket: impl Into<String>, config: RegistryConfig) -> Self {
        let bucket = storage.bucket(bucket);
        let global = BlobStore::new(bucket.clone(), BlobScope::Global);
        Self {
            inner: Arc::new(Inner {
                bucket,
                config: Arc::new(config),
                global,
                maintenance: RwLock::new(()),
            }),
        }
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub(crate) fn bucket(&self) -> &StorageBucket {
        &self.inner.bucket
    }

    /// The shared blob store. Empty when blobs are stored per repository.
    pub fn global_blobs(&self) -> &BlobStore {
        &self.inner.global
    }

    /// Open a repository. Nothing is written until content is pushed.
    pub fn repository(&self, name: RepositoryName) -> RegistryResult<Repository> {
        Repository::new(self, name)
    }

    /// Every repository with any stored state, sorted by name.
    pub async fn repositories(&self) -> RegistryResult<Vec<RepositoryName>> {
        let keys = list_keys(&self.inner.bucket, &paths::repositories_root())
            .await
            .map_err(RegistryError::enumeration("repositories"))?;
        let names: BTreeSet<RepositoryName> = keys
            .iter()
            .filter_map(|key| paths::repository_from_key(key))
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Sweeping operations over this registry's storage.
    pub fn vacuum(&self) -> Vacuum {
        Vacuum::new(self.clone())
    }

    /// A garbage collector for this registry.
    pub fn garbage_collector(&self, options: GcOptions) -> GarbageCollector {
        GarbageCollector::new(self.clone(), options)
    }

    /// Hold off maintenance for the duration of a write.
    ///
    /// Fails with [`RegistryError::ReadOnly`] in read-only mode.
    pub async fn write_guard(&self) -> RegistryResult<RwLockReadGuard<'_, ()>> {
        if self.inner.config.read_only() {
            return Err(RegistryError::ReadOnly);
        }
        Ok(self.inner.maintenance.read().await)
    }

    /// Exclude all writers while maintenance runs.
    pub(crate) async fn maintenance_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.maintenance.write().await
    }
}

/// One repository's services.
#[derive(Debug, Clone)]
pub struct Repository {
    name: RepositoryName,
    blob_store: BlobStore,
    blobs: LinkedBlobStore,
    manifests: ManifestStore,
    tags: TagStore,
    uploads: UploadStore,
}

impl Repository {
    fn new(registry: &Registry, name: RepositoryName) -> RegistryResult<Self> {
        let bucket = registry.bucket().clone();
        let config = registry.inner.config.clone();

        let blob_store = if config.repository_blob_store() {
            BlobStore::new(bucket.clone(), BlobScope::Repository(name.clone()))
        } else {
            registry.global_blobs().clone()
        };

        let blobs = LinkedBlobStore::new(
            bucket.clone(),
            name.clone(),
            blob_store.clone(),
            LinkScheme::Layer,
            &[],
            config.clone(),
        )?;
        let manifest_links = LinkedBlobStore::new(
            bucket.clone(),
            name.clone(),
            blob_store.clone(),
            LinkScheme::ManifestRevision,
            &[LinkScheme::Layer],
            config.clone(),
        )?;
        let tags = TagStore::new(bucket.clone(), name.clone());
        let manifests = ManifestStore::new(
            name.clone(),
            manifest_links,
            blobs.clone(),
            tags.clone(),
            config.clone(),
        );
        let uploads = UploadStore::new(bucket, name.clone(), blobs.clone(), config);

        Ok(Self {
            name,
            blob_store,
            blobs,
            manifests,
            tags,
            uploads,
        })
    }

    /// The repository name.
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// The store holding this repository's blob bytes: its own scoped store,
    /// or the shared global one.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// Whether blob bytes are stored per repository.
    pub fn is_scoped(&self) -> bool {
        matches!(self.blob_store.scope(), BlobScope::Repository(_))
    }

    /// Layers and configs linked into the repository.
    pub fn blobs(&self) -> &LinkedBlobStore {
        &self.blobs
    }

    /// The manifest service.
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// The tag service.
    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    /// Blob upload sessions.
    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use storage::MemoryStorage;

    fn registry(config: RegistryConfig) -> Registry {
        Registry::new(MemoryStorage::with_buckets(&["registry"]).into(), "registry", config)
    }

    #[tokio::test]
    async fn repositories_are_listed_sorted() {
        let registry = registry(RegistryConfig::default());
        assert!(registry.repositories().await.unwrap().is_empty());

        for name in ["zeta", "library/app", "alpha/nested/deep"] {
            let repo = registry.repository(RepositoryName::new(name).unwrap()).unwrap();
            repo.blobs().put("", name.as_bytes()).await.unwrap();
        }

        let names: Vec<String> = registry
            .repositories()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec!["alpha/nested/deep", "library/app", "zeta"]);
    }

    #[tokio::test]
    async fn blob_scope_follows_config() {
        let global = registry(RegistryConfig::default());
        let repo = global.repository(RepositoryName::new("app").unwrap()).unwrap();
        assert!(!repo.is_scoped());
        let d = repo.blobs().put("", b"x").await.unwrap();
        assert!(global.global_blobs().exists(&d.digest).await.unwrap());

        let scoped = registry(
            RegistryConfig::builder()
                .repository_blob_store(true)
                .build()
                .unwrap(),
        );
        let repo = scoped.repository(RepositoryName::new("app").unwrap()).unwrap();
        assert!(repo.is_scoped());
        let d = repo.blobs().put("", b"x").await.unwrap();
        assert!(!scoped.global_blobs().exists(&d.digest).await.unwrap());
        assert!(repo.blob_store().exists(&d.digest).await.unwrap());
    }

    #[tokio::test]
    async fn read_only_refuses_writes() {
        let registry = registry(RegistryConfig::builder().read_only(true).build().unwrap());
        assert!(matches!(
            registry.write_guard().await,
            Err(RegistryError::ReadOnly)
        ));
    }
}
