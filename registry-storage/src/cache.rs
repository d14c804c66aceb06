//! Descriptor lookup services, caching and access control.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;

/// Answers "what is the descriptor for this digest?" for some scope.
///
/// Implemented by the raw blob stores, by the link layer, by descriptor
/// caches, and by access controllers wrapping any of those.
#[async_trait::async_trait]
pub trait BlobDescriptorService: fmt::Debug + Send + Sync {
    /// Describe a digest. Fails with [`RegistryError::BlobUnknown`] when absent.
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor>;

    /// Record a descriptor for a digest.
    async fn set_descriptor(&self, digest: &Digest, descriptor: &Descriptor) -> RegistryResult<()>;

    /// Forget a digest.
    async fn clear(&self, digest: &Digest) -> RegistryResult<()>;
}

/// A descriptor cache which can hand out repository-scoped views.
pub trait BlobDescriptorCacheProvider: BlobDescriptorService {
    /// The cache for a single repository.
    fn repository_scoped(
        &self,
        repository: &RepositoryName,
    ) -> RegistryResult<Arc<dyn BlobDescriptorService>>;
}

/// Wraps descriptor lookups with an access policy.
pub trait BlobAccessControllerFactory: fmt::Debug + Send + Sync {
    /// Wrap `inner`; the returned service decides which digests are visible.
    fn blob_access_controller(
        &self,
        inner: Arc<dyn BlobDescriptorService>,
    ) -> Arc<dyn BlobDescriptorService>;
}

#[derive(Debug, Default)]
struct MemoryDescriptorCache {
    descriptors: RwLock<HashMap<Digest, Descriptor>>,
}

#[async_trait::async_trait]
impl BlobDescriptorService for MemoryDescriptorCache {
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        self.descriptors
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::BlobUnknown(digest.clone()))
    }

    async fn set_descriptor(&self, digest: &Digest, descriptor: &Descriptor) -> RegistryResult<()> {
        self.descriptors
            .write()
            .insert(digest.clone(), descriptor.clone());
        Ok(())
    }

    async fn clear(&self, digest: &Digest) -> RegistryResult<()> {
        self.descriptors
            .write()
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| RegistryError::BlobUnknown(digest.clone()))
    }
}

/// An unbounded in-process descriptor cache.
#[derive(Debug, Default)]
pub struct InMemoryBlobDescriptorCacheProvider {
    global: MemoryDescriptorCache,
    repositories: RwLock<HashMap<RepositoryName, Arc<MemoryDescriptorCache>>>,
}

impl InMemoryBlobDescriptorCacheProvider {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BlobDescriptorService for InMemoryBlobDescriptorCacheProvider {
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        self.global.stat(digest).await
    }

    async fn set_descriptor(&self, digest: &Digest, descriptor: &Descriptor) -> RegistryResult<()> {
        self.global.set_descriptor(digest, descriptor).await
    }

    async fn clear(&self, digest: &Digest) -> RegistryResult<()> {
        self.global.clear(digest).await
    }
}

impl BlobDescriptorCacheProvider for InMemoryBlobDescriptorCacheProvider {
    fn repository_scoped(
        &self,
        repository: &RepositoryName,
    ) -> RegistryResult<Arc<dyn BlobDescriptorService>> {
        if let Some(cache) = self.repositories.read().get(repository) {
            return Ok(cache.clone());
        }

        let cache = self
            .repositories
            .write()
            .entry(repository.clone())
            .or_default()
            .clone();
        Ok(cache)
    }
}

/// Consults a cache before a backend, and fills the cache on a miss.
#[derive(Debug)]
pub(crate) struct CachedBlobStatter {
    cache: Arc<dyn BlobDescriptorService>,
    backend: Arc<dyn BlobDescriptorService>,
}

impl CachedBlobStatter {
    pub(crate) fn new(
        cache: Arc<dyn BlobDescriptorService>,
        backend: Arc<dyn BlobDescriptorService>,
    ) -> Self {
        Self { cache, backend }
    }
}

#[async_trait::async_trait]
impl BlobDescriptorService for CachedBlobStatter {
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        match self.cache.stat(digest).await {
            Ok(descriptor) => return Ok(descriptor),
            Err(err) if err.is_not_found() => {}
            Err(err) => tracing::warn!(%digest, error = %err, "descriptor cache lookup failed"),
        }

        let descriptor = self.backend.stat(digest).await?;
        if let Err(err) = self.cache.set_descriptor(digest, &descriptor).await {
            tracing::warn!(%digest, error = %err, "descriptor cache fill failed");
        }
        Ok(descriptor)
    }

    async fn set_descriptor(&self, digest: &Digest, descriptor: &Descriptor) -> RegistryResult<()> {
        self.backend.set_descriptor(digest, descriptor).await?;
        if let Err(err) = self.cache.set_descriptor(digest, descriptor).await {
            tracing::warn!(%digest, error = %err, "descriptor cache fill failed");
        }
        Ok(())
    }

    async fn clear(&self, digest: &Digest) -> RegistryResult<()> {
        match self.cache.clear(digest).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.backend.clear(digest).await
    }
}
