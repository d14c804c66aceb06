//! Deleting what the garbage collector found unreachable

use crate::blobs::BlobScope;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::linked::LinkScheme;
use crate::name::RepositoryName;
use crate::paths;
use crate::registry::Registry;

/// Removes manifests, links and blobs from storage.
///
/// None of these operations check reachability; that is the caller's job.
#[derive(Debug, Clone)]
pub struct Vacuum {
    registry: Registry,
}

impl Vacuum {
    pub(crate) fn new(registry: Registry) -> Self {
        Self { registry }
    }

    async fn delete_if_exists(&self, path: &camino::Utf8Path) -> RegistryResult<bool> {
        let bucket = self.registry.bucket();
        if !bucket.exists(path).await? {
            return Ok(false);
        }
        bucket.delete(path).await?;
        Ok(true)
    }

    /// Remove a manifest from a repository.
    ///
    /// Deletes the history entry of `digest` under each of `tags`, then the
    /// manifest's links under every scheme. The manifest bytes are left for
    /// the blob sweep.
    #[tracing::instrument(level = "info", skip_all, fields(%repository, %digest))]
    pub async fn remove_manifest(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        tags: &[String],
    ) -> RegistryResult<()> {
        tracing::info!("deleting manifest");

        for tag in tags {
            let entry = paths::manifest_tag_index_entry_path(repository, tag, digest);
            if self.delete_if_exists(&entry).await? {
                tracing::debug!(%tag, "deleted tag history entry");
            }
        }

        for scheme in [LinkScheme::ManifestRevision, LinkScheme::Layer] {
            self.delete_if_exists(&scheme.path(repository, digest)).await?;
        }
        Ok(())
    }

    /// Remove a blob from one repository.
    ///
    /// With per-repository storage the repository's copy is deleted; with the
    /// global store only the repository's link goes.
    #[tracing::instrument(level = "info", skip_all, fields(%repository, %digest))]
    pub async fn remove_repository_blob(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
    ) -> RegistryResult<()> {
        if self.registry.config().repository_blob_store() {
            tracing::info!("deleting blob");
            let scope = BlobScope::Repository(repository.clone());
            self.delete_if_exists(&paths::blob_data_path(&scope, digest))
                .await?;
        } else {
            tracing::info!("unlinking blob");
        }

        self.delete_if_exists(&LinkScheme::Layer.path(repository, digest))
            .await?;
        Ok(())
    }

    /// Remove a blob from the global store. A missing blob is not an error.
    #[tracing::instrument(level = "info", skip_all, fields(%digest))]
    pub async fn remove_blob(&self, digest: &Digest) -> RegistryResult<()> {
        tracing::info!("deleting blob");
        match self.registry.global_blobs().delete(digest).await {
            Ok(()) | Err(RegistryError::BlobUnknown(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use storage::MemoryStorage;

    use crate::config::RegistryConfig;
    use crate::descriptor::Descriptor;

    fn registry(config: RegistryConfig) -> Registry {
        Registry::new(MemoryStorage::with_buckets(&["registry"]).into(), "registry", config)
    }

    #[tokio::test]
    async fn remove_manifest_clears_history_and_links() {
        let registry = registry(RegistryConfig::default());
        let name = RepositoryName::new("app").unwrap();
        let repo = registry.repository(name.clone()).unwrap();

        let old = Digest::from_bytes(b"old manifest");
        let new = Digest::from_bytes(b"new manifest");
        repo.tags().tag("latest", &Descriptor::from_digest(old.clone())).await.unwrap();
        repo.tags().tag("latest", &Descriptor::from_digest(new.clone())).await.unwrap();
        registry
            .bucket()
            .put_content(
                &paths::manifest_revision_link_path(&name, &old),
                old.to_string().as_bytes(),
            )
            .await
            .unwrap();

        registry
            .vacuum()
            .remove_manifest(&name, &old, &["latest".to_owned(), "gone".to_owned()])
            .await
            .unwrap();

        assert_eq!(repo.tags().history("latest").await.unwrap(), vec![new.clone()]);
        assert_eq!(repo.tags().get("latest").await.unwrap().digest, new);
        assert!(
            !registry
                .bucket()
                .exists(&paths::manifest_revision_link_path(&name, &old))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn scoped_removal_leaves_other_repositories() {
        let registry = registry(
            RegistryConfig::builder()
                .repository_blob_store(true)
                .build()
                .unwrap(),
        );
        let r1 = registry.repository(RepositoryName::new("r1").unwrap()).unwrap();
        let r2 = registry.repository(RepositoryName::new("r2").unwrap()).unwrap();

        let x = r1.blobs().put("", b"x").await.unwrap();
        r2.blobs().put("", b"x").await.unwrap();

        registry
            .vacuum()
            .remove_repository_blob(r1.name(), &x.digest)
            .await
            .unwrap();

        assert!(!r1.blob_store().exists(&x.digest).await.unwrap());
        assert!(!r1.blobs().exists(&x.digest).await.unwrap());
        assert!(r2.blobs().exists(&x.digest).await.unwrap());
        assert_eq!(r2.blobs().get(&x.digest).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn remove_blob_tolerates_missing() {
        let registry = registry(RegistryConfig::default());
        registry
            .vacuum()
            .remove_blob(&Digest::from_bytes(b"never stored"))
            .await
            .unwrap();
    }
}
