//! Manifest service for one repository

use std::sync::Arc;

use futures::stream::BoxStream;

use super::{
    MEDIA_TYPE_FOREIGN_LAYER, MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER, Manifest, ManifestList,
    OciManifest, Schema2Manifest, SignedManifest,
};
use crate::config::RegistryConfig;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::linked::LinkedBlobStore;
use crate::name::RepositoryName;
use crate::tags::TagStore;

/// Stores, verifies and serves the manifests of one repository.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    repository: RepositoryName,
    manifests: LinkedBlobStore,
    blobs: LinkedBlobStore,
    tags: TagStore,
    config: Arc<RegistryConfig>,
}

impl ManifestStore {
    pub(crate) fn new(
        repository: RepositoryName,
        manifests: LinkedBlobStore,
        blobs: LinkedBlobStore,
        tags: TagStore,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            repository,
            manifests,
            blobs,
            tags,
            config,
        }
    }

    fn unknown(&self, digest: &Digest) -> RegistryError {
        RegistryError::ManifestUnknown {
            name: self.repository.to_string(),
            reference: digest.to_string(),
        }
    }

    /// Whether the manifest is linked into the repository.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        self.manifests.exists(digest).await
    }

    /// Load and parse a manifest.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Manifest> {
        let payload = match self.manifests.get(digest).await {
            Ok(payload) => payload,
            Err(RegistryError::BlobUnknown(_)) => return Err(self.unknown(digest)),
            Err(err) => return Err(err),
        };
        Manifest::unmarshal(None, &payload)
    }

    /// Verify and store a manifest, optionally tagging it.
    ///
    /// Unsigned schema 1 manifests are signed with the configured key first,
    /// so the returned descriptor names the bytes actually stored.
    #[tracing::instrument(level = "debug", skip(self, manifest), fields(repository = %self.repository, media_type = manifest.media_type()))]
    pub async fn put(&self, manifest: Manifest, tag: Option<&str>) -> RegistryResult<Descriptor> {
        let manifest = match manifest {
            Manifest::Schema1(signed) => Manifest::Schema1(self.prepare_schema1(signed).await?),
            Manifest::Schema2(m) => {
                self.verify_schema2(&m).await?;
                Manifest::Schema2(m)
            }
            Manifest::List(m) => {
                self.verify_list(&m).await?;
                Manifest::List(m)
            }
            Manifest::Oci(m) => {
                self.verify_oci(&m).await?;
                Manifest::Oci(m)
            }
        };

        let descriptor = self
            .manifests
            .put(manifest.media_type(), manifest.payload())
            .await?;

        if let Some(tag) = tag {
            self.tags.tag(tag, &descriptor).await?;
        }
        Ok(descriptor)
    }

    /// Untag and unlink a manifest. Requires deletes to be enabled.
    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.repository))]
    pub async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        if !self.config.delete_enabled() {
            return Err(RegistryError::Unsupported("delete"));
        }
        if !self.exists(digest).await? {
            return Err(self.unknown(digest));
        }

        for tag in self.tags.lookup(digest).await? {
            match self.tags.untag(&tag).await {
                Ok(()) | Err(RegistryError::TagUnknown(_)) => {}
                Err(err) => return Err(err),
            }
        }

        match self.manifests.delete(digest).await {
            Err(RegistryError::BlobUnknown(_)) => Err(self.unknown(digest)),
            other => other,
        }
    }

    /// Every manifest linked into the repository.
    pub fn enumerate(&self) -> BoxStream<'static, RegistryResult<Digest>> {
        self.manifests.enumerate()
    }

    async fn prepare_schema1(&self, signed: SignedManifest) -> RegistryResult<SignedManifest> {
        if !self.config.schema1_enabled() {
            return Err(RegistryError::SchemaV1Unsupported);
        }

        let manifest = signed.manifest();
        if manifest.fs_layers.is_empty() {
            return Err(RegistryError::ManifestInvalid("no layers".into()));
        }
        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(RegistryError::ManifestInvalid(format!(
                "{} layers but {} history entries",
                manifest.fs_layers.len(),
                manifest.history.len()
            )));
        }
        for descriptor in manifest.references() {
            self.require_blob(&descriptor.digest).await?;
        }

        if signed.is_signed() {
            signed.verify()?;
            return Ok(signed);
        }
        let key = self.config.schema1_signing_key().ok_or_else(|| {
            RegistryError::ManifestUnverified("no signing key for unsigned schema 1 manifest".into())
        })?;
        signed.sign(key)
    }

    async fn verify_schema2(&self, manifest: &Schema2Manifest) -> RegistryResult<()> {
        self.require_blob(&manifest.config().digest).await?;
        for layer in manifest.layers() {
            if layer.media_type == MEDIA_TYPE_FOREIGN_LAYER {
                if layer.urls.is_empty() {
                    return Err(RegistryError::ManifestUrlDenied(format!(
                        "foreign layer {} has no urls",
                        layer.digest
                    )));
                }
                self.check_urls(layer)?;
            } else {
                self.require_blob(&layer.digest).await?;
            }
        }
        Ok(())
    }

    async fn verify_oci(&self, manifest: &OciManifest) -> RegistryResult<()> {
        self.require_blob(&manifest.config().digest).await?;
        for layer in manifest.layers() {
            let nondistributable = layer.media_type == MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER
                || layer.media_type.contains(".nondistributable.");
            if nondistributable && !layer.urls.is_empty() {
                self.check_urls(layer)?;
            } else {
                self.require_blob(&layer.digest).await?;
            }
        }
        Ok(())
    }

    async fn verify_list(&self, list: &ManifestList) -> RegistryResult<()> {
        for child in list.manifests() {
            if !self.exists(&child.digest).await? {
                return Err(RegistryError::ManifestBlobUnknown(child.digest.clone()));
            }
        }
        Ok(())
    }

    async fn require_blob(&self, digest: &Digest) -> RegistryResult<()> {
        match self.blobs.stat(digest).await {
            Ok(_) => Ok(()),
            Err(RegistryError::BlobUnknown(_)) => {
                Err(RegistryError::ManifestBlobUnknown(digest.clone()))
            }
            Err(err) => Err(err),
        }
    }

    fn check_urls(&self, layer: &Descriptor) -> RegistryResult<()> {
        let policy = self.config.manifest_urls();
        for raw in &layer.urls {
            let parsed = url::Url::parse(raw)
                .map_err(|err| RegistryError::ManifestUrlDenied(format!("{raw}: {err}")))?;
            let scheme_ok = matches!(parsed.scheme(), "http" | "https");
            if !scheme_ok || parsed.fragment().is_some() || !policy.permits(raw) {
                return Err(RegistryError::ManifestUrlDenied(raw.clone()));
            }
        }
        Ok(())
    }
}
