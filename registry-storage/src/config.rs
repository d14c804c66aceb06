//! Registry configuration
//!
//! [`RegistryConfig`] is built once, validated by [`RegistryConfigBuilder::build`],
//! and then shared read-only with every component. [`RegistryOptions`] is the
//! serde form read from a config file.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use regex::Regex;
use serde::Deserialize;

use crate::cache::{
    BlobAccessControllerFactory, BlobDescriptorCacheProvider, InMemoryBlobDescriptorCacheProvider,
};
use crate::error::{RegistryError, RegistryResult};

/// Allow and deny patterns for URLs referenced by manifests, as configured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestUrlOptions {
    /// URLs must match this pattern.
    #[serde(default)]
    pub allow: Option<String>,

    /// URLs must not match this pattern.
    #[serde(default)]
    pub deny: Option<String>,
}

/// Which descriptor cache to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CacheKind {
    /// [`InMemoryBlobDescriptorCacheProvider`]
    #[serde(rename = "inmemory")]
    InMemory,
}

/// Registry options as they appear in a configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryOptions {
    /// Serve blobs by redirecting to the backend.
    #[serde(default)]
    pub redirect: bool,

    /// Allow deleting blobs and manifests.
    #[serde(default)]
    pub delete_enabled: bool,

    /// Store blob bytes per repository instead of globally.
    #[serde(default)]
    pub repository_blob_store: bool,

    /// Accept pushes of schema 1 manifests.
    #[serde(default)]
    pub schema1_enabled: bool,

    /// Allow chunked uploads.
    #[serde(default = "default_true")]
    pub resumable_digest: bool,

    /// Refuse all writes.
    #[serde(default)]
    pub read_only: bool,

    /// URL policy for foreign layers.
    #[serde(default)]
    pub manifest_urls: ManifestUrlOptions,

    /// Hex-encoded Ed25519 seed used to sign schema 1 manifests.
    #[serde(default)]
    pub schema1_signing_key: Option<String>,

    /// Descriptor cache.
    #[serde(default)]
    pub cache: Option<CacheKind>,
}

fn default_true() -> bool {
    true
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            redirect: false,
            delete_enabled: false,
            repository_blob_store: false,
            schema1_enabled: false,
            resumable_digest: true,
            read_only: false,
            manifest_urls: ManifestUrlOptions::default(),
            schema1_signing_key: None,
            cache: None,
        }
    }
}

/// Compiled URL policy for manifest references.
#[derive(Debug, Clone, Default)]
pub struct ManifestUrls {
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl ManifestUrls {
    /// Compile the configured patterns.
    pub fn new(options: &ManifestUrlOptions) -> RegistryResult<Self> {
        let compile = |pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|err| RegistryError::Config(format!("manifest url pattern: {err}")))
        };

        Ok(Self {
            allow: compile(&options.allow)?,
            deny: compile(&options.deny)?,
        })
    }

    /// Whether a URL passes both patterns. An unset pattern does not constrain.
    pub fn permits(&self, url: &str) -> bool {
        self.allow.as_ref().is_none_or(|allow| allow.is_match(url))
            && !self.deny.as_ref().is_some_and(|deny| deny.is_match(url))
    }
}

/// Immutable registry-wide settings.
#[derive(Clone)]
pub struct RegistryConfig {
    redirect: bool,
    delete_enabled: bool,
    repository_blob_store: bool,
    schema1_enabled: bool,
    resumable_digest: bool,
    read_only: bool,
    manifest_urls: ManifestUrls,
    schema1_signing_key: Option<SigningKey>,
    blob_descriptor_cache: Option<Arc<dyn BlobDescriptorCacheProvider>>,
    blob_access_controller: Option<Arc<dyn BlobAccessControllerFactory>>,
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("redirect", &self.redirect)
            .field("delete_enabled", &self.delete_enabled)
            .field("repository_blob_store", &self.repository_blob_store)
            .field("schema1_enabled", &self.schema1_enabled)
            .field("resumable_digest", &self.resumable_digest)
            .field("read_only", &self.read_only)
            .field("manifest_urls", &self.manifest_urls)
            .field("schema1_signing_key", &self.schema1_signing_key.is_some())
            .field("blob_descriptor_cache", &self.blob_descriptor_cache.is_some())
            .field("blob_access_controller", &self.blob_access_controller.is_some())
            .finish()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            redirect: false,
            delete_enabled: false,
            repository_blob_store: false,
            schema1_enabled: false,
            resumable_digest: true,
            read_only: false,
            manifest_urls: ManifestUrls::default(),
            schema1_signing_key: None,
            blob_descriptor_cache: None,
            blob_access_controller: None,
        }
    }
}

impl RegistryConfig {
    /// Start building a configuration.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Serve blobs by redirecting to the backend URL.
    pub fn redirect(&self) -> bool {
        self.redirect
    }

    /// Deletes are allowed.
    pub fn delete_enabled(&self) -> bool {
        self.delete_enabled
    }

    /// Blob bytes are stored per repository.
    pub fn repository_blob_store(&self) -> bool {
        self.repository_blob_store
    }

    /// Schema 1 manifests may be pushed.
    pub fn schema1_enabled(&self) -> bool {
        self.schema1_enabled
    }

    /// Chunked uploads are allowed.
    pub fn resumable_digest(&self) -> bool {
        self.resumable_digest
    }

    /// All writes are refused.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// URL policy for manifest references.
    pub fn manifest_urls(&self) -> &ManifestUrls {
        &self.manifest_urls
    }

    /// Key used to sign schema 1 manifests.
    pub fn schema1_signing_key(&self) -> Option<&SigningKey> {
        self.schema1_signing_key.as_ref()
    }

    /// The descriptor cache, if one is configured.
    pub fn blob_descriptor_cache(&self) -> Option<&Arc<dyn BlobDescriptorCacheProvider>> {
        self.blob_descriptor_cache.as_ref()
    }

    /// The access controller, if one is configured.
    pub fn blob_access_controller(&self) -> Option<&Arc<dyn BlobAccessControllerFactory>> {
        self.blob_access_controller.as_ref()
    }
}

/// Builder for [`RegistryConfig`].
#[derive(Default)]
pub struct RegistryConfigBuilder {
    options: RegistryOptions,
    signing_key: Option<SigningKey>,
    blob_descriptor_cache: Option<Arc<dyn BlobDescriptorCacheProvider>>,
    blob_access_controller: Option<Arc<dyn BlobAccessControllerFactory>>,
}

impl fmt::Debug for RegistryConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfigBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RegistryConfigBuilder {
    /// Start from file options.
    pub fn from_options(options: RegistryOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Serve blobs by redirecting to the backend URL.
    pub fn redirect(mut self, enabled: bool) -> Self {
        self.options.redirect = enabled;
        self
    }

    /// Allow deletes.
    pub fn delete_enabled(mut self, enabled: bool) -> Self {
        self.options.delete_enabled = enabled;
        self
    }

    /// Store blob bytes per repository.
    pub fn repository_blob_store(mut self, enabled: bool) -> Self {
        self.options.repository_blob_store = enabled;
        self
    }

    /// Accept schema 1 pushes.
    pub fn schema1_enabled(mut self, enabled: bool) -> Self {
        self.options.schema1_enabled = enabled;
        self
    }

    /// Allow chunked uploads.
    pub fn resumable_digest(mut self, enabled: bool) -> Self {
        self.options.resumable_digest = enabled;
        self
    }

    /// Refuse all writes.
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.options.read_only = enabled;
        self
    }

    /// Only permit manifest URLs matching `pattern`.
    pub fn manifest_url_allow(mut self, pattern: impl Into<String>) -> Self {
        self.options.manifest_urls.allow = Some(pattern.into());
        self
    }

    /// Reject manifest URLs matching `pattern`.
    pub fn manifest_url_deny(mut self, pattern: impl Into<String>) -> Self {
        self.options.manifest_urls.deny = Some(pattern.into());
        self
    }

    /// Sign schema 1 manifests with `key`.
    pub fn schema1_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Install a descriptor cache.
    pub fn blob_descriptor_cache(mut self, cache: Arc<dyn BlobDescriptorCacheProvider>) -> Self {
        self.blob_descriptor_cache = Some(cache);
        self
    }

    /// Install an access controller.
    pub fn blob_access_controller(
        mut self,
        controller: Arc<dyn BlobAccessControllerFactory>,
    ) -> Self {
        self.blob_access_controller = Some(controller);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> RegistryResult<RegistryConfig> {
        let options = self.options;
        let manifest_urls = ManifestUrls::new(&options.manifest_urls)?;

        let mut signing_key = match (self.signing_key, options.schema1_signing_key.as_deref()) {
            (Some(key), _) => Some(key),
            (None, Some(encoded)) => Some(decode_signing_key(encoded)?),
            (None, None) => None,
        };
        if options.schema1_enabled && signing_key.is_none() {
            tracing::info!("no schema1 signing key configured, generating one");
            signing_key = Some(SigningKey::generate(&mut rand::rngs::OsRng));
        }

        let blob_descriptor_cache = self.blob_descriptor_cache.or_else(|| {
            options.cache.map(|kind| match kind {
                CacheKind::InMemory => Arc::new(InMemoryBlobDescriptorCacheProvider::new())
                    as Arc<dyn BlobDescriptorCacheProvider>,
            })
        });

        Ok(RegistryConfig {
            redirect: options.redirect,
            delete_enabled: options.delete_enabled,
            repository_blob_store: options.repository_blob_store,
            schema1_enabled: options.schema1_enabled,
            resumable_digest: options.resumable_digest,
            read_only: options.read_only,
            manifest_urls,
            schema1_signing_key: signing_key,
            blob_descriptor_cache,
            blob_access_controller: self.blob_access_controller,
        })
    }
}

impl TryFrom<RegistryOptions> for RegistryConfig {
    type Error = RegistryError;

    fn try_from(options: RegistryOptions) -> Result<Self, Self::Error> {
        RegistryConfigBuilder::from_options(options).build()
    }
}

fn decode_signing_key(encoded: &str) -> RegistryResult<SigningKey> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|err| RegistryError::Config(format!("schema1 signing key: {err}")))?;
    let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        RegistryError::Config(format!(
            "schema1 signing key: expected 32 bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}
