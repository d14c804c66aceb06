//! # Registry storage engine
//!
//! The storage engine behind an OCI / Docker distribution registry:
//!
//! - a content-addressable [`BlobStore`], either global (one copy per digest,
//!   shared by every repository) or scoped to a single repository,
//! - a link layer ([`LinkedBlobStore`]) that makes a digest visible inside a
//!   repository by writing a small link record, with fallback to the legacy
//!   link locations,
//! - per-repository [`TagStore`] and [`ManifestStore`] services, the latter
//!   dispatching over the legacy signed, schema 2, manifest list and OCI
//!   manifest formats,
//! - a mark-and-sweep [`GarbageCollector`] with its sweeping [`Vacuum`].
//!
//! A thin axum surface ([`api::router`]) exposes the push/pull endpoints and
//! the housekeeping trigger.
//!
//! ## Example
//!
//! ```no_run
//! use registry_storage::{RegistryBuilder, RegistryConfig};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .config(RegistryConfig::builder().delete_enabled(true).build()?)
//!     .build()?;
//!
//! let report = registry.garbage_collector(Default::default()).run().await?;
//! println!("marked {} digests", report.marked);
//! # Ok(())
//! # }
//! ```

pub mod api;
mod blobs;
mod cache;
mod config;
mod descriptor;
mod digest;
mod error;
mod gc;
mod linked;
pub mod manifest;
mod name;
mod paths;
mod registry;
mod tags;
mod upload;
mod vacuum;

pub use api::RegistryBuilder;
pub use blobs::{BlobScope, BlobStore};
pub use cache::{
    BlobAccessControllerFactory, BlobDescriptorCacheProvider, BlobDescriptorService,
    InMemoryBlobDescriptorCacheProvider,
};
pub use config::{
    CacheKind, ManifestUrlOptions, ManifestUrls, RegistryConfig, RegistryConfigBuilder,
    RegistryOptions,
};
pub use descriptor::{Descriptor, Platform};
pub use digest::Digest;
pub use error::{RegistryError, RegistryResult};
pub use gc::{GarbageCollector, GcOptions, GcReport, ManifestDeletion, MarkResult, MarkSet};
pub use linked::{LinkScheme, LinkedBlobStore};
pub use manifest::{Manifest, ManifestStore};
pub use name::{RepositoryName, validate_tag};
pub use registry::{Registry, Repository};
pub use tags::TagStore;
pub use upload::{BlobUpload, UploadStore};
pub use vacuum::Vacuum;
