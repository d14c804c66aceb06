//! Manifest formats and the manifest service
//!
//! Every format is a variant of [`Manifest`]; [`Manifest::unmarshal`] is the
//! single place that decides which one a payload is.

use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

mod list;
mod ocischema;
mod schema1;
mod schema2;
mod store;

pub use list::ManifestList;
pub use ocischema::OciManifest;
pub use schema1::{FsLayer, History, Schema1Manifest, SignedManifest};
#[cfg(test)]
pub(crate) use schema1::es256_signed;
pub use schema2::Schema2Manifest;
pub use store::ManifestStore;

/// Unsigned schema 1 manifest.
pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed schema 1 manifest.
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Layer referenced from a schema 1 manifest.
pub const MEDIA_TYPE_SCHEMA1_LAYER: &str =
    "application/vnd.docker.container.image.rootfs.diff+x-gtar";
/// Docker schema 2 manifest.
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image config.
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Docker layer.
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Docker layer that must be fetched from its URLs.
pub const MEDIA_TYPE_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image config.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI layer.
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI layer that may not be redistributed.
pub const MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// A parsed manifest of any supported format.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// Legacy signed schema 1.
    Schema1(SignedManifest),
    /// Docker schema 2.
    Schema2(Schema2Manifest),
    /// Docker manifest list or OCI image index.
    List(ManifestList),
    /// OCI image manifest.
    Oci(OciManifest),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

impl Manifest {
    /// Parse a payload.
    ///
    /// `content_type` is the type the payload was declared with, if any. The
    /// `mediaType` inside the payload wins; when it is absent, the declared
    /// type decides, and an OCI document is an index if it has `manifests`.
    pub fn unmarshal(content_type: Option<&str>, payload: &[u8]) -> RegistryResult<Self> {
        let versioned: Versioned = serde_json::from_slice(payload)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        match versioned.schema_version {
            1 => return Ok(Manifest::Schema1(SignedManifest::from_payload(payload)?)),
            2 => {}
            other => {
                return Err(RegistryError::ManifestInvalid(format!(
                    "unrecognized manifest schema version {other}"
                )));
            }
        }

        let declared = content_type.filter(|ct| !ct.is_empty());
        let embedded = versioned.media_type.as_deref().filter(|mt| !mt.is_empty());
        if let (Some(declared), Some(embedded)) = (declared, embedded)
            && declared != embedded
        {
            return Err(RegistryError::ManifestInvalid(format!(
                "manifest declared as '{declared}' but contains mediaType '{embedded}'"
            )));
        }

        let media_type = match embedded.or(declared) {
            Some(media_type) => media_type,
            None if versioned.manifests.is_some() => MEDIA_TYPE_OCI_INDEX,
            None => MEDIA_TYPE_OCI_MANIFEST,
        };

        match media_type {
            MEDIA_TYPE_SCHEMA2 => Ok(Manifest::Schema2(Schema2Manifest::from_payload(payload)?)),
            MEDIA_TYPE_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => Ok(Manifest::List(
                ManifestList::from_payload(media_type, payload)?,
            )),
            MEDIA_TYPE_OCI_MANIFEST => Ok(Manifest::Oci(OciManifest::from_payload(payload)?)),
            other => Err(RegistryError::ManifestInvalid(format!(
                "unrecognized manifest content type {other}"
            ))),
        }
    }

    /// The media type of the serialized form.
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1(m) => m.media_type(),
            Manifest::Schema2(m) => m.media_type(),
            Manifest::List(m) => m.media_type(),
            Manifest::Oci(m) => m.media_type(),
        }
    }

    /// The exact bytes that are stored and served.
    pub fn payload(&self) -> &[u8] {
        match self {
            Manifest::Schema1(m) => m.payload(),
            Manifest::Schema2(m) => m.payload(),
            Manifest::List(m) => m.payload(),
            Manifest::Oci(m) => m.payload(),
        }
    }

    /// Digest of [`Manifest::payload`].
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(self.payload())
    }

    /// Everything this manifest names: layers, config, or child manifests.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            Manifest::Schema1(m) => m.manifest().references(),
            Manifest::Schema2(m) => m.references(),
            Manifest::List(m) => m.references(),
            Manifest::Oci(m) => m.references(),
        }
    }
}

impl From<Schema2Manifest> for Manifest {
    fn from(value: Schema2Manifest) -> Self {
        Manifest::Schema2(value)
    }
}

impl From<OciManifest> for Manifest {
    fn from(value: OciManifest) -> Self {
        Manifest::Oci(value)
    }
}

impl From<ManifestList> for Manifest {
    fn from(value: ManifestList) -> Self {
        Manifest::List(value)
    }
}

impl From<SignedManifest> for Manifest {
    fn from(value: SignedManifest) -> Self {
        Manifest::Schema1(value)
    }
}
