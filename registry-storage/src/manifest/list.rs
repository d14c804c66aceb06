//! Manifest lists and OCI image indexes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX};
use crate::descriptor::Descriptor;
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

/// A multi-platform list of manifests, in Docker or OCI form.
#[derive(Debug, Clone)]
pub struct ManifestList {
    document: Document,
    payload: Vec<u8>,
}

impl ManifestList {
    /// A Docker manifest list.
    pub fn new(manifests: Vec<Descriptor>) -> RegistryResult<Self> {
        Self::build(MEDIA_TYPE_MANIFEST_LIST, manifests)
    }

    /// An OCI image index.
    pub fn oci_index(manifests: Vec<Descriptor>) -> RegistryResult<Self> {
        Self::build(MEDIA_TYPE_OCI_INDEX, manifests)
    }

    fn build(media_type: &str, manifests: Vec<Descriptor>) -> RegistryResult<Self> {
        let document = Document {
            schema_version: 2,
            media_type: Some(media_type.into()),
            manifests,
            annotations: None,
        };
        let payload = serde_json::to_vec_pretty(&document)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        Ok(Self { document, payload })
    }

    /// Parse a payload. `media_type` is the type the caller dispatched on.
    pub fn from_payload(media_type: &str, payload: &[u8]) -> RegistryResult<Self> {
        let mut document: Document = serde_json::from_slice(payload)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        if document.schema_version != 2 {
            return Err(RegistryError::ManifestInvalid(format!(
                "unrecognized manifest list schema version {}",
                document.schema_version
            )));
        }

        match (media_type, document.media_type.as_deref()) {
            (MEDIA_TYPE_MANIFEST_LIST, Some(MEDIA_TYPE_MANIFEST_LIST)) => {}
            (MEDIA_TYPE_OCI_INDEX, None | Some(MEDIA_TYPE_OCI_INDEX)) => {}
            (expected, actual) => {
                return Err(RegistryError::ManifestInvalid(format!(
                    "mediaType in manifest list should be '{expected}' not '{}'",
                    actual.unwrap_or_default()
                )));
            }
        }
        document.media_type = Some(media_type.to_owned());

        Ok(Self {
            document,
            payload: payload.to_vec(),
        })
    }

    /// Whether this is an OCI index rather than a Docker list.
    pub fn is_oci(&self) -> bool {
        self.media_type() == MEDIA_TYPE_OCI_INDEX
    }

    /// The referenced manifests, in order.
    pub fn manifests(&self) -> &[Descriptor] {
        &self.document.manifests
    }

    /// The referenced manifests, in order.
    pub fn references(&self) -> Vec<Descriptor> {
        self.document.manifests.clone()
    }

    /// Serialized form.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// [`MEDIA_TYPE_MANIFEST_LIST`] or [`MEDIA_TYPE_OCI_INDEX`].
    pub fn media_type(&self) -> &str {
        self.document
            .media_type
            .as_deref()
            .unwrap_or(MEDIA_TYPE_OCI_INDEX)
    }
}
