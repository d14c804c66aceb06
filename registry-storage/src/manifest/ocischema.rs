//! OCI image manifest

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::MEDIA_TYPE_OCI_MANIFEST;
use crate::descriptor::Descriptor;
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

/// An OCI image manifest.
#[derive(Debug, Clone)]
pub struct OciManifest {
    document: Document,
    payload: Vec<u8>,
}

impl OciManifest {
    /// Build and serialize a manifest.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> RegistryResult<Self> {
        let document = Document {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.into()),
            config,
            layers,
            annotations: None,
        };
        let payload = serde_json::to_vec_pretty(&document)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        Ok(Self { document, payload })
    }

    /// Parse a payload, keeping its exact bytes.
    pub fn from_payload(payload: &[u8]) -> RegistryResult<Self> {
        let document: Document = serde_json::from_slice(payload)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        if document.schema_version != 2 {
            return Err(RegistryError::ManifestInvalid(format!(
                "unrecognized manifest schema version {}",
                document.schema_version
            )));
        }
        match document.media_type.as_deref() {
            None | Some(MEDIA_TYPE_OCI_MANIFEST) => {}
            Some(other) => {
                return Err(RegistryError::ManifestInvalid(format!(
                    "if present, mediaType in manifest should be '{MEDIA_TYPE_OCI_MANIFEST}' not '{other}'"
                )));
            }
        }

        Ok(Self {
            document,
            payload: payload.to_vec(),
        })
    }

    /// The image config blob.
    pub fn config(&self) -> &Descriptor {
        &self.document.config
    }

    /// Layers, base first.
    pub fn layers(&self) -> &[Descriptor] {
        &self.document.layers
    }

    /// Manifest annotations.
    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.document.annotations.as_ref()
    }

    /// Config, then layers.
    pub fn references(&self) -> Vec<Descriptor> {
        std::iter::once(&self.document.config)
            .chain(&self.document.layers)
            .cloned()
            .collect()
    }

    /// Serialized form.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Always [`MEDIA_TYPE_OCI_MANIFEST`].
    pub fn media_type(&self) -> &str {
        MEDIA_TYPE_OCI_MANIFEST
    }
}
