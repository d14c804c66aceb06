//! Docker image manifest, schema 2

use serde::{Deserialize, Serialize};

use super::MEDIA_TYPE_SCHEMA2;
use crate::descriptor::Descriptor;
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    schema_version: u32,
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// A single-platform image: one config blob and an ordered list of layers.
#[derive(Debug, Clone)]
pub struct Schema2Manifest {
    document: Document,
    payload: Vec<u8>,
}

impl Schema2Manifest {
    /// Build and serialize a manifest.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> RegistryResult<Self> {
        let document = Document {
            schema_version: 2,
            media_type: MEDIA_TYPE_SCHEMA2.into(),
            config,
            layers,
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
        if document.media_type != MEDIA_TYPE_SCHEMA2 {
            return Err(RegistryError::ManifestInvalid(format!(
                "mediaType in manifest should be '{MEDIA_TYPE_SCHEMA2}' not '{}'",
                document.media_type
            )));
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

    /// Always [`MEDIA_TYPE_SCHEMA2`].
    pub fn media_type(&self) -> &str {
        &self.document.media_type
    }
}
