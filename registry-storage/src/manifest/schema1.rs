//! Schema 1 manifests and their JWS-style signatures
//!
//! A signed manifest is the pretty-printed manifest with a `signatures` array
//! spliced in before the closing brace. Each signature's protected header
//! records where the splice happened (`formatLength`, `formatTail`) so the
//! signed payload can be recovered byte for byte.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature as Ed25519Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::{MEDIA_TYPE_SCHEMA1_LAYER, MEDIA_TYPE_SCHEMA1_SIGNED};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

const JWS_ALGORITHM: &str = "EdDSA";

/// One layer of a schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    /// Digest of the layer blob.
    pub blob_sum: Digest,
}

/// Image history entry matching an [`FsLayer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    /// Legacy v1 image JSON.
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// The unsigned body of a schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    /// Always 1.
    pub schema_version: u32,
    /// Repository name.
    pub name: String,
    /// Tag the manifest was pushed as.
    pub tag: String,
    /// Image architecture.
    pub architecture: String,
    /// Layers, newest first.
    pub fs_layers: Vec<FsLayer>,
    /// History, one entry per layer.
    pub history: Vec<History>,
}

impl Schema1Manifest {
    /// Layers in base-first order.
    pub fn references(&self) -> Vec<Descriptor> {
        self.fs_layers
            .iter()
            .rev()
            .map(|layer| Descriptor::new(MEDIA_TYPE_SCHEMA1_LAYER, 0, layer.blob_sum.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
    #[serde(default)]
    time: String,
}

/// The signer's public key. Only Ed25519 keys are verified here; other key
/// types still parse so their manifests stay readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    crv: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    x: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JwsHeader {
    jwk: Jwk,
    alg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JwsSignature {
    header: JwsHeader,
    signature: String,
    protected: String,
}

#[derive(Debug, Deserialize)]
struct SignatureBlock {
    #[serde(default)]
    signatures: Vec<JwsSignature>,
}

/// A schema 1 manifest together with its exact serialized form.
#[derive(Debug, Clone)]
pub struct SignedManifest {
    manifest: Schema1Manifest,
    canonical: Vec<u8>,
    all: Vec<u8>,
    signatures: Vec<JwsSignature>,
}

impl SignedManifest {
    /// Wrap an unsigned manifest. It must be signed before it can be stored.
    pub fn unsigned(manifest: Schema1Manifest) -> RegistryResult<Self> {
        let canonical = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        Ok(Self {
            manifest,
            all: canonical.clone(),
            canonical,
            signatures: Vec::new(),
        })
    }

    /// Parse a schema 1 payload.
    ///
    /// The signed form is recovered from the signatures' protected headers,
    /// but nothing is verified; see [`SignedManifest::verify`].
    pub fn from_payload(payload: &[u8]) -> RegistryResult<Self> {
        let block: SignatureBlock = serde_json::from_slice(payload)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        let mut canonical: Option<Vec<u8>> = None;
        for signature in &block.signatures {
            let recovered = recover_canonical(signature, payload)?;
            match &canonical {
                Some(existing) if existing != &recovered => {
                    return Err(RegistryError::ManifestInvalid(
                        "signatures disagree on the signed payload".into(),
                    ));
                }
                Some(_) => {}
                None => canonical = Some(recovered),
            }
        }
        let canonical = canonical.unwrap_or_else(|| payload.to_vec());

        let mut manifest: serde_json::Value = serde_json::from_slice(&canonical)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        if let Some(object) = manifest.as_object_mut() {
            object.remove("signatures");
        }
        let manifest: Schema1Manifest = serde_json::from_value(manifest)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        if manifest.schema_version != 1 {
            return Err(RegistryError::ManifestInvalid(format!(
                "schema 1 manifest has schemaVersion {}",
                manifest.schema_version
            )));
        }

        Ok(Self {
            manifest,
            canonical,
            all: payload.to_vec(),
            signatures: block.signatures,
        })
    }

    /// Check every attached signature against the signed form.
    ///
    /// Fails with [`RegistryError::ManifestUnverified`] for a bad signature or
    /// a key type other than Ed25519.
    pub fn verify(&self) -> RegistryResult<()> {
        for signature in &self.signatures {
            verify_signature(signature, &self.canonical)?;
        }
        Ok(())
    }

    /// Sign with `key`, replacing any existing signatures.
    pub fn sign(self, key: &SigningKey) -> RegistryResult<Self> {
        let canonical = self.canonical;
        let format_length = format_length(&canonical)?;
        let tail = &canonical[format_length..];

        let protected = ProtectedHeader {
            format_length,
            format_tail: URL_SAFE_NO_PAD.encode(tail),
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        let protected = serde_json::to_vec(&protected)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        let protected = URL_SAFE_NO_PAD.encode(protected);

        let signature = key.sign(signing_input(&protected, &canonical).as_bytes());
        let signature = JwsSignature {
            header: JwsHeader {
                jwk: Jwk {
                    kty: "OKP".into(),
                    crv: "Ed25519".into(),
                    x: URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
                },
                alg: JWS_ALGORITHM.into(),
            },
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            protected,
        };

        let signatures = vec![signature];
        let block = serde_json::to_string_pretty(&signatures)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

        let all = splice_signatures(&canonical, format_length, &block);

        Ok(Self {
            manifest: self.manifest,
            canonical,
            all,
            signatures,
        })
    }

    /// Whether any signature is attached.
    pub fn is_signed(&self) -> bool {
        !self.signatures.is_empty()
    }

    /// The manifest body.
    pub fn manifest(&self) -> &Schema1Manifest {
        &self.manifest
    }

    /// The signed bytes, without signatures.
    pub fn canonical(&self) -> &[u8] {
        &self.canonical
    }

    /// The full serialized form, signatures included.
    pub fn payload(&self) -> &[u8] {
        &self.all
    }

    /// The media type of the serialized form.
    pub fn media_type(&self) -> &'static str {
        MEDIA_TYPE_SCHEMA1_SIGNED
    }
}

fn signing_input(protected: &str, canonical: &[u8]) -> String {
    format!("{protected}.{}", URL_SAFE_NO_PAD.encode(canonical))
}

/// Length of the manifest up to the whitespace before its closing brace.
fn format_length(canonical: &[u8]) -> RegistryResult<usize> {
    let close = canonical
        .iter()
        .rposition(|b| *b == b'}')
        .ok_or_else(|| RegistryError::ManifestInvalid("manifest is not a JSON object".into()))?;
    let length = canonical[..close]
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |last| last + 1);
    Ok(length)
}

/// Insert a serialized signature array before the manifest's closing brace.
fn splice_signatures(canonical: &[u8], format_length: usize, block: &str) -> Vec<u8> {
    let mut all = Vec::with_capacity(canonical.len() + block.len() + 32);
    all.extend_from_slice(&canonical[..format_length]);
    all.extend_from_slice(b",\n  \"signatures\": ");
    all.extend_from_slice(block.as_bytes());
    all.extend_from_slice(&canonical[format_length..]);
    all
}

/// Rebuild the signed form from a signature's protected header.
fn recover_canonical(signature: &JwsSignature, all: &[u8]) -> RegistryResult<Vec<u8>> {
    let invalid = |reason: String| RegistryError::ManifestInvalid(reason);

    let protected = URL_SAFE_NO_PAD
        .decode(&signature.protected)
        .map_err(|err| invalid(format!("protected header: {err}")))?;
    let protected: ProtectedHeader = serde_json::from_slice(&protected)
        .map_err(|err| invalid(format!("protected header: {err}")))?;
    let tail = URL_SAFE_NO_PAD
        .decode(&protected.format_tail)
        .map_err(|err| invalid(format!("format tail: {err}")))?;

    let head = all
        .get(..protected.format_length)
        .ok_or_else(|| invalid("format length exceeds payload".into()))?;
    let mut canonical = head.to_vec();
    canonical.extend_from_slice(&tail);
    Ok(canonical)
}

fn verify_signature(signature: &JwsSignature, canonical: &[u8]) -> RegistryResult<()> {
    let unverified = |reason: String| RegistryError::ManifestUnverified(reason);

    if signature.header.alg != JWS_ALGORITHM || signature.header.jwk.crv != "Ed25519" {
        return Err(unverified(format!(
            "unsupported signature algorithm {}",
            signature.header.alg
        )));
    }

    let key: [u8; 32] = URL_SAFE_NO_PAD
        .decode(&signature.header.jwk.x)
        .map_err(|err| unverified(format!("public key: {err}")))?
        .try_into()
        .map_err(|_| unverified("public key has the wrong length".into()))?;
    let key = VerifyingKey::from_bytes(&key).map_err(|err| unverified(err.to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(&signature.signature)
        .map_err(|err| unverified(format!("signature: {err}")))?;
    let sig = Ed25519Signature::from_slice(&bytes).map_err(|err| unverified(err.to_string()))?;

    key.verify(signing_input(&signature.protected, canonical).as_bytes(), &sig)
        .map_err(|err| unverified(err.to_string()))
}

/// A payload carrying a P-256 signature block in the shape other registries
/// write. The signature itself is not valid.
#[cfg(test)]
pub(crate) fn es256_signed(manifest: &Schema1Manifest) -> Vec<u8> {
    let canonical = serde_json::to_vec_pretty(manifest).unwrap();
    let format_length = format_length(&canonical).unwrap();
    let protected = serde_json::to_vec(&ProtectedHeader {
        format_length,
        format_tail: URL_SAFE_NO_PAD.encode(&canonical[format_length..]),
        time: "2016-01-01T00:00:00Z".into(),
    })
    .unwrap();

    let signatures = serde_json::json!([{
        "header": {
            "jwk": {
                "crv": "P-256",
                "kid": "LYRA:YAG2:QQKS:376F:QQXY:3UNK:SXH7:K6ES:Y5AU:XUN5:ZLVY:KBYL",
                "kty": "EC",
                "x": "Cu_UyxwLgHzE9rvlYSmvVdqYCXY42E9eNhBb0xNv0SQ",
                "y": "zUsjWJkeKQ5tv7S-hl1Tg71cd-CqnrtiiLxSi6N_yc8"
            },
            "alg": "ES256"
        },
        "signature": "m3bgdBXZYRQ4ssAbrgj8Kjl7GNgrKQvmCSY-00yzQosKi-8UBrIRrn3Iu5alj82B6u_jNrkGCjEx3TxrfT1rig",
        "protected": URL_SAFE_NO_PAD.encode(protected)
    }]);
    let block = serde_json::to_string_pretty(&signatures).unwrap();
    splice_signatures(&canonical, format_length, &block)
}
