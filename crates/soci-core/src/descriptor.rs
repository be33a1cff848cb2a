//! Content addressing: digests, descriptors, and manifest documents.
//!
//! A [`Digest`] uniquely identifies a blob or manifest; a [`Descriptor`] is
//! the (media type, digest, size) triple that names a node in a
//! content-addressable graph. Both are immutable once computed.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// Docker schema 2 manifest list media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker schema 2 manifest media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
/// OCI image index media type.
pub const MEDIA_TYPE_OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker container image config media type.
pub const MEDIA_TYPE_DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// OCI image config media type.
pub const MEDIA_TYPE_OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Config media types that identify an image (as opposed to an index or an
/// arbitrary artifact).
pub const IMAGE_CONFIG_MEDIA_TYPES: [&str; 2] =
    [MEDIA_TYPE_DOCKER_IMAGE_CONFIG, MEDIA_TYPE_OCI_IMAGE_CONFIG];

/// Returns whether `media_type` is a recognized image config type.
#[must_use]
pub fn is_image_config(media_type: &str) -> bool {
    IMAGE_CONFIG_MEDIA_TYPES.contains(&media_type)
}

/// Returns whether `media_type` is one of the manifest document types
/// (single-image manifests or multi-image index documents).
#[must_use]
pub fn is_manifest(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST
            | MEDIA_TYPE_DOCKER_MANIFEST
            | MEDIA_TYPE_OCI_IMAGE_INDEX
            | MEDIA_TYPE_OCI_MANIFEST
    )
}

/// Returns whether `media_type` is a multi-image index document (a Docker
/// manifest list or an OCI image index).
#[must_use]
pub fn is_index(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST | MEDIA_TYPE_OCI_IMAGE_INDEX
    )
}

/// `algorithm:hex` content digest, hex part at least 32 characters.
static DIGEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[A-Fa-f0-9]{32,}$")
        .expect("digest pattern")
});

/// A content digest in `algorithm:hex` form.
///
/// Validated on construction; globally unique per content, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses a digest, validating the `algorithm:hex` shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when the input does not match the digest
    /// pattern.
    pub fn parse(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        if DIGEST_PATTERN.is_match(&raw) {
            Ok(Self(raw))
        } else {
            Err(Error::validation(format!("invalid content digest: {raw}")))
        }
    }

    /// Computes the `sha256:<hex>` digest of `bytes`.
    #[must_use]
    pub fn sha256_of(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(hash)))
    }

    /// Returns the digest algorithm (the part before the colon).
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(alg, _)| alg)
    }

    /// Returns the encoded hash (the part after the colon).
    #[must_use]
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, hex)| hex)
    }

    /// Returns the full `algorithm:hex` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// A (media type, digest, size) triple naming a manifest, blob, or derived
/// artifact in a content-addressable graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(rename = "mediaType")]
    pub media_type: String,

    /// Content digest of the referenced content.
    pub digest: Digest,

    /// Size of the referenced content in bytes.
    pub size: u64,
}

impl Descriptor {
    /// Creates a descriptor for `bytes` with the given media type.
    #[must_use]
    pub fn for_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::sha256_of(bytes),
            size: bytes.len() as u64,
        }
    }
}

/// A single-image manifest document: a config descriptor plus layer
/// descriptors.
///
/// Index documents (manifest lists) do not parse into this shape; they have
/// no `config` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest schema version (2 for every format we accept).
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Media type of the manifest document itself, when embedded.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Descriptor of the image config blob.
    pub config: Descriptor,

    /// Descriptors of the layer blobs, in order.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Returns every descriptor this manifest references (config first, then
    /// layers in order).
    #[must_use]
    pub fn referenced(&self) -> Vec<&Descriptor> {
        let mut refs = Vec::with_capacity(1 + self.layers.len());
        refs.push(&self.config);
        refs.extend(self.layers.iter());
        refs
    }
}

/// A reference to content in a repository: either a digest or a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A content digest reference (`algorithm:hex`).
    Digest(Digest),
    /// A tag reference.
    Tag(String),
}

impl Reference {
    /// Returns the digest when this reference is one.
    #[must_use]
    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Self::Digest(digest) => Some(digest),
            Self::Tag(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(digest) => digest.fmt(f),
            Self::Tag(tag) => f.write_str(tag),
        }
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_digest() {
        let digest = Digest::parse(
            "sha256:978f5f8049d3d0de30a7fc3892aafdfb323451bf682170d99154230ddefbe91e",
        )
        .expect("parse");
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.encoded().len(), 64);
    }

    #[test]
    fn rejects_malformed_digests() {
        // No algorithm.
        assert!(Digest::parse(":978f5f8049d3d0de30a7fc3892aafdfb").is_err());
        // Hex too short.
        assert!(Digest::parse("sha256:abcd1234").is_err());
        // Non-hex payload.
        assert!(Digest::parse("sha256:zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
        // Empty.
        assert!(Digest::parse("").is_err());
    }

    #[test]
    fn sha256_of_matches_known_value() {
        // sha256 of the empty string.
        let digest = Digest::sha256_of(b"");
        assert_eq!(
            digest.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn manifest_parses_docker_wire_format() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 1469
            },
            "layers": [
                {
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "digest": "sha256:2408cc74d12b6cd092bb8b516ba7d5e290f485d3eb9672efc00f0583730179e8",
                    "size": 2479
                }
            ]
        }"#;

        let manifest: Manifest = serde_json::from_str(raw).expect("parse manifest");
        assert_eq!(manifest.schema_version, 2);
        assert!(is_image_config(&manifest.config.media_type));
        assert_eq!(manifest.referenced().len(), 2);
    }

    #[test]
    fn media_type_policy() {
        assert!(is_image_config(MEDIA_TYPE_DOCKER_IMAGE_CONFIG));
        assert!(is_image_config(MEDIA_TYPE_OCI_IMAGE_CONFIG));
        assert!(!is_image_config(MEDIA_TYPE_OCI_MANIFEST));

        assert!(is_manifest(MEDIA_TYPE_DOCKER_MANIFEST));
        assert!(is_manifest(MEDIA_TYPE_OCI_IMAGE_INDEX));
        assert!(!is_manifest(MEDIA_TYPE_OCI_IMAGE_CONFIG));

        assert!(is_index(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(!is_index(MEDIA_TYPE_DOCKER_MANIFEST));
    }
}
