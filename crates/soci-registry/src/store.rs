//! Local OCI-layout content store.
//!
//! Blobs are stored under `blobs/<algorithm>/<encoded>`, deduplicated by
//! digest. The `index.json` document lists the manifests known to the store
//! (the pulled image plus whatever the builder writes). The store lives
//! inside a single invocation's workspace and is never shared.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use soci_core::descriptor::{Descriptor, Digest};
use soci_core::error::{Error, Result};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// The `index.json` document of an OCI image layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LayoutIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// A content-addressed blob store in OCI image-layout form.
#[derive(Debug)]
pub struct OciStore {
    root: PathBuf,
}

impl OciStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the layout directories or marker file
    /// cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blob_root = root.join("blobs").join("sha256");
        fs::create_dir_all(&blob_root).await.map_err(|e| {
            Error::storage_with_source(
                format!("failed to create store at {}", root.display()),
                e,
            )
        })?;

        let layout_marker = root.join(OCI_LAYOUT_FILE);
        if !layout_marker.exists() {
            fs::write(&layout_marker, OCI_LAYOUT_CONTENT)
                .await
                .map_err(|e| Error::storage_with_source("failed to write oci-layout marker", e))?;
        }

        Ok(Self { root })
    }

    /// Returns the store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the on-disk path of a blob.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    /// Returns whether the store holds a blob with this digest.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Writes `bytes` as a content-addressed blob and returns its digest.
    ///
    /// Writing content that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O failure.
    pub async fn write_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256_of(bytes);
        let path = self.blob_path(&digest);
        if !path.exists() {
            fs::write(&path, bytes).await.map_err(|e| {
                Error::storage_with_source(format!("failed to write blob {digest}"), e)
            })?;
        }
        Ok(digest)
    }

    /// Writes `bytes` as a blob, verifying it hashes to `expected`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the content does not match the expected
    /// digest (corrupt or substituted content) or on I/O failure.
    pub async fn write_blob_verified(&self, expected: &Digest, bytes: &[u8]) -> Result<()> {
        if expected.algorithm() != "sha256" {
            return Err(Error::storage(format!(
                "unsupported digest algorithm: {}",
                expected.algorithm()
            )));
        }

        let actual = Digest::sha256_of(bytes);
        if &actual != expected {
            return Err(Error::storage(format!(
                "digest mismatch: expected {expected}, content hashes to {actual}"
            )));
        }

        self.write_blob(bytes).await.map(|_| ())
    }

    /// Reads a blob's full content.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the blob is absent or unreadable.
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).await.map_err(|e| {
            Error::storage_with_source(format!("failed to read blob {digest}"), e)
        })
    }

    /// Records a manifest descriptor in the layout's `index.json`.
    ///
    /// Recording the same digest twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the index cannot be read or written.
    pub async fn add_manifest(&self, descriptor: &Descriptor) -> Result<()> {
        let mut index = self.read_index().await?;
        if index.manifests.iter().any(|m| m.digest == descriptor.digest) {
            return Ok(());
        }
        index.manifests.push(descriptor.clone());
        self.write_index(&index).await
    }

    /// Returns the manifest descriptors recorded in `index.json`, in
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the index cannot be read.
    pub async fn manifests(&self) -> Result<Vec<Descriptor>> {
        Ok(self.read_index().await?.manifests)
    }

    async fn read_index(&self) -> Result<LayoutIndex> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(LayoutIndex {
                schema_version: 2,
                manifests: Vec::new(),
            });
        }
        let raw = fs::read(&path)
            .await
            .map_err(|e| Error::storage_with_source("failed to read index.json", e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::storage_with_source("failed to parse index.json", e))
    }

    async fn write_index(&self, index: &LayoutIndex) -> Result<()> {
        let raw = serde_json::to_vec(index)
            .map_err(|e| Error::storage_with_source("failed to encode index.json", e))?;
        fs::write(self.root.join(INDEX_FILE), raw)
            .await
            .map_err(|e| Error::storage_with_source("failed to write index.json", e))
    }
}
