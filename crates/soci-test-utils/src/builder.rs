//! Recording fake builder.
//!
//! Fulfills the builder contract without any real index construction: writes
//! a small, pushable index manifest into the store, records it in the
//! artifacts database, and counts invocations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use soci_artifacts::{BuildRequest, IndexBuilder};
use soci_core::descriptor::{Descriptor, MEDIA_TYPE_OCI_MANIFEST};
use soci_core::error::{Error, Result};
use soci_registry::OciStore;

const FAKE_INDEX_CONFIG_MEDIA_TYPE: &str = "application/vnd.amazon.soci.index.config.v1+json";
const FAKE_ZTOC_MEDIA_TYPE: &str = "application/octet-stream";

/// An [`IndexBuilder`] that fabricates a minimal index artifact.
#[derive(Debug, Default)]
pub struct RecordingBuilder {
    invocations: AtomicUsize,
    fail_with: Mutex<Option<String>>,
}

impl RecordingBuilder {
    /// Creates a builder that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent build fail with this message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().expect("fail lock") = Some(message.into());
    }

    /// Number of build invocations so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Acquire)
    }
}

#[async_trait]
impl IndexBuilder for RecordingBuilder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::AcqRel);

        if let Some(message) = self.fail_with.lock().expect("fail lock").clone() {
            return Err(Error::build(message));
        }

        let store = OciStore::open(request.store_root).await?;

        let config_bytes = br#"{"builder":"recording"}"#.to_vec();
        let config_digest = store.write_blob(&config_bytes).await?;

        let ztoc_bytes = format!("fake ztoc for {}", request.image).into_bytes();
        let ztoc_digest = store.write_blob(&ztoc_bytes).await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": FAKE_INDEX_CONFIG_MEDIA_TYPE,
                "digest": config_digest.to_string(),
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": FAKE_ZTOC_MEDIA_TYPE,
                "digest": ztoc_digest.to_string(),
                "size": ztoc_bytes.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| Error::build_with_source("failed to encode fake index", e))?;

        let descriptor = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes);
        store.write_blob(&manifest_bytes).await?;
        store.add_manifest(&descriptor).await?;

        let db = soci_artifacts::ArtifactsDb::open(request.artifacts_db_path)?;
        db.record(
            &request.image.digest,
            &request.options.platform.to_string(),
            &descriptor,
        )?;

        Ok(())
    }
}
