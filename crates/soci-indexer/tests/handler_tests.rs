//! End-to-end handler tests against the stub registry and fake builder.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use soci_artifacts::{BuildRequest, IndexBuilder};
use soci_core::context::InvocationMeta;
use soci_core::descriptor::{MEDIA_TYPE_DOCKER_IMAGE_CONFIG, MEDIA_TYPE_OCI_IMAGE_INDEX};
use soci_core::error::Error;
use soci_core::event::ImageActionEvent;
use soci_core::workspace::NoProbe;
use soci_indexer::{
    HandlerConfig, InvocationHandler, RegistryEndpoint, EXITED_EARLY_MESSAGE, SUCCESS_MESSAGE,
};
use soci_test_utils::{sample_event, RecordingBuilder, StubRegistry};

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-east-1";
const REPOSITORY: &str = "app";

struct Harness {
    stub: StubRegistry,
    builder: Arc<RecordingBuilder>,
    scratch: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Result<Self> {
        Ok(Self {
            stub: StubRegistry::start().await?,
            builder: Arc::new(RecordingBuilder::new()),
            scratch: tempfile::tempdir()?,
        })
    }

    fn config(&self) -> HandlerConfig {
        HandlerConfig {
            scratch_dir: self.scratch.path().to_path_buf(),
            registry_endpoint: Some(RegistryEndpoint {
                host: self.stub.host(),
                plain_http: true,
            }),
            ..HandlerConfig::default()
        }
    }

    fn handler(&self) -> InvocationHandler {
        let builder: Arc<dyn IndexBuilder> = self.builder.clone();
        InvocationHandler::new(self.config(), builder, Arc::new(NoProbe))
    }

    fn meta(&self) -> InvocationMeta {
        InvocationMeta {
            request_id: "test-request".to_string(),
            deadline: Utc::now() + chrono::Duration::seconds(60),
        }
    }
}

fn scratch_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[tokio::test]
async fn valid_push_notification_builds_and_pushes_the_index() -> Result<()> {
    let harness = Harness::new().await?;
    let image = harness
        .stub
        .seed_image(MEDIA_TYPE_DOCKER_IMAGE_CONFIG, &[b"layer one".to_vec(), b"layer two".to_vec()]);
    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &image.manifest_digest, Some("v1"));

    let message = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .expect("handler");

    assert_eq!(message, SUCCESS_MESSAGE);
    assert_eq!(harness.builder.invocations(), 1);
    // The fake index (config + ztoc + manifest) landed in the registry.
    assert_eq!(harness.stub.manifest_puts(), 1);
    assert!(harness.stub.blob_uploads() >= 2);
    // The workspace is gone.
    assert!(scratch_is_empty(harness.scratch.path()));
    Ok(())
}

#[tokio::test]
async fn invalid_notification_fails_before_any_network_call() -> Result<()> {
    let harness = Harness::new().await?;
    let image = harness
        .stub
        .seed_image(MEDIA_TYPE_DOCKER_IMAGE_CONFIG, &[b"layer".to_vec()]);

    let mut event = sample_event(ACCOUNT, REGION, REPOSITORY, &image.manifest_digest, None);
    event.detail.action_type = "DELETE".to_string();

    let err = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), "ECR image action event validation error");
    assert!(matches!(err.source_error(), Error::Validation { .. }));
    assert!(err.to_string().contains("detail.action-type"));

    assert_eq!(harness.stub.manifest_requests(), 0);
    assert_eq!(harness.stub.token_requests(), 0);
    assert_eq!(harness.builder.invocations(), 0);
    assert!(scratch_is_empty(harness.scratch.path()));
    Ok(())
}

#[tokio::test]
async fn first_violation_is_reported_deterministically() -> Result<()> {
    let harness = Harness::new().await?;

    let event = ImageActionEvent {
        source: "aws.s3".to_string(),
        ..ImageActionEvent::default()
    };

    let err = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .unwrap_err();
    // Every check failed; the first one in check order is the message.
    assert!(err.to_string().contains("'source' must be 'aws.ecr'"));
    Ok(())
}

#[tokio::test]
async fn non_image_manifest_exits_early_without_pulling() -> Result<()> {
    let harness = Harness::new().await?;

    let index_body = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_IMAGE_INDEX,
        "manifests": [],
    }))?;
    let digest = harness
        .stub
        .seed_raw_manifest(MEDIA_TYPE_OCI_IMAGE_INDEX, &index_body);
    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &digest, None);

    let message = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .expect("soft exit");

    assert_eq!(message, EXITED_EARLY_MESSAGE);
    // The media-type check fetched the manifest, but no layer was pulled,
    // nothing was built, nothing was pushed.
    assert_eq!(harness.stub.blob_fetches(), 0);
    assert_eq!(harness.builder.invocations(), 0);
    assert_eq!(harness.stub.manifest_puts(), 0);
    assert!(scratch_is_empty(harness.scratch.path()));
    Ok(())
}

#[tokio::test]
async fn missing_image_is_a_digest_validation_failure() -> Result<()> {
    let harness = Harness::new().await?;
    let absent = soci_core::descriptor::Digest::sha256_of(b"never pushed");
    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &absent, None);

    let err = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), "Remote image digest validation error");
    assert!(matches!(err.source_error(), Error::Pull { .. }));
    Ok(())
}

#[tokio::test]
async fn build_failure_is_stage_labelled() -> Result<()> {
    let harness = Harness::new().await?;
    let image = harness
        .stub
        .seed_image(MEDIA_TYPE_DOCKER_IMAGE_CONFIG, &[b"layer".to_vec()]);
    harness.builder.fail_with("ztoc generation failed");

    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &image.manifest_digest, None);
    let err = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), "SOCI index build error");
    assert!(matches!(err.source_error(), Error::Build { .. }));
    assert!(scratch_is_empty(harness.scratch.path()));
    Ok(())
}

#[tokio::test]
async fn capability_rejection_keeps_its_sentinel_identity() -> Result<()> {
    let harness = Harness::new().await?;
    let image = harness
        .stub
        .seed_image(MEDIA_TYPE_DOCKER_IMAGE_CONFIG, &[b"layer".to_vec()]);
    harness.stub.reject_manifest_puts(true);

    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &image.manifest_digest, None);
    let err = harness
        .handler()
        .handle(event, harness.meta())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), "SOCI index push error");
    assert!(matches!(err.source_error(), Error::RegistryCapability));
    assert!(scratch_is_empty(harness.scratch.path()));
    Ok(())
}

/// A builder that never finishes inside the test's deadline.
struct StalledBuilder;

#[async_trait]
impl IndexBuilder for StalledBuilder {
    async fn build(&self, _request: &BuildRequest<'_>) -> soci_core::error::Result<()> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(())
    }
}

#[tokio::test]
async fn deadline_fires_mid_build_and_cleans_up() -> Result<()> {
    let harness = Harness::new().await?;
    let image = harness
        .stub
        .seed_image(MEDIA_TYPE_DOCKER_IMAGE_CONFIG, &[b"layer".to_vec()]);

    let config = HandlerConfig {
        deadline_margin: Duration::ZERO,
        ..harness.config()
    };
    let handler = InvocationHandler::new(config, Arc::new(StalledBuilder), Arc::new(NoProbe));

    let event = sample_event(ACCOUNT, REGION, REPOSITORY, &image.manifest_digest, None);
    let meta = InvocationMeta {
        request_id: "deadline-test".to_string(),
        deadline: Utc::now() + chrono::Duration::seconds(1),
    };

    let err = handler.handle(event, meta).await.unwrap_err();
    assert_eq!(err.stage(), "Invocation timeout error");
    assert!(matches!(err.source_error(), Error::Timeout { .. }));

    // The guard removed the workspace; nothing was pushed.
    assert!(scratch_is_empty(harness.scratch.path()));
    assert_eq!(harness.stub.manifest_puts(), 0);
    Ok(())
}
