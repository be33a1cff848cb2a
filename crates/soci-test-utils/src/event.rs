//! Canned event factory.

use soci_core::descriptor::Digest;
use soci_core::event::{ImageActionEvent, ImageActionEventDetail};

/// A well-formed PUSH/SUCCESS notification for the given image.
#[must_use]
pub fn sample_event(
    account: &str,
    region: &str,
    repository: &str,
    digest: &Digest,
    tag: Option<&str>,
) -> ImageActionEvent {
    ImageActionEvent {
        version: "0".to_string(),
        id: "999cccaa-eaaa-0000-1111-123456789012".to_string(),
        detail_type: "ECR Image Action".to_string(),
        source: "aws.ecr".to_string(),
        account: account.to_string(),
        time: "2026-08-07T00:00:00Z".to_string(),
        region: region.to_string(),
        resources: Vec::new(),
        detail: ImageActionEventDetail {
            result: "SUCCESS".to_string(),
            repository_name: repository.to_string(),
            image_digest: digest.to_string(),
            action_type: "PUSH".to_string(),
            image_tag: tag.map(str::to_string),
        },
    }
}
