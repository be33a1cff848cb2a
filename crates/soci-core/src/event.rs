//! Inbound ECR image action event: wire shape and validation.
//!
//! Validation is aggregate-then-report-first: every check runs, violations
//! accumulate in a fixed order, and the caller surfaces the first one as the
//! primary failure message. Repeated deliveries of the same bad event
//! therefore always report the same message.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `detail` block of an ECR image action event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageActionEventDetail {
    /// Action result, `"SUCCESS"` for events we act on.
    #[serde(default)]
    pub result: String,

    /// Repository the image was pushed to.
    #[serde(rename = "repository-name", default)]
    pub repository_name: String,

    /// Digest of the pushed image manifest.
    #[serde(rename = "image-digest", default)]
    pub image_digest: String,

    /// Action type, `"PUSH"` for events we act on.
    #[serde(rename = "action-type", default)]
    pub action_type: String,

    /// Tag of the pushed image, when one was supplied.
    #[serde(rename = "image-tag", default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
}

/// An ECR image action notification as delivered by EventBridge.
///
/// Only `account`, `region`, and the `detail` repository/digest/tag feed the
/// pipeline; the remaining fields are validated but not otherwise consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageActionEvent {
    /// Event format version.
    #[serde(default)]
    pub version: String,

    /// Event id.
    #[serde(default)]
    pub id: String,

    /// Event detail type, `"ECR Image Action"` for events we act on.
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,

    /// Event source, `"aws.ecr"` for events we act on.
    #[serde(default)]
    pub source: String,

    /// AWS account id that owns the repository.
    #[serde(default)]
    pub account: String,

    /// Event timestamp, as delivered.
    #[serde(default)]
    pub time: String,

    /// AWS region of the repository.
    #[serde(default)]
    pub region: String,

    /// Resource ARNs attached to the event.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Action detail.
    #[serde(default)]
    pub detail: ImageActionEventDetail,
}

static ACCOUNT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{12}$").expect("account id pattern"));

static REPOSITORY_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9]+(?:[._-][a-z0-9]+)*/)*[a-z0-9]+(?:[._-][a-z0-9]+)*$")
        .expect("repository name pattern")
});

static IMAGE_DIGEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[A-Fa-f0-9]{32,}$")
        .expect("image digest pattern")
});

static IMAGE_TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("image tag pattern"));

/// A single validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// `source` is not `"aws.ecr"`.
    WrongSource,
    /// `account` is empty.
    EmptyAccount,
    /// `detail-type` is not `"ECR Image Action"`.
    WrongDetailType,
    /// `detail.action-type` is not `"PUSH"`.
    WrongActionType,
    /// `detail.result` is not `"SUCCESS"`.
    WrongResult,
    /// `detail.repository-name` is empty.
    EmptyRepositoryName,
    /// `detail.image-digest` is empty.
    EmptyImageDigest,
    /// `account` is not a 12-digit account id.
    InvalidAccount,
    /// `detail.repository-name` does not match the repository name pattern.
    InvalidRepositoryName,
    /// `detail.image-digest` does not match the digest pattern.
    InvalidImageDigest,
    /// `detail.image-tag` is present but does not match the tag pattern.
    InvalidImageTag,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::WrongSource => "the event's 'source' must be 'aws.ecr'",
            Self::EmptyAccount => "the event's 'account' must not be empty",
            Self::WrongDetailType => "the event's 'detail-type' must be 'ECR Image Action'",
            Self::WrongActionType => "the event's 'detail.action-type' must be 'PUSH'",
            Self::WrongResult => "the event's 'detail.result' must be 'SUCCESS'",
            Self::EmptyRepositoryName => "the event's 'detail.repository-name' must not be empty",
            Self::EmptyImageDigest => "the event's 'detail.image-digest' must not be empty",
            Self::InvalidAccount => "the event's 'account' must be a valid AWS account ID",
            Self::InvalidRepositoryName => {
                "the event's 'detail.repository-name' must be a valid repository name"
            }
            Self::InvalidImageDigest => {
                "the event's 'detail.image-digest' must be a valid image digest"
            }
            Self::InvalidImageTag => {
                "the event's 'detail.image-tag' must be empty or a valid image tag"
            }
        };
        f.write_str(message)
    }
}

/// The full ordered violation list for one event.
///
/// Always non-empty. `Display` renders the FIRST violation: all checks run,
/// but one deterministic primary message is reported.
#[derive(Debug, Clone)]
pub struct Violations(Vec<Violation>);

impl Violations {
    /// Returns the first violation in check order.
    #[must_use]
    pub fn first(&self) -> Violation {
        self.0[0]
    }

    /// Returns every violation in check order.
    #[must_use]
    pub fn all(&self) -> &[Violation] {
        &self.0
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.first().fmt(f)
    }
}

impl std::error::Error for Violations {}

/// Validates an inbound event, running every check and aggregating the
/// violations in order.
///
/// # Errors
///
/// Returns the ordered, non-empty violation list when any check fails.
pub fn validate(event: &ImageActionEvent) -> Result<(), Violations> {
    let mut violations = Vec::new();

    if event.source != "aws.ecr" {
        violations.push(Violation::WrongSource);
    }
    if event.account.is_empty() {
        violations.push(Violation::EmptyAccount);
    }
    if event.detail_type != "ECR Image Action" {
        violations.push(Violation::WrongDetailType);
    }
    if event.detail.action_type != "PUSH" {
        violations.push(Violation::WrongActionType);
    }
    if event.detail.result != "SUCCESS" {
        violations.push(Violation::WrongResult);
    }
    if event.detail.repository_name.is_empty() {
        violations.push(Violation::EmptyRepositoryName);
    }
    if event.detail.image_digest.is_empty() {
        violations.push(Violation::EmptyImageDigest);
    }

    if !ACCOUNT_ID_PATTERN.is_match(&event.account) {
        violations.push(Violation::InvalidAccount);
    }
    if !REPOSITORY_NAME_PATTERN.is_match(&event.detail.repository_name) {
        violations.push(Violation::InvalidRepositoryName);
    }
    if !IMAGE_DIGEST_PATTERN.is_match(&event.detail.image_digest) {
        violations.push(Violation::InvalidImageDigest);
    }

    // A missing or empty tag is valid.
    if let Some(tag) = event.detail.image_tag.as_deref() {
        if !tag.is_empty() && !IMAGE_TAG_PATTERN.is_match(tag) {
            violations.push(Violation::InvalidImageTag);
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Violations(violations))
    }
}

/// Derives the registry URL for the event's account and region.
///
/// China-partition regions (prefixed `cn`) live under `.amazonaws.com.cn`.
#[must_use]
pub fn registry_url(event: &ImageActionEvent) -> String {
    let domain = if event.region.starts_with("cn") {
        ".amazonaws.com.cn"
    } else {
        ".amazonaws.com"
    };
    format!("{}.dkr.ecr.{}{domain}", event.account, event.region)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_event() -> ImageActionEvent {
        ImageActionEvent {
            version: "0".to_string(),
            id: "999cccaa-eaaa-0000-1111-123456789012".to_string(),
            detail_type: "ECR Image Action".to_string(),
            source: "aws.ecr".to_string(),
            account: "123456789012".to_string(),
            time: "2016-12-16T20:43:05Z".to_string(),
            region: "us-east-1".to_string(),
            resources: Vec::new(),
            detail: ImageActionEventDetail {
                result: "SUCCESS".to_string(),
                repository_name: "my-org/my-app".to_string(),
                image_digest:
                    "sha256:978f5f8049d3d0de30a7fc3892aafdfb323451bf682170d99154230ddefbe91e"
                        .to_string(),
                action_type: "PUSH".to_string(),
                image_tag: Some("hello-world".to_string()),
            },
        }
    }

    #[test]
    fn accepts_valid_event() {
        assert!(validate(&valid_event()).is_ok());
    }

    #[test]
    fn accepts_missing_tag() {
        let mut event = valid_event();
        event.detail.image_tag = None;
        assert!(validate(&event).is_ok());

        event.detail.image_tag = Some(String::new());
        assert!(validate(&event).is_ok());
    }

    #[test]
    fn rejects_wrong_source() {
        let mut event = valid_event();
        event.source = "aws.s3".to_string();
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::WrongSource);
    }

    #[test]
    fn rejects_non_push_action() {
        let mut event = valid_event();
        event.detail.action_type = "DELETE".to_string();
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::WrongActionType);
    }

    #[test]
    fn rejects_failed_result() {
        let mut event = valid_event();
        event.detail.result = "FAILURE".to_string();
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::WrongResult);
    }

    #[test]
    fn rejects_missing_repository_and_digest() {
        let mut event = valid_event();
        event.detail.repository_name = String::new();
        event.detail.image_digest = String::new();
        let violations = validate(&event).unwrap_err();

        // The first violation is the empty repository name; the digest and
        // pattern violations follow in check order.
        assert_eq!(violations.first(), Violation::EmptyRepositoryName);
        assert!(violations.all().contains(&Violation::EmptyImageDigest));
        assert!(violations.all().contains(&Violation::InvalidRepositoryName));
        assert!(violations.all().contains(&Violation::InvalidImageDigest));
    }

    #[test]
    fn rejects_bad_account_id() {
        let mut event = valid_event();
        event.account = "12345".to_string();
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::InvalidAccount);

        event.account = "12345678901a".to_string();
        assert!(validate(&event).is_err());
    }

    #[test]
    fn rejects_bad_repository_names() {
        for name in ["UPPER", "-leading", "a//b", "trailing-/"] {
            let mut event = valid_event();
            event.detail.repository_name = name.to_string();
            let violations = validate(&event).unwrap_err();
            assert_eq!(violations.first(), Violation::InvalidRepositoryName, "{name}");
        }
    }

    #[test]
    fn rejects_bad_digests_and_tags() {
        let mut event = valid_event();
        event.detail.image_digest = "sha256:tooshort".to_string();
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::InvalidImageDigest);

        let mut event = valid_event();
        event.detail.image_tag = Some(".starts-with-dot".to_string());
        let violations = validate(&event).unwrap_err();
        assert_eq!(violations.first(), Violation::InvalidImageTag);

        let mut event = valid_event();
        event.detail.image_tag = Some("a".repeat(129));
        assert!(validate(&event).is_err());
    }

    #[test]
    fn derives_standard_registry_url() {
        let event = valid_event();
        assert_eq!(
            registry_url(&event),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn derives_china_partition_registry_url() {
        let mut event = valid_event();
        event.region = "cn-north-1".to_string();
        assert_eq!(
            registry_url(&event),
            "123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn"
        );
    }

    #[test]
    fn deserializes_kebab_case_wire_format() {
        let raw = r#"{
            "version": "0",
            "id": "999cccaa-eaaa-0000-1111-123456789012",
            "detail-type": "ECR Image Action",
            "source": "aws.ecr",
            "account": "123456789012",
            "time": "2016-12-16T20:43:05Z",
            "region": "us-east-1",
            "resources": [],
            "detail": {
                "result": "SUCCESS",
                "repository-name": "repository_name",
                "image-digest": "sha256:978f5f8049d3d0de30a7fc3892aafdfb323451bf682170d99154230ddefbe91e",
                "action-type": "PUSH",
                "image-tag": "hello-world"
            }
        }"#;

        let event: ImageActionEvent = serde_json::from_str(raw).expect("parse event");
        assert_eq!(event.detail.repository_name, "repository_name");
        assert_eq!(event.detail.image_tag.as_deref(), Some("hello-world"));
        assert!(validate(&event).is_ok());
    }
}
