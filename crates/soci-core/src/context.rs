//! Typed per-invocation context.
//!
//! One `InvocationContext` is created per validated event and threaded by
//! reference through the pipeline. It replaces an ambient key/value bag with
//! compile-time field guarantees, and is never shared across invocations.

use chrono::{DateTime, Utc};
use tracing::field;

use crate::descriptor::Digest;
use crate::error::Error;
use crate::event::{self, ImageActionEvent};

/// Request-scoped metadata supplied by the hosting environment.
#[derive(Debug, Clone)]
pub struct InvocationMeta {
    /// Request id assigned to this invocation.
    pub request_id: String,

    /// The environment's enforced invocation deadline.
    pub deadline: DateTime<Utc>,
}

/// Mutable request-scoped context, enriched as the pipeline progresses.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Request id assigned to this invocation.
    pub request_id: String,

    /// The environment's enforced invocation deadline.
    pub deadline: DateTime<Utc>,

    /// Registry host derived from the event's account and region.
    pub registry_url: String,

    /// Repository the image was pushed to.
    pub repository: String,

    /// Digest of the pushed image manifest.
    pub image_digest: Digest,

    /// Tag of the pushed image, when one was supplied.
    pub image_tag: Option<String>,

    /// Digest of the built index artifact, once known.
    pub index_digest: Option<Digest>,
}

impl InvocationContext {
    /// Builds a context from an already-validated event.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when the event's digest does not parse;
    /// callers are expected to have run [`event::validate`] first, which
    /// makes this unreachable in practice.
    pub fn from_event(event: &ImageActionEvent, meta: InvocationMeta) -> Result<Self, Error> {
        let image_digest = Digest::parse(event.detail.image_digest.clone())?;
        let image_tag = event
            .detail
            .image_tag
            .clone()
            .filter(|tag| !tag.is_empty());

        Ok(Self {
            request_id: meta.request_id,
            deadline: meta.deadline,
            registry_url: event::registry_url(event),
            repository: event.detail.repository_name.clone(),
            image_digest,
            image_tag,
            index_digest: None,
        })
    }

    /// Creates the tracing span carrying this invocation's fields.
    ///
    /// `index_digest` is declared empty and recorded via
    /// [`record_index_digest`](Self::record_index_digest) once the build has
    /// produced it.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "invocation",
            request_id = %self.request_id,
            registry_url = %self.registry_url,
            repository = %self.repository,
            image_digest = %self.image_digest,
            image_tag = self.image_tag.as_deref().unwrap_or(""),
            index_digest = field::Empty,
        )
    }

    /// Records the built index digest on the context and the given span.
    pub fn record_index_digest(&mut self, span: &tracing::Span, digest: Digest) {
        span.record("index_digest", field::display(&digest));
        self.index_digest = Some(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ImageActionEventDetail;

    fn event() -> ImageActionEvent {
        ImageActionEvent {
            detail_type: "ECR Image Action".to_string(),
            source: "aws.ecr".to_string(),
            account: "123456789012".to_string(),
            region: "eu-west-1".to_string(),
            detail: ImageActionEventDetail {
                result: "SUCCESS".to_string(),
                repository_name: "team/app".to_string(),
                image_digest:
                    "sha256:978f5f8049d3d0de30a7fc3892aafdfb323451bf682170d99154230ddefbe91e"
                        .to_string(),
                action_type: "PUSH".to_string(),
                image_tag: Some("v1".to_string()),
            },
            ..ImageActionEvent::default()
        }
    }

    #[test]
    fn builds_context_from_event() {
        let meta = InvocationMeta {
            request_id: "req-1".to_string(),
            deadline: Utc::now(),
        };
        let ctx = InvocationContext::from_event(&event(), meta).expect("context");

        assert_eq!(ctx.repository, "team/app");
        assert_eq!(
            ctx.registry_url,
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com"
        );
        assert_eq!(ctx.image_tag.as_deref(), Some("v1"));
        assert!(ctx.index_digest.is_none());
    }

    #[test]
    fn empty_tag_is_dropped() {
        let mut raw = event();
        raw.detail.image_tag = Some(String::new());
        let meta = InvocationMeta {
            request_id: "req-2".to_string(),
            deadline: Utc::now(),
        };
        let ctx = InvocationContext::from_event(&raw, meta).expect("context");
        assert!(ctx.image_tag.is_none());
    }
}
