//! The invocation pipeline.
//!
//! Validate -> workspace -> arm deadline guard -> authenticate -> media-type
//! check -> pull -> build -> push -> disarm -> cleanup. Strictly sequential;
//! the guard is the only concurrent task. Every stage failure is wrapped
//! with a stage label and returned immediately. No stage is retried;
//! redelivery is the notification layer's business.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use soci_artifacts::{ArtifactsDb, BuildOptions, BuildRequest, ImageRef, IndexBuilder};
use soci_core::context::{InvocationContext, InvocationMeta};
use soci_core::descriptor::Reference;
use soci_core::error::Error;
use soci_core::event::{self, ImageActionEvent};
use soci_core::workspace::{FreeSpace, Workspace};
use soci_registry::{ImageManifestCheck, OciStore, Registry, RegistryConfig};

use crate::deadline::{DeadlineGuard, DEFAULT_DEADLINE_MARGIN};

/// Response for a completed build-and-push.
pub const SUCCESS_MESSAGE: &str = "Successfully built and pushed SOCI index";

/// Response when the pushed digest is not an image manifest. A soft exit:
/// nothing was pulled or built, and the invocation did not fail.
pub const EXITED_EARLY_MESSAGE: &str = "Exited early due to manifest validation error";

const STAGE_EVENT_VALIDATION: &str = "ECR image action event validation error";
const STAGE_WORKSPACE_CREATE: &str = "Workspace create error";
const STAGE_REGISTRY_INIT: &str = "Remote registry initialization error";
const STAGE_DIGEST_VALIDATION: &str = "Remote image digest validation error";
const STAGE_STORE_INIT: &str = "Local store initialization error";
const STAGE_ARTIFACTS_DB_INIT: &str = "Artifacts database initialization error";
const STAGE_PULL: &str = "Image pull error";
const STAGE_BUILD: &str = "SOCI index build error";
const STAGE_PUSH: &str = "SOCI index push error";
const STAGE_TIMEOUT: &str = "Invocation timeout error";

/// Default scratch volume for workspaces.
const DEFAULT_SCRATCH_DIR: &str = "/tmp";

/// Images up to 6 GB are supported; warn when the scratch volume holds less.
const DEFAULT_MIN_FREE_BYTES: u64 = 6_000_000_000;

/// Registry endpoint override, for registries whose host differs from the
/// event-derived URL (stubs, mirrors).
#[derive(Debug, Clone)]
pub struct RegistryEndpoint {
    /// Registry host (no scheme).
    pub host: String,
    /// Use plain HTTP. Local stubs only.
    pub plain_http: bool,
}

/// Orchestrator configuration, passed in at construction.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Volume to create workspaces under.
    pub scratch_dir: PathBuf,

    /// Safety margin before the enforced deadline at which the guard fires.
    pub deadline_margin: Duration,

    /// Minimum free space expected on the scratch volume.
    pub min_free_bytes: u64,

    /// Overrides the event-derived registry URL when set.
    pub registry_endpoint: Option<RegistryEndpoint>,

    /// Options handed to the index builder.
    pub build_options: BuildOptions,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            deadline_margin: DEFAULT_DEADLINE_MARGIN,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            registry_endpoint: None,
            build_options: BuildOptions::default(),
        }
    }
}

/// A stage-labelled pipeline failure.
///
/// `Display` is `<stage label>: <underlying error>`; the taxonomy value
/// stays reachable through [`source`](Self::source) so callers can
/// distinguish, e.g., a capability rejection from a transport fault.
#[derive(Debug)]
pub struct HandlerError {
    stage: &'static str,
    source: Error,
}

impl HandlerError {
    /// The stage label.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// The underlying taxonomy error.
    #[must_use]
    pub fn source_error(&self) -> &Error {
        &self.source
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Logs and wraps a stage failure.
fn stage_error(stage: &'static str, source: Error) -> HandlerError {
    tracing::error!(error = %source, "{stage}");
    HandlerError { stage, source }
}

/// The invocation orchestrator.
pub struct InvocationHandler {
    config: HandlerConfig,
    builder: Arc<dyn IndexBuilder>,
    free_space: Arc<dyn FreeSpace>,
}

impl InvocationHandler {
    /// Creates a handler with the given collaborators.
    pub fn new(
        config: HandlerConfig,
        builder: Arc<dyn IndexBuilder>,
        free_space: Arc<dyn FreeSpace>,
    ) -> Self {
        Self {
            config,
            builder,
            free_space,
        }
    }

    /// Runs one invocation end to end, returning the human-readable status
    /// message.
    ///
    /// # Errors
    ///
    /// Returns the stage-labelled failure of the first stage that failed, or
    /// the timeout error when the deadline guard fired first.
    pub async fn handle(
        &self,
        event: ImageActionEvent,
        meta: InvocationMeta,
    ) -> Result<String, HandlerError> {
        if let Err(violations) = event::validate(&event) {
            return Err(stage_error(
                STAGE_EVENT_VALIDATION,
                Error::validation(violations.first().to_string()),
            ));
        }

        let deadline = meta.deadline;
        let mut ctx = InvocationContext::from_event(&event, meta)
            .map_err(|e| stage_error(STAGE_EVENT_VALIDATION, e))?;
        let span = ctx.span();

        if let Some(free) = self.free_space.available_bytes(&self.config.scratch_dir) {
            tracing::info!(parent: &span, free_bytes = free, "scratch volume free space");
            if free < self.config.min_free_bytes {
                tracing::warn!(
                    parent: &span,
                    free_bytes = free,
                    min_free_bytes = self.config.min_free_bytes,
                    "scratch volume is below the supported image size"
                );
            }
        }

        let workspace = Arc::new(
            Workspace::create(&self.config.scratch_dir, &ctx.request_id)
                .map_err(|e| stage_error(STAGE_WORKSPACE_CREATE, e))?,
        );

        let budget_secs = u64::try_from((deadline - Utc::now()).num_seconds().max(0)).unwrap_or(0);
        let mut guard = DeadlineGuard::arm(
            deadline,
            self.config.deadline_margin,
            Arc::clone(&workspace),
        );

        let result = {
            let pipeline = self
                .run_pipeline(&mut ctx, &span, &workspace)
                .instrument(span.clone());
            tokio::pin!(pipeline);
            tokio::select! {
                result = &mut pipeline => result,
                _ = guard.fired() => {
                    // The guard already removed the workspace and logged the
                    // fatal timeout; the abandoned pipeline's own eventual
                    // error is not surfaced.
                    Err(stage_error(STAGE_TIMEOUT, Error::Timeout { budget_secs }))
                }
            }
        };
        guard.disarm().await;

        if let Err(error) = workspace.remove() {
            tracing::error!(parent: &span, error = %error, "clean up error");
        }

        if let Ok(message) = &result {
            tracing::info!(parent: &span, "{message}");
        }
        result
    }

    async fn run_pipeline(
        &self,
        ctx: &mut InvocationContext,
        span: &tracing::Span,
        workspace: &Workspace,
    ) -> Result<String, HandlerError> {
        let registry_config = match &self.config.registry_endpoint {
            Some(endpoint) => RegistryConfig::from_env(endpoint.host.as_str())
                .with_plain_http(endpoint.plain_http),
            None => RegistryConfig::from_env(ctx.registry_url.as_str()),
        };
        let registry = Registry::connect(registry_config)
            .await
            .map_err(|e| stage_error(STAGE_REGISTRY_INIT, e))?;

        match registry
            .validate_image_manifest(&ctx.repository, &ctx.image_digest)
            .await
        {
            Ok(ImageManifestCheck::Image) => {}
            Ok(ImageManifestCheck::NotImage { config_media_type }) => {
                tracing::warn!(
                    config_media_type = config_media_type.as_deref().unwrap_or(""),
                    "digest is not an image manifest; skipping index build"
                );
                return Ok(EXITED_EARLY_MESSAGE.to_string());
            }
            Err(e) => return Err(stage_error(STAGE_DIGEST_VALIDATION, e)),
        }

        let store = OciStore::open(workspace.store_dir())
            .await
            .map_err(|e| stage_error(STAGE_STORE_INIT, e))?;
        let artifacts_db_path = workspace.artifacts_db_path();
        let artifacts_db =
            ArtifactsDb::open(&artifacts_db_path).map_err(|e| stage_error(STAGE_ARTIFACTS_DB_INIT, e))?;

        let reference = Reference::Digest(ctx.image_digest.clone());
        registry
            .pull(&ctx.repository, &reference, &store)
            .await
            .map_err(|e| stage_error(STAGE_PULL, e))?;

        let image = ImageRef {
            repository: ctx.repository.clone(),
            digest: ctx.image_digest.clone(),
        };
        let store_root = workspace.store_dir();
        let request = BuildRequest {
            store_root: &store_root,
            artifacts_db_path: &artifacts_db_path,
            image: &image,
            options: &self.config.build_options,
        };
        self.builder
            .build(&request)
            .await
            .map_err(|e| stage_error(STAGE_BUILD, e))?;

        // The builder records what it wrote; the most recent row for this
        // image and platform is the artifact to push.
        let platform = self.config.build_options.platform.to_string();
        let index = artifacts_db
            .latest_for_image(&ctx.image_digest, &platform)
            .map_err(|e| stage_error(STAGE_BUILD, e))?
            .ok_or_else(|| {
                stage_error(
                    STAGE_BUILD,
                    Error::build("no SOCI index recorded for the image"),
                )
            })?;
        ctx.record_index_digest(span, index.digest.clone());
        tracing::info!(index_digest = %index.digest, "SOCI index built");

        registry
            .push(&store, &index, &ctx.repository)
            .await
            .map_err(|e| stage_error(STAGE_PUSH, e))?;

        Ok(SUCCESS_MESSAGE.to_string())
    }
}
