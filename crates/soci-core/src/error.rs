//! Error types and result alias shared across the SOCI index builder.
//!
//! Each variant corresponds to one failure class of the invocation pipeline.
//! Stage labelling (which pipeline step produced the failure) is layered on
//! top by the orchestrator; the taxonomy here only says *what kind* of
//! failure occurred.

/// The result type used throughout the SOCI index builder.
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure classes of the invocation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inbound notification failed validation. Never retried; terminal
    /// for that event.
    #[error("invalid event: {message}")]
    Validation {
        /// The first violation, in check order.
        message: String,
    },

    /// The registry credential exchange failed.
    #[error("registry authorization failed: {message}")]
    Auth {
        /// Description of the authorization failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Pulling content from the remote registry failed (transport or
    /// not-found).
    #[error("pull failed: {message}")]
    Pull {
        /// Description of the pull failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Pushing content to the remote registry failed (transport).
    #[error("push failed: {message}")]
    Push {
        /// Description of the push failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The registry rejected the artifact's manifest shape. A capability
    /// gap, not a transient fault; callers may treat it as an expected
    /// outcome.
    #[error("registry does not support OCI artifacts")]
    RegistryCapability,

    /// The external index builder failed.
    #[error("index build failed: {message}")]
    Build {
        /// Description of the build failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The invocation deadline fired before the pipeline completed. The
    /// deadline guard has already performed best-effort cleanup.
    #[error("invocation timeout after {budget_secs} seconds")]
    Timeout {
        /// The wall-clock budget that was exhausted, in seconds.
        budget_secs: u64,
    },

    /// Workspace cleanup failed. Logged, never escalated: a cleanup failure
    /// must not mask the primary result.
    #[error("cleanup failed: {message}")]
    Cleanup {
        /// Description of the cleanup failure.
        message: String,
    },

    /// A local store or database operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    /// Creates a validation error from the primary violation message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an authorization error with the given message.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an authorization error with a source cause.
    #[must_use]
    pub fn auth_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Auth {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a pull error with the given message.
    #[must_use]
    pub fn pull(message: impl Into<String>) -> Self {
        Self::Pull {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a pull error with a source cause.
    #[must_use]
    pub fn pull_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Pull {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a push error with the given message.
    #[must_use]
    pub fn push(message: impl Into<String>) -> Self {
        Self::Push {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a push error with a source cause.
    #[must_use]
    pub fn push_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Push {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a build error with the given message.
    #[must_use]
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a build error with a source cause.
    #[must_use]
    pub fn build_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Build {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a cleanup error with the given message.
    #[must_use]
    pub fn cleanup(message: impl Into<String>) -> Self {
        Self::Cleanup {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
