//! Build options and the external-builder contract.
//!
//! The orchestrator hands the builder a local content store, the artifacts
//! database, and a target image; the builder writes the index into the store,
//! records it in the database, and returns. The orchestrator then re-queries
//! the database for the most-recently-written descriptor rather than trusting
//! a return value.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use soci_core::descriptor::Digest;
use soci_core::error::{Error, Result};

/// Environment variable naming the external builder program.
pub const BUILDER_BIN_ENV: &str = "SOCI_BUILDER_BIN";

/// How much captured stderr to keep in a build failure message.
const STDERR_TAIL_BYTES: usize = 2048;

/// Target platform of a build, `os/architecture` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture in OCI naming, e.g. `amd64`.
    pub architecture: String,
}

impl Platform {
    /// The platform of the host this process runs on. Container images are
    /// Linux images, so the OS is pinned; the architecture follows the host.
    #[must_use]
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Options passed through to the index builder.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Target platform.
    pub platform: Platform,

    /// Layers smaller than this are not indexed. Zero indexes everything.
    pub min_layer_size: u64,

    /// Emit indexes that registries without OCI 1.1 referrer support can
    /// still store.
    pub legacy_registry_support: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            min_layer_size: 0,
            legacy_registry_support: true,
        }
    }
}

/// The image an index is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository the image lives in.
    pub repository: String,
    /// Digest of the image manifest.
    pub digest: Digest,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

/// One build invocation's inputs.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    /// Root of the local OCI-layout content store holding the pulled image.
    pub store_root: &'a Path,

    /// Path of the artifacts database the builder records into.
    pub artifacts_db_path: &'a Path,

    /// The image to index.
    pub image: &'a ImageRef,

    /// Build options.
    pub options: &'a BuildOptions,
}

/// The external index-building routine.
///
/// Implementations write the built index into the request's store and record
/// it in the artifacts database; the caller re-queries the database for the
/// resulting descriptor.
#[async_trait]
pub trait IndexBuilder: Send + Sync {
    /// Builds an index for the requested image.
    async fn build(&self, request: &BuildRequest<'_>) -> Result<()>;
}

/// Production builder: invokes the external routine as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandIndexBuilder {
    program: PathBuf,
}

impl CommandIndexBuilder {
    /// Creates a builder invoking `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Creates a builder from the `SOCI_BUILDER_BIN` environment variable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Build` when the variable is unset or empty.
    pub fn from_env() -> Result<Self> {
        std::env::var(BUILDER_BIN_ENV)
            .ok()
            .filter(|program| !program.is_empty())
            .map(Self::new)
            .ok_or_else(|| Error::build(format!("{BUILDER_BIN_ENV} is not set")))
    }

    fn build_args(request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "--store".to_string(),
            request.store_root.display().to_string(),
            "--artifacts-db".to_string(),
            request.artifacts_db_path.display().to_string(),
            "--image".to_string(),
            request.image.to_string(),
            "--platform".to_string(),
            request.options.platform.to_string(),
            "--min-layer-size".to_string(),
            request.options.min_layer_size.to_string(),
        ];
        if request.options.legacy_registry_support {
            args.push("--legacy-registry-support".to_string());
        }
        args
    }
}

#[async_trait]
impl IndexBuilder for CommandIndexBuilder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<()> {
        let args = Self::build_args(request);
        tracing::info!(
            program = %self.program.display(),
            image = %request.image,
            "building SOCI index"
        );

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                Error::build_with_source(
                    format!("failed to launch builder {}", self.program.display()),
                    e,
                )
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::build(format!(
                "builder exited with {}: {}",
                output.status,
                tail(&stderr, STDERR_TAIL_BYTES).trim()
            )))
        }
    }
}

/// The last `max` bytes of `s`, rounded forward to a character boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        store_root: &'a Path,
        db_path: &'a Path,
        image: &'a ImageRef,
        options: &'a BuildOptions,
    ) -> BuildRequest<'a> {
        BuildRequest {
            store_root,
            artifacts_db_path: db_path,
            image,
            options,
        }
    }

    #[test]
    fn renders_builder_arguments() {
        let image = ImageRef {
            repository: "team/app".to_string(),
            digest: Digest::sha256_of(b"manifest"),
        };
        let options = BuildOptions {
            platform: Platform {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
            },
            min_layer_size: 10,
            legacy_registry_support: true,
        };
        let store = PathBuf::from("/tmp/ws/store");
        let db = PathBuf::from("/tmp/ws/artifacts.db");

        let args = CommandIndexBuilder::build_args(&request(&store, &db, &image, &options));

        assert_eq!(args[0..2], ["--store".to_string(), "/tmp/ws/store".to_string()]);
        assert!(args.contains(&"--platform".to_string()));
        assert!(args.contains(&"linux/amd64".to_string()));
        assert!(args.contains(&"--min-layer-size".to_string()));
        assert!(args.contains(&"10".to_string()));
        assert!(args.contains(&format!("team/app@{}", image.digest)));
        assert_eq!(args.last().map(String::as_str), Some("--legacy-registry-support"));
    }

    #[test]
    fn legacy_flag_is_optional() {
        let image = ImageRef {
            repository: "app".to_string(),
            digest: Digest::sha256_of(b"manifest"),
        };
        let options = BuildOptions {
            legacy_registry_support: false,
            ..BuildOptions::default()
        };
        let store = PathBuf::from("/ws/store");
        let db = PathBuf::from("/ws/artifacts.db");

        let args = CommandIndexBuilder::build_args(&request(&store, &db, &image, &options));
        assert!(!args.contains(&"--legacy-registry-support".to_string()));
    }

    #[test]
    fn default_options_index_everything() {
        let options = BuildOptions::default();
        assert_eq!(options.min_layer_size, 0);
        assert!(options.legacy_registry_support);
        assert_eq!(options.platform.os, "linux");
    }

    #[tokio::test]
    async fn successful_builder_exit_is_ok() {
        let image = ImageRef {
            repository: "app".to_string(),
            digest: Digest::sha256_of(b"manifest"),
        };
        let options = BuildOptions::default();
        let store = PathBuf::from("/ws/store");
        let db = PathBuf::from("/ws/artifacts.db");

        // `true` ignores its arguments and exits 0.
        let builder = CommandIndexBuilder::new("true");
        builder
            .build(&request(&store, &db, &image, &options))
            .await
            .expect("build");
    }

    #[tokio::test]
    async fn failing_builder_exit_is_a_build_error() {
        let image = ImageRef {
            repository: "app".to_string(),
            digest: Digest::sha256_of(b"manifest"),
        };
        let options = BuildOptions::default();
        let store = PathBuf::from("/ws/store");
        let db = PathBuf::from("/ws/artifacts.db");

        let builder = CommandIndexBuilder::new("false");
        let err = builder
            .build(&request(&store, &db, &image, &options))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build { .. }));
    }

    #[tokio::test]
    async fn missing_builder_program_is_a_build_error() {
        let image = ImageRef {
            repository: "app".to_string(),
            digest: Digest::sha256_of(b"manifest"),
        };
        let options = BuildOptions::default();
        let store = PathBuf::from("/ws/store");
        let db = PathBuf::from("/ws/artifacts.db");

        let builder = CommandIndexBuilder::new("/nonexistent/soci-builder");
        let err = builder
            .build(&request(&store, &db, &image, &options))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Build { .. }));
    }
}
