//! Remote registry client over the distribution API.
//!
//! One [`Registry`] owns an authenticated session to a single remote
//! registry: it resolves and fetches manifests, copies manifest graphs into a
//! local [`OciStore`], and copies a derived-artifact graph back. ECR
//! endpoints are authorized via the token exchange in [`crate::auth`];
//! everything else pulls anonymously.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};

use soci_core::descriptor::{self, Descriptor, Digest, Manifest, Reference};
use soci_core::error::{Error, Result};

use crate::auth::{self, AwsCredentials};
use crate::store::OciStore;

/// Client identifier sent with every registry call.
pub const USER_AGENT: &str = "SOCI Index Builder (reqwest)";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);

/// ECR's rejection body when a registry does not accept OCI artifact
/// manifests. Matched together with the 405 status; the text is the only
/// signal ECR exposes for this condition today.
const CAPABILITY_REJECTION_TEXT: &str =
    "Invalid parameter at 'ImageManifest' failed to satisfy constraint: 'Invalid JSON syntax'";

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

/// Connection settings for one remote registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry host (no scheme).
    pub host: String,

    /// Use `http://` instead of `https://`. Local stubs only.
    pub plain_http: bool,

    /// Override for the ECR token endpoint.
    pub ecr_token_endpoint: Option<String>,

    /// Credentials for the ECR token exchange. When unset, the conventional
    /// environment variables are used at connect time.
    pub credentials: Option<AwsCredentials>,

    /// Perform the token exchange even when the host is not an ECR
    /// endpoint. Local stubs only.
    pub force_token_exchange: bool,
}

impl RegistryConfig {
    /// Creates a config for `host` with defaults.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            plain_http: false,
            ecr_token_endpoint: None,
            credentials: None,
            force_token_exchange: false,
        }
    }

    /// Creates a config for `host`, honoring the `ECR_ENDPOINT` environment
    /// override for the token exchange.
    #[must_use]
    pub fn from_env(host: impl Into<String>) -> Self {
        let mut config = Self::new(host);
        config.ecr_token_endpoint = std::env::var(auth::ECR_ENDPOINT_ENV)
            .ok()
            .filter(|endpoint| !endpoint.is_empty());
        config
    }

    /// Switches the client to plain HTTP.
    #[must_use]
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    /// Sets an explicit token endpoint.
    #[must_use]
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ecr_token_endpoint = Some(endpoint.into());
        self
    }

    /// Sets explicit credentials for the token exchange.
    #[must_use]
    pub fn with_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Forces the token exchange for non-ECR hosts. Local stubs only.
    #[must_use]
    pub fn with_forced_token_exchange(mut self, force: bool) -> Self {
        self.force_token_exchange = force;
        self
    }
}

/// Outcome of the pre-pull media-type check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageManifestCheck {
    /// The manifest describes an image; safe to pull and index.
    Image,
    /// The manifest's config media type is not a recognized image config
    /// type (index documents and arbitrary artifacts land here).
    NotImage {
        /// The config media type found, when one was present.
        config_media_type: Option<String>,
    },
}

/// An authenticated session to one remote registry.
#[derive(Debug)]
pub struct Registry {
    http: reqwest::Client,
    base_url: String,
    auth_header: Option<String>,
}

impl Registry {
    /// Connects to the registry described by `config`, performing the ECR
    /// token exchange when the host is a private ECR endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` when the HTTP client cannot be built or the
    /// token exchange fails.
    pub async fn connect(config: RegistryConfig) -> Result<Self> {
        tracing::info!(host = %config.host, "initializing registry client");

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::auth_with_source("failed to build registry http client", e))?;

        let auth_header = if auth::is_ecr_registry(&config.host) || config.force_token_exchange {
            let region = match auth::ecr_region(&config.host) {
                Some(region) => region,
                None if config.force_token_exchange => "us-east-1".to_string(),
                None => {
                    return Err(Error::auth(format!(
                        "could not derive region from {}",
                        config.host
                    )))
                }
            };
            let credentials = match config.credentials {
                Some(credentials) => credentials,
                None => AwsCredentials::from_env()?,
            };
            let token = auth::exchange_authorization_token(
                &http,
                &region,
                config.ecr_token_endpoint.as_deref(),
                &credentials,
            )
            .await?;
            Some(format!("Basic {token}"))
        } else {
            None
        };

        let scheme = if config.plain_http { "http" } else { "https" };
        Ok(Self {
            http,
            base_url: format!("{scheme}://{}", config.host),
            auth_header,
        })
    }

    /// Returns whether this session attached an authorization header.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.auth_header.is_some()
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(auth) = &self.auth_header {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        builder
    }

    fn manifest_url(&self, repository: &str, reference: &Reference) -> String {
        format!("{}/v2/{repository}/manifests/{reference}", self.base_url)
    }

    fn blob_url(&self, repository: &str, digest: &Digest) -> String {
        format!("{}/v2/{repository}/blobs/{digest}", self.base_url)
    }

    /// Resolves a manifest without downloading its body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Pull` when the reference does not resolve or the
    /// response lacks a digest header.
    pub async fn head_manifest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<Descriptor> {
        let response = self
            .request(Method::HEAD, self.manifest_url(repository, reference))
            .header("Accept", MANIFEST_ACCEPT)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                Error::pull_with_source(format!("failed to resolve {repository}:{reference}"), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::pull(format!(
                "failed to resolve {repository}:{reference}: registry returned {status}"
            )));
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                Error::pull(format!(
                    "registry returned no content digest for {repository}:{reference}"
                ))
            })
            .and_then(Digest::parse)?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Ok(Descriptor {
            media_type,
            digest,
            size,
        })
    }

    async fn fetch_manifest_raw(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<(Descriptor, Vec<u8>)> {
        let response = self
            .request(Method::GET, self.manifest_url(repository, reference))
            .header("Accept", MANIFEST_ACCEPT)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                Error::pull_with_source(format!("failed to fetch {repository}:{reference}"), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::pull(format!(
                "failed to fetch {repository}:{reference}: registry returned {status}"
            )));
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| {
                Error::pull_with_source(format!("failed to read {repository}:{reference}"), e)
            })?
            .to_vec();

        let computed = Digest::sha256_of(&body);
        if let Some(expected) = reference.as_digest() {
            if expected != &computed {
                return Err(Error::pull(format!(
                    "manifest content for {repository}:{reference} hashes to {computed}"
                )));
            }
        }

        let size = body.len() as u64;
        Ok((
            Descriptor {
                media_type,
                digest: computed,
                size,
            },
            body,
        ))
    }

    /// Fetches and parses a single-image manifest.
    ///
    /// # Errors
    ///
    /// Returns `Error::Pull` when the reference does not resolve or the body
    /// is not an image manifest.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<(Descriptor, Manifest)> {
        let (descriptor, body) = self.fetch_manifest_raw(repository, reference).await?;
        let manifest = serde_json::from_slice(&body).map_err(|e| {
            Error::pull_with_source(
                format!("manifest for {repository}:{reference} is not an image manifest"),
                e,
            )
        })?;
        Ok((descriptor, manifest))
    }

    /// Checks that the digest names a manifest whose embedded config media
    /// type is a recognized image config type.
    ///
    /// Index documents and manifests of arbitrary artifacts report
    /// [`ImageManifestCheck::NotImage`]; only transport failures are errors.
    ///
    /// # Errors
    ///
    /// Returns `Error::Pull` when the manifest cannot be fetched or parsed
    /// at all.
    pub async fn validate_image_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<ImageManifestCheck> {
        let reference = Reference::Digest(digest.clone());
        let (_, body) = self.fetch_manifest_raw(repository, &reference).await?;

        let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            Error::pull_with_source(format!("manifest for {repository}@{digest} unreadable"), e)
        })?;

        let config_media_type = value
            .get("config")
            .and_then(|config| config.get("mediaType"))
            .and_then(|media_type| media_type.as_str());

        match config_media_type {
            Some(media_type) if descriptor::is_image_config(media_type) => {
                Ok(ImageManifestCheck::Image)
            }
            Some(media_type) => Ok(ImageManifestCheck::NotImage {
                config_media_type: Some(media_type.to_string()),
            }),
            None => Ok(ImageManifestCheck::NotImage {
                config_media_type: None,
            }),
        }
    }

    /// Copies the full manifest graph at `reference` into `store`, returning
    /// the root descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Error::Pull` when the reference does not resolve or a blob
    /// cannot be fetched, `Error::Storage` when the local store rejects
    /// content.
    pub async fn pull(
        &self,
        repository: &str,
        reference: &Reference,
        store: &OciStore,
    ) -> Result<Descriptor> {
        tracing::info!(repository, reference = %reference, "pulling image");

        let (root, body) = self.fetch_manifest_raw(repository, reference).await?;
        if descriptor::is_index(&root.media_type) {
            return Err(Error::pull(format!(
                "{repository}:{reference} is a multi-image index ({}), expected an image manifest",
                root.media_type
            )));
        }

        let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| {
            Error::pull_with_source(format!("manifest for {repository}:{reference} unreadable"), e)
        })?;

        store.write_blob_verified(&root.digest, &body).await?;

        for referenced in manifest.referenced() {
            if store.contains(&referenced.digest) {
                continue;
            }
            let bytes = self.fetch_blob(repository, &referenced.digest).await?;
            store.write_blob_verified(&referenced.digest, &bytes).await?;
        }

        store.add_manifest(&root).await?;

        tracing::info!(
            repository,
            digest = %root.digest,
            layers = manifest.layers.len(),
            "image pulled"
        );
        Ok(root)
    }

    async fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Vec<u8>> {
        let response = self
            .request(Method::GET, self.blob_url(repository, digest))
            .send()
            .await
            .map_err(|e| {
                Error::pull_with_source(format!("failed to fetch blob {digest}"), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::pull(format!(
                "failed to fetch blob {digest}: registry returned {status}"
            )));
        }

        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::pull_with_source(format!("failed to read blob {digest}"), e))?
            .to_vec())
    }

    /// Copies the content graph rooted at `root` from `store` to the remote
    /// repository: referenced blobs first, the manifest last.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryCapability` when the registry rejects the
    /// artifact's manifest shape, `Error::Push` for any other transport
    /// failure, `Error::Storage` when local content is missing.
    pub async fn push(
        &self,
        store: &OciStore,
        root: &Descriptor,
        repository: &str,
    ) -> Result<()> {
        tracing::info!(repository, digest = %root.digest, "pushing artifact");

        let body = store.read_blob(&root.digest).await?;
        let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| {
            Error::push_with_source(format!("artifact manifest {} unreadable", root.digest), e)
        })?;

        for referenced in manifest.referenced() {
            if self.blob_exists(repository, &referenced.digest).await? {
                continue;
            }
            let bytes = store.read_blob(&referenced.digest).await?;
            self.upload_blob(repository, &referenced.digest, bytes).await?;
        }

        self.put_manifest(repository, root, body).await
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let response = self
            .request(Method::HEAD, self.blob_url(repository, digest))
            .send()
            .await
            .map_err(|e| {
                Error::push_with_source(format!("failed to check blob {digest}"), e)
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(Error::push(format!(
                "failed to check blob {digest}: registry returned {status}"
            )))
        }
    }

    async fn upload_blob(
        &self,
        repository: &str,
        digest: &Digest,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let session_url = format!("{}/v2/{repository}/blobs/uploads/", self.base_url);
        let response = self
            .request(Method::POST, session_url)
            .send()
            .await
            .map_err(|e| {
                Error::push_with_source(format!("failed to start upload of {digest}"), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::push(format!(
                "failed to start upload of {digest}: registry returned {status}"
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                Error::push(format!("upload session for {digest} returned no location"))
            })?;
        let upload_url = monolithic_upload_url(&self.base_url, location, digest);

        let response = self
            .request(Method::PUT, upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::push_with_source(format!("failed to upload {digest}"), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::push(format!(
                "failed to upload {digest}: registry returned {status}"
            )));
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        root: &Descriptor,
        body: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}/v2/{repository}/manifests/{}", self.base_url, root.digest);
        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, root.media_type.as_str())
            .timeout(MANIFEST_TIMEOUT)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                Error::push_with_source(format!("failed to push manifest {}", root.digest), e)
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_manifest_put_failure(status, &body, &root.digest);
        if matches!(error, Error::RegistryCapability) {
            tracing::warn!(
                repository,
                digest = %root.digest,
                response = %body,
                "registry rejected the artifact manifest shape"
            );
        }
        Err(error)
    }
}

/// Classifies a failed manifest PUT.
///
/// ECR signals "this registry does not accept OCI artifacts" as a 405 whose
/// body carries a fixed constraint-violation text; that combination maps to
/// the capability sentinel, everything else stays a push error.
// TODO: match on a structured registry error code for the capability case
// once ECR returns one for this rejection.
fn classify_manifest_put_failure(status: StatusCode, body: &str, digest: &Digest) -> Error {
    if status == StatusCode::METHOD_NOT_ALLOWED && body.contains(CAPABILITY_REJECTION_TEXT) {
        Error::RegistryCapability
    } else {
        Error::push(format!(
            "failed to push manifest {digest}: registry returned {status}: {body}"
        ))
    }
}

/// Resolves an upload-session location (absolute or registry-relative) into
/// the monolithic upload URL carrying the digest parameter.
fn monolithic_upload_url(base_url: &str, location: &str, digest: &Digest) -> String {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{base_url}{location}")
    };
    let separator = if absolute.contains('?') { '&' } else { '?' };
    format!("{absolute}{separator}digest={digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::sha256_of(b"artifact manifest")
    }

    #[test]
    fn capability_rejection_maps_to_sentinel() {
        let body = format!(
            "unsupported: {CAPABILITY_REJECTION_TEXT}"
        );
        let error =
            classify_manifest_put_failure(StatusCode::METHOD_NOT_ALLOWED, &body, &digest());
        assert!(matches!(error, Error::RegistryCapability));
    }

    #[test]
    fn other_manifest_put_failures_stay_push_errors() {
        // 405 without the constraint text.
        let error = classify_manifest_put_failure(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
            &digest(),
        );
        assert!(matches!(error, Error::Push { .. }));

        // The constraint text under a different status.
        let error = classify_manifest_put_failure(
            StatusCode::BAD_REQUEST,
            CAPABILITY_REJECTION_TEXT,
            &digest(),
        );
        assert!(matches!(error, Error::Push { .. }));
    }

    #[test]
    fn upload_url_joins_relative_and_absolute_locations() {
        let digest = digest();

        assert_eq!(
            monolithic_upload_url("http://127.0.0.1:5000", "/v2/app/blobs/uploads/abc", &digest),
            format!("http://127.0.0.1:5000/v2/app/blobs/uploads/abc?digest={digest}")
        );

        assert_eq!(
            monolithic_upload_url(
                "http://127.0.0.1:5000",
                "http://127.0.0.1:5000/v2/app/blobs/uploads/abc?state=1",
                &digest
            ),
            format!("http://127.0.0.1:5000/v2/app/blobs/uploads/abc?state=1&digest={digest}")
        );
    }
}
