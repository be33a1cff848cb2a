//! ECR registry detection and authorization-token exchange.
//!
//! Private ECR registries require a short-lived authorization token obtained
//! from the ECR control-plane API (`GetAuthorizationToken`, SigV4-signed).
//! The token is attached as a `Basic` authorization header on every
//! subsequent registry call and is never persisted. Non-ECR registries pull
//! anonymously.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use soci_core::error::{Error, Result};

use crate::sigv4::{self, SigningParams};

/// Environment variable overriding the ECR token endpoint (non-default AWS
/// endpoints, stubs in tests).
pub const ECR_ENDPOINT_ENV: &str = "ECR_ENDPOINT";

const ECR_TOKEN_TARGET: &str = "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";
const ECR_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

static ECR_REGISTRY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{12}\.dkr\.ecr\.([a-z0-9-]+)\.amazonaws\.com(\.cn)?$")
        .expect("ecr registry pattern")
});

/// Returns whether `host` is a private ECR registry endpoint.
#[must_use]
pub fn is_ecr_registry(host: &str) -> bool {
    ECR_REGISTRY_PATTERN.is_match(host)
}

/// Extracts the region segment from an ECR registry host.
#[must_use]
pub fn ecr_region(host: &str) -> Option<String> {
    ECR_REGISTRY_PATTERN
        .captures(host)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// AWS credentials used to sign the token exchange.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token, for temporary credentials.
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Reads credentials from the conventional environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` when `AWS_ACCESS_KEY_ID` or
    /// `AWS_SECRET_ACCESS_KEY` is missing.
    pub fn from_env() -> Result<Self> {
        let access_key_id = require_env("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = require_env("AWS_SECRET_ACCESS_KEY")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::auth(format!("{key} is not set")))
}

#[derive(Debug, Deserialize)]
struct AuthorizationData {
    #[serde(rename = "authorizationToken", default)]
    authorization_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetAuthorizationTokenResponse {
    #[serde(rename = "authorizationData", default)]
    authorization_data: Vec<AuthorizationData>,
}

/// Default ECR control-plane endpoint for a region.
#[must_use]
pub fn default_token_endpoint(region: &str) -> String {
    format!("https://api.ecr.{region}.amazonaws.com/")
}

/// Exchanges AWS credentials for a short-lived ECR authorization token.
///
/// `endpoint_override` replaces the default regional endpoint when set (the
/// `ECR_ENDPOINT` environment variable, or a stub in tests).
///
/// # Errors
///
/// Returns `Error::Auth` when the endpoint is malformed, the exchange fails,
/// or the response carries no usable token.
pub async fn exchange_authorization_token(
    http: &reqwest::Client,
    region: &str,
    endpoint_override: Option<&str>,
    credentials: &AwsCredentials,
) -> Result<String> {
    let endpoint = endpoint_override
        .map(str::to_string)
        .unwrap_or_else(|| default_token_endpoint(region));
    let url: Url = endpoint
        .parse()
        .map_err(|e| Error::auth_with_source(format!("invalid ECR endpoint {endpoint}"), e))?;

    let body = b"{}";
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), ECR_JSON_CONTENT_TYPE.to_string());
    headers.insert("x-amz-target".to_string(), ECR_TOKEN_TARGET.to_string());

    let signed = sigv4::sign_request(
        "POST",
        &url,
        &headers,
        body,
        &SigningParams {
            access_key_id: &credentials.access_key_id,
            secret_access_key: &credentials.secret_access_key,
            session_token: credentials.session_token.as_deref(),
            region,
            service: "ecr",
            timestamp: Utc::now(),
        },
    );

    let mut request = http
        .post(url)
        .timeout(TOKEN_EXCHANGE_TIMEOUT)
        .header("Content-Type", ECR_JSON_CONTENT_TYPE)
        .header("X-Amz-Target", ECR_TOKEN_TARGET)
        .header("X-Amz-Date", signed.amz_date.as_str())
        .header("Authorization", signed.authorization.as_str())
        .body(body.to_vec());
    if let Some(token) = credentials.session_token.as_deref() {
        request = request.header("X-Amz-Security-Token", token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::auth_with_source("ECR token exchange request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::auth(format!(
            "ECR token exchange returned {status}: {body}"
        )));
    }

    let parsed: GetAuthorizationTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::auth_with_source("ECR token exchange response unreadable", e))?;

    let token = parsed
        .authorization_data
        .first()
        .ok_or_else(|| Error::auth("could not authorize with ECR: empty authorization data returned"))?
        .authorization_token
        .clone()
        .unwrap_or_default();

    if token.is_empty() {
        return Err(Error::auth(
            "could not authorize with ECR: empty authorization token returned",
        ));
    }

    Ok(token)
}
