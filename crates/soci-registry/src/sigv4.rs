//! Minimal AWS Signature Version 4 signing.
//!
//! Only what the ECR `GetAuthorizationToken` exchange needs: POST with a
//! fixed body, no query string, a small header set. Canonicalization follows
//! the SigV4 specification; the derived key chain is
//! `AWS4<secret> -> date -> region -> service -> aws4_request`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest as _, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Inputs to one signing operation.
pub(crate) struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Headers the caller must attach to the outgoing request.
pub(crate) struct SignedHeaders {
    /// `X-Amz-Date` value.
    pub amz_date: String,
    /// `Authorization` value.
    pub authorization: String,
}

/// Signs a request, returning the `X-Amz-Date` and `Authorization` values.
///
/// `headers` are the additional headers to include in the signature, with
/// lowercase names (e.g. `content-type`, `x-amz-target`). `host`,
/// `x-amz-date`, and `x-amz-security-token` (when a session token is
/// present) are added here and must be attached by the caller exactly as
/// signed.
pub(crate) fn sign_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    body: &[u8],
    params: &SigningParams<'_>,
) -> SignedHeaders {
    let amz_date = params.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.timestamp.format("%Y%m%d").to_string();

    let mut signed: BTreeMap<String, String> = headers.clone();
    signed.insert("host".to_string(), host_header(url));
    signed.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = params.session_token {
        signed.insert("x-amz-security-token".to_string(), token.to_string());
    }

    let canonical = canonical_request(method, url, &signed, body);
    let scope = format!(
        "{date}/{}/{}/aws4_request",
        params.region, params.service
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical.as_bytes()))
    );

    let key = signing_key(params.secret_access_key, &date, params.region, params.service);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    let signed_header_names = header_list(&signed);
    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_header_names}, \
         Signature={signature}",
        params.access_key_id
    );

    SignedHeaders {
        amz_date,
        authorization,
    }
}

/// The `Host` header value reqwest will send for this URL.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn canonical_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let query = url.query().unwrap_or("");

    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }

    format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{}\n{}",
        header_list(headers),
        hex::encode(Sha256::digest(body))
    )
}

fn header_list(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
