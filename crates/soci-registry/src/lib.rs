//! Registry network layer for the SOCI index builder.
//!
//! Everything that touches the wire lives here: the local OCI-layout content
//! store that pulls land in, the distribution-API client that copies manifest
//! graphs in both directions, and the ECR authorization-token exchange
//! (SigV4-signed) used when the target registry is a private ECR endpoint.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod auth;
pub mod client;
mod sigv4;
pub mod store;

pub use auth::AwsCredentials;
pub use client::{ImageManifestCheck, Registry, RegistryConfig};
pub use store::OciStore;
