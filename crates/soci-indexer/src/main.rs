//! # soci-indexer
//!
//! Builds and pushes a SOCI index for one pushed container image.
//!
//! Reads an ECR image action notification (JSON), pulls the image from the
//! source registry, invokes the external index builder, and pushes the
//! resulting artifact back to the same repository. The hosting environment's
//! invocation budget becomes the deadline the cleanup guard races against.
//!
//! ## Usage
//!
//! ```bash
//! # Event from a file
//! soci-indexer --event event.json --builder-bin /opt/soci/builder
//!
//! # Event from stdin, 5 minute budget
//! cat event.json | soci-indexer --event - --invocation-timeout-secs 300
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use soci_artifacts::CommandIndexBuilder;
use soci_core::context::InvocationMeta;
use soci_core::event::ImageActionEvent;
use soci_core::workspace::NoProbe;
use soci_indexer::{HandlerConfig, InvocationHandler, RegistryEndpoint};

/// SOCI index builder invocation.
#[derive(Debug, Parser)]
#[command(name = "soci-indexer")]
#[command(about = "Builds and pushes a SOCI index for a pushed image")]
#[command(version)]
struct Args {
    /// Path of the notification JSON, or `-` for stdin.
    #[arg(long)]
    event: String,

    /// Volume to create workspaces under.
    #[arg(long, env = "SOCI_SCRATCH_DIR", default_value = "/tmp")]
    scratch_dir: PathBuf,

    /// Invocation budget in seconds; the deadline is now plus this.
    #[arg(long, env = "SOCI_INVOCATION_TIMEOUT_SECS", default_value = "900")]
    invocation_timeout_secs: i64,

    /// Minimum free bytes expected on the scratch volume.
    #[arg(long, env = "SOCI_MIN_FREE_BYTES", default_value = "6000000000")]
    min_free_bytes: u64,

    /// The external index builder program.
    #[arg(long, env = "SOCI_BUILDER_BIN")]
    builder_bin: PathBuf,

    /// Registry host override; defaults to the URL derived from the event.
    #[arg(long)]
    registry_endpoint: Option<String>,

    /// Use plain HTTP for the registry override. Local stubs only.
    #[arg(long, requires = "registry_endpoint")]
    plain_http: bool,
}

fn read_event(source: &str) -> Result<ImageActionEvent> {
    let raw = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read event from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read event from {source}"))?
    };
    serde_json::from_str(&raw).context("failed to parse image action event")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    let args = Args::parse();
    let event = read_event(&args.event)?;

    let config = HandlerConfig {
        scratch_dir: args.scratch_dir,
        min_free_bytes: args.min_free_bytes,
        registry_endpoint: args.registry_endpoint.map(|host| RegistryEndpoint {
            host,
            plain_http: args.plain_http,
        }),
        ..HandlerConfig::default()
    };

    let builder = CommandIndexBuilder::new(args.builder_bin);
    let handler = InvocationHandler::new(config, Arc::new(builder), Arc::new(NoProbe));

    let meta = InvocationMeta {
        request_id: uuid::Uuid::new_v4().to_string(),
        deadline: Utc::now() + chrono::Duration::seconds(args.invocation_timeout_secs.max(0)),
    };

    let message = handler.handle(event, meta).await.map_err(anyhow::Error::new)?;
    println!("{message}");
    Ok(())
}
