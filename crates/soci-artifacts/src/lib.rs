//! Builder collaborator contract for the SOCI index builder.
//!
//! The index-construction algorithm itself is external to this system. This
//! crate pins down the narrow contract the orchestrator holds it to: the
//! artifacts database the builder writes and the orchestrator re-queries,
//! the build options, the [`IndexBuilder`] trait, and the production
//! implementation that invokes the external routine as a subprocess.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod builder;
pub mod db;

pub use builder::{BuildOptions, BuildRequest, CommandIndexBuilder, ImageRef, IndexBuilder, Platform};
pub use db::ArtifactsDb;
