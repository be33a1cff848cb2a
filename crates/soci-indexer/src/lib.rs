//! Invocation orchestrator for the SOCI index builder.
//!
//! Reacts to one "repository push completed" notification: validates it,
//! pulls the image's manifest graph into an ephemeral workspace, delegates to
//! the external index builder, pushes the resulting artifact back to the same
//! registry, and cleans up, all under a deadline guard that deletes the
//! workspace if the hosting environment's budget is about to expire.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod deadline;
pub mod handler;

pub use deadline::DeadlineGuard;
pub use handler::{
    HandlerConfig, HandlerError, InvocationHandler, RegistryEndpoint, EXITED_EARLY_MESSAGE,
    SUCCESS_MESSAGE,
};
