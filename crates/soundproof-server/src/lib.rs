//! Out-of-process plugin server.
//!
//! This crate is the far side of the soundproof bridge: the `soundproof-host`
//! binary attaches to a shared region created by the host process and serves
//! plugin instances over its channels. The same binary doubles as the probe
//! runner, loading one plugin in a throwaway process so a crash during
//! scanning costs nothing but that process.
//!
//! Plugin formats plug in behind the [`PluginInstance`] trait; the built-in
//! `native:` units exercise every host path without external binaries.

pub mod error;
pub mod handle;
pub mod instance;
pub mod native;
pub mod probe;
pub mod server;

pub use error::{Result, ServerError};
pub use handle::PluginHandle;
pub use instance::{PluginInstance, ProcessContext, ProcessOutput};
pub use probe::{ProbeOutcome, ProbeReport};
pub use server::Server;
