//! Proxydeck - supervision core for reverse-proxy client instances
//!
//! This library runs one external proxy client process per stored
//! configuration:
//! - Keeps a durable, validated registry of named configuration documents
//! - Starts, stops and restarts at most one proxy process per configuration
//! - Reports status transitions and process failures to any number of observers
//! - Resumes auto-start configurations when the supervisor boots
//! - Locates the bundled proxy binary for the host platform and architecture

pub mod autolaunch;
pub mod binary;
pub mod config;
pub mod error;
pub mod events;
pub mod runner;
pub mod store;
pub mod supervisor;

pub use error::{Error, ErrorCode, Result};
pub use events::{EventSink, RunState};
pub use store::{ConfigStore, Configuration};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
