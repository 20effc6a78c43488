//! vpsctl - Per-user container instances with rotating remote-shell credentials
//!
//! The lifecycle orchestrator creates instances through the container runtime,
//! captures a freshly issued connection string from a helper running inside
//! each instance, and keeps the owner → instance → credential registry
//! consistent under concurrent requests.

pub mod cli;
pub mod core;
pub mod error;
pub mod persistence;

pub use crate::core::{LifecycleOrchestrator, Settings};
pub use crate::error::{LifecycleError, Result};
pub use crate::persistence::InstanceRegistry;

/// Application name constant
pub const APP_NAME: &str = "vpsctl";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
