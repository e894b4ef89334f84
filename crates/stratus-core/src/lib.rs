//! stratus-core — shared vocabulary for the Stratus cluster orchestrator.
//!
//! Everything the other crates agree on lives here: the provider-facing
//! domain types (instances, isolation groups, spot requests), the static
//! instance-type catalog, the operator configuration, and the error
//! taxonomy every action reports through.

pub mod catalog;
pub mod config;
pub mod error;
pub mod types;

pub use catalog::Virtualization;
pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use types::*;
