#![warn(missing_docs)]

//! dfs-maint: maintenance agent for an HA distributed filesystem. Usage reports, scratch retention, home directory provisioning

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod fs;
pub mod protection;
pub mod provision;
pub mod report;
pub mod retention;
pub mod testkit;
pub mod topology;
pub mod usage;

pub use config::MaintConfig;
pub use coordinator::{CoordinatorGate, GateDecision};
pub use error::{MaintError, Result};
pub use fs::FileSystem;
pub use report::{AuditEvent, Reporter};
