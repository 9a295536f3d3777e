//! `mailops-core`: primitives shared by the operational jobs.
//!
//! This crate contains **pure** value types (no I/O, no infrastructure
//! concerns): identifiers, release versions, integrity signatures, persisted
//! status literals and the per-run trace.

pub mod error;
pub mod id;
pub mod run_log;
pub mod signature;
pub mod status;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, EndpointId, RunId};
pub use run_log::{RunLog, RunLogEntry};
pub use signature::{SIGNATURE_LEN, Signature};
pub use status::{EndpointStatus, ServiceStatus};
pub use version::ReleaseVersion;
