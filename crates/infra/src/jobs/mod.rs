//! The operational jobs.
//!
//! - `auto_update`: self-update pipeline of the host application
//! - `bounce`: bounce processing pass over the mail-retrieval endpoints
//!
//! Both are synchronous, run on the invoking thread and return a
//! [`JobOutcome`] that maps onto the process exit code.

pub mod auto_update;
pub mod bounce;
pub mod drain;
pub mod outcome;
pub mod workers;
pub mod workspace;

pub use auto_update::{
    AutoUpdateJob, UpdateDeps, UpdateError, UpdateOutcome, UpdateReport, UpdateSettings,
    UpdateStep,
};
pub use bounce::{
    BounceDeps, BounceIngestor, BounceJob, BounceSettings, CommandIngestor, IngestError, PassMode,
    PassReport, WorkerError, process_endpoint, run_worker,
};
pub use drain::{DrainOutcome, DrainPolicy, wait_for_drain};
pub use outcome::{JobOutcome, JobReport};
pub use workers::{
    ScriptedLauncher, SelfExecLauncher, WORKER_SUBCOMMAND, WorkerCapability, WorkerChild,
    WorkerExit, WorkerLauncher,
};
pub use workspace::UpdateWorkspace;
