//! Infrastructure layer: job locking, external processes, the release API,
//! host-application stores, notifications and the jobs built on top of them.

pub mod backup;
pub mod clock;
pub mod config;
pub mod gate;
pub mod hooks;
pub mod integrity;
pub mod jobs;
pub mod lock;
pub mod notify;
pub mod process;
pub mod release;
pub mod store;

mod integration_tests;
