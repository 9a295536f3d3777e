//! Bounce processing pass over every active mail-retrieval endpoint.
//!
//! A pass self-heals endpoints a crashed pass left `Running`, then ingests
//! each `Active` endpoint either inline or through worker processes, one
//! chunk of `workers` endpoints at a time. A failing endpoint is logged and
//! counted; it never aborts the pass, and the pass itself always exits `0`.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use mailops_core::{EndpointId, EndpointStatus, RunId};

use super::outcome::{JobOutcome, JobReport, panic_message};
use super::workers::{WorkerCapability, WorkerChild, WorkerLauncher};
use crate::clock::Sleeper;
use crate::config::{BounceConfig, IngestConfig, LockConfig};
use crate::gate::{self, ConnectivityGate};
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::lock::{JobLock, LockKey, ProcessMutex};
use crate::process::{CommandSpec, ProcessError, ProcessExecutor};
use crate::store::{Endpoint, EndpointRepository, StoreError};

pub const JOB_NAME: &str = "bounce";

/// Identity the pass locks under when fast mode is off.
pub const LOCK_NAME: &str = "mailops::jobs::bounce::BounceJob::run";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ingestion backend not ready: {0}")]
    NotReady(String),
    #[error("ingestion exited with status {0:?}")]
    Failed(Option<i32>),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Pulls an endpoint's mailbox and records the bounces found in it.
pub trait BounceIngestor: Send + Sync {
    /// Whether the ingestion backend can run on this host at all.
    fn check_ready(&self) -> Result<(), IngestError>;

    fn ingest(&self, endpoint: &Endpoint) -> Result<(), IngestError>;
}

/// Delegates ingestion to an external command.
pub struct CommandIngestor {
    executor: Arc<dyn ProcessExecutor>,
    program: String,
    args: Vec<String>,
    verbose: bool,
}

impl CommandIngestor {
    pub fn new(executor: Arc<dyn ProcessExecutor>, config: &IngestConfig, verbose: bool) -> Self {
        Self {
            executor,
            program: config.program.clone(),
            args: config.args.clone(),
            verbose,
        }
    }

    fn command(&self, endpoint: &Endpoint) -> CommandSpec {
        let spec = CommandSpec::new(self.program.clone())
            .args(&self.args)
            .arg("--endpoint-id")
            .arg(endpoint.id.to_string())
            .arg("--hostname")
            .arg(&endpoint.hostname)
            .arg("--username")
            .arg(&endpoint.username);
        if self.verbose { spec.arg("--verbose") } else { spec }
    }
}

impl BounceIngestor for CommandIngestor {
    fn check_ready(&self) -> Result<(), IngestError> {
        if !self.executor.can_spawn() {
            return Err(IngestError::NotReady(
                "this host cannot spawn external processes".to_string(),
            ));
        }
        if !self.executor.resolve(&self.program) {
            return Err(IngestError::NotReady(format!(
                "ingestion command `{}` was not found",
                self.program
            )));
        }
        Ok(())
    }

    fn ingest(&self, endpoint: &Endpoint) -> Result<(), IngestError> {
        let output = self.executor.run(&self.command(endpoint))?;
        if self.verbose {
            for line in &output.stdout {
                info!(endpoint_id = %endpoint.id, "{line}");
            }
        }
        if output.is_success() {
            Ok(())
        } else {
            Err(IngestError::Failed(output.code))
        }
    }
}

impl core::fmt::Debug for CommandIngestor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandIngestor")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish()
    }
}

/// Per-endpoint failure. Logged and counted, never propagated past the pass.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("endpoint {0} does not exist")]
    UnknownEndpoint(EndpointId),
    #[error("worker for endpoint {endpoint} could not be launched: {source}")]
    Launch { endpoint: EndpointId, source: io::Error },
    #[error("worker for endpoint {endpoint} exited with status {code:?}")]
    Exit { endpoint: EndpointId, code: Option<i32> },
    #[error("worker for endpoint {endpoint} could not be reaped: {source}")]
    Reap { endpoint: EndpointId, source: io::Error },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claim `endpoint`, ingest it and hand it back.
///
/// The endpoint returns to `Active` whether or not ingestion succeeded.
pub fn process_endpoint(
    endpoints: &dyn EndpointRepository,
    ingestor: &dyn BounceIngestor,
    endpoint: &Endpoint,
) -> Result<(), WorkerError> {
    endpoints.set_status(endpoint.id, EndpointStatus::Running)?;
    info!(endpoint_id = %endpoint.id, hostname = %endpoint.hostname, "started processing endpoint");

    let ingested = ingestor.ingest(endpoint);
    let released = endpoints.set_status(endpoint.id, EndpointStatus::Active);

    ingested?;
    released?;
    info!(endpoint_id = %endpoint.id, "finished processing endpoint");
    Ok(())
}

/// Body of a worker child: process one endpoint and return its exit code.
///
/// Panics are caught here so the child always ends through its own explicit
/// exit instead of unwinding into whatever called it.
pub fn run_worker(
    endpoints: &dyn EndpointRepository,
    ingestor: &dyn BounceIngestor,
    endpoint_id: EndpointId,
) -> i32 {
    let span = info_span!("bounce_worker", endpoint_id = %endpoint_id);
    let _enter = span.enter();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let endpoint = endpoints
            .get(endpoint_id)?
            .ok_or(WorkerError::UnknownEndpoint(endpoint_id))?;
        process_endpoint(endpoints, ingestor, &endpoint)
    }));

    match result {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!(error = %err, "endpoint processing failed");
            1
        }
        Err(payload) => {
            error!(panic = %panic_message(payload.as_ref()), "endpoint processing panicked");
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    Sequential,
    Parallel,
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub run_id: RunId,
    pub mode: PassMode,
    /// Endpoints reset from a stale `Running` marker.
    pub reset: usize,
    pub endpoints: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobReport for PassReport {
    fn exit_code(&self) -> i32 {
        0
    }

    const CRASH_EXIT_CODE: i32 = 0;
}

#[derive(Debug, Clone)]
pub struct BounceSettings {
    /// Skip the job lock and tolerate overlapping passes.
    pub fast: bool,
    pub lock_wait: Duration,
    pub parallel: bool,
    pub workers: usize,
    pub poll_interval: Duration,
}

impl BounceSettings {
    pub fn from_config(bounce: &BounceConfig, lock: &LockConfig) -> Self {
        Self {
            fast: bounce.fast,
            lock_wait: lock.wait(),
            parallel: bounce.parallel.enabled,
            workers: bounce.parallel.workers,
            poll_interval: bounce.parallel.poll_interval(),
        }
    }
}

impl Default for BounceSettings {
    fn default() -> Self {
        Self::from_config(&BounceConfig::default(), &LockConfig::default())
    }
}

pub struct BounceDeps {
    pub endpoints: Arc<dyn EndpointRepository>,
    pub ingestor: Arc<dyn BounceIngestor>,
    pub mutex: Arc<dyn ProcessMutex>,
    pub gate: Arc<dyn ConnectivityGate>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub sleeper: Arc<dyn Sleeper>,
    pub hooks: HookRegistry,
}

pub struct BounceJob {
    deps: BounceDeps,
    settings: BounceSettings,
    capability: WorkerCapability,
}

impl BounceJob {
    pub fn new(deps: BounceDeps, settings: BounceSettings, capability: WorkerCapability) -> Self {
        Self {
            deps,
            settings,
            capability,
        }
    }

    pub fn mode(&self) -> PassMode {
        if self.settings.parallel && self.capability.supports_parallel() {
            PassMode::Parallel
        } else {
            PassMode::Sequential
        }
    }

    pub fn run(&self) -> JobOutcome<PassReport> {
        let run_id = RunId::new();
        let span = info_span!("bounce", run_id = %run_id, fast = self.settings.fast);
        let _enter = span.enter();
        info!("starting bounce pass");

        if let Err(err) = self.deps.ingestor.check_ready() {
            error!(error = %err, "bounce ingestion is not available");
            return JobOutcome::NotReady(err.to_string());
        }

        let _lock = if self.settings.fast {
            None
        } else {
            match JobLock::acquire(
                self.deps.mutex.as_ref(),
                LockKey::for_job(LOCK_NAME),
                run_id,
                self.settings.lock_wait,
            ) {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    info!("cannot acquire lock, another pass is already running");
                    return JobOutcome::AlreadyRunning;
                }
                Err(err) => {
                    error!(error = %err, "job lock unavailable");
                    return JobOutcome::Crashed(err.to_string());
                }
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| self.pass(run_id))) {
            Ok(Ok(report)) => {
                info!(
                    mode = ?report.mode,
                    endpoints = report.endpoints,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "processing finished"
                );
                JobOutcome::Finished(report)
            }
            Ok(Err(err)) => {
                error!(error = %err, "bounce pass aborted");
                JobOutcome::Crashed(err.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "bounce pass panicked");
                JobOutcome::Crashed(message)
            }
        }
    }

    fn dispatch(&self, run_id: RunId, point: HookPoint) {
        self.deps.hooks.dispatch(&HookContext {
            job: JOB_NAME,
            run_id,
            point,
        });
    }

    fn pass(&self, run_id: RunId) -> Result<PassReport, StoreError> {
        let reset = self.deps.endpoints.reset_running()?;
        if reset > 0 {
            info!(reset, "reset endpoints left running by a previous pass");
        }

        self.dispatch(run_id, HookPoint::BeforeProcess);

        let endpoints = self.deps.endpoints.list_active()?;
        let mode = self.mode();
        info!(count = endpoints.len(), mode = ?mode, "found endpoints for processing");

        let mut report = PassReport {
            run_id,
            mode,
            reset,
            endpoints: endpoints.len(),
            succeeded: 0,
            failed: 0,
        };
        match mode {
            PassMode::Sequential => self.process_sequential(&endpoints, &mut report),
            PassMode::Parallel => self.process_parallel(&endpoints, &mut report),
        }

        self.dispatch(run_id, HookPoint::AfterProcess);
        Ok(report)
    }

    fn process_sequential(&self, endpoints: &[Endpoint], report: &mut PassReport) {
        for endpoint in endpoints {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                process_endpoint(self.deps.endpoints.as_ref(), self.deps.ingestor.as_ref(), endpoint)
            }));
            match result {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(endpoint_id = %endpoint.id, error = %err, "endpoint processing failed");
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        endpoint_id = %endpoint.id,
                        panic = %panic_message(payload.as_ref()),
                        "endpoint processing panicked"
                    );
                }
            }
        }
    }

    fn process_parallel(&self, endpoints: &[Endpoint], report: &mut PassReport) {
        let chunk_size = self.settings.workers.max(1);
        for chunk in endpoints.chunks(chunk_size) {
            gate::suspended(self.deps.gate.as_ref(), || self.run_chunk(chunk, report));
        }
    }

    fn run_chunk(&self, chunk: &[Endpoint], report: &mut PassReport) {
        let mut children: Vec<Box<dyn WorkerChild>> = Vec::with_capacity(chunk.len());
        for endpoint in chunk {
            match self.deps.launcher.launch(endpoint) {
                Ok(child) => {
                    debug!(endpoint_id = %endpoint.id, pid = child.id(), "worker launched");
                    children.push(child);
                }
                Err(source) => {
                    report.failed += 1;
                    let err = WorkerError::Launch {
                        endpoint: endpoint.id,
                        source,
                    };
                    warn!(error = %err, "skipping endpoint");
                }
            }
        }

        while !children.is_empty() {
            children.retain_mut(|child| match child.try_wait() {
                Ok(None) => true,
                Ok(Some(exit)) if exit.success() => {
                    report.succeeded += 1;
                    false
                }
                Ok(Some(exit)) => {
                    report.failed += 1;
                    let err = WorkerError::Exit {
                        endpoint: child.endpoint(),
                        code: exit.code,
                    };
                    warn!(error = %err, "worker failed");
                    false
                }
                Err(source) => {
                    report.failed += 1;
                    let err = WorkerError::Reap {
                        endpoint: child.endpoint(),
                        source,
                    };
                    warn!(error = %err, "worker lost");
                    false
                }
            });
            if !children.is_empty() {
                self.deps.sleeper.sleep(self.settings.poll_interval);
            }
        }
    }
}

impl core::fmt::Debug for BounceJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BounceJob")
            .field("settings", &self.settings)
            .field("capability", &self.capability)
            .field("hooks", &self.deps.hooks)
            .finish_non_exhaustive()
    }
}
