//! Self-update of the host application.
//!
//! A strictly sequential pipeline: check prerequisites, compare versions,
//! fetch and verify the release archive, take the service offline, wait for
//! running campaigns, install, migrate, clean up, restore the service and
//! notify operators. Any aborting step ends the run with a step-specific
//! failure; there is no rollback. Once files may have been replaced the
//! service stays offline until an operator intervenes.

use std::io;
use std::path::PathBuf;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, info_span, warn};

use mailops_core::{ReleaseVersion, RunId, RunLog, ServiceStatus, Signature};

use super::drain::{DrainOutcome, DrainPolicy, wait_for_drain};
use super::outcome::{JobOutcome, JobReport, panic_message};
use super::workspace::UpdateWorkspace;
use crate::backup::{BackupProvider, clean_log_line};
use crate::clock::Sleeper;
use crate::config::{AppEntryConfig, LockConfig, ToolsConfig, UpdateConfig};
use crate::gate::{self, ConnectivityGate};
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::integrity;
use crate::lock::{JobLock, LockKey, ProcessMutex};
use crate::notify::{DeliveryReport, Notification, Notifier, notify_accounts};
use crate::process::{CommandSpec, ProcessExecutor};
use crate::release::{ReleaseError, ReleaseQuery, ReleaseSource};
use crate::store::{AccountDirectory, CampaignMonitor, SiteOptions, StoreError};

pub const JOB_NAME: &str = "auto-update";

pub const LOCK_NAME: &str = "mailops::jobs::auto_update::AutoUpdateJob::run";

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStep {
    CheckPrereqs,
    CheckVersion,
    PrepareWorkspace,
    Backup,
    FetchSignature,
    Download,
    Verify,
    DisableService,
    Drain,
    Extract,
    Install,
    Migrate,
    Cleanup,
    RestoreService,
    Notify,
}

impl UpdateStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStep::CheckPrereqs => "check_prereqs",
            UpdateStep::CheckVersion => "check_version",
            UpdateStep::PrepareWorkspace => "prepare_workspace",
            UpdateStep::Backup => "backup",
            UpdateStep::FetchSignature => "fetch_signature",
            UpdateStep::Download => "download",
            UpdateStep::Verify => "verify",
            UpdateStep::DisableService => "disable_service",
            UpdateStep::Drain => "drain",
            UpdateStep::Extract => "extract",
            UpdateStep::Install => "install",
            UpdateStep::Migrate => "migrate",
            UpdateStep::Cleanup => "cleanup",
            UpdateStep::RestoreService => "restore_service",
            UpdateStep::Notify => "notify",
        }
    }
}

impl core::fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("missing prerequisite: {0}")]
    Prerequisite(String),
    #[error("transport failure: {0}")]
    Transport(#[source] ReleaseError),
    #[error("workspace unusable: {0}")]
    Workspace(#[source] io::Error),
    #[error("signature mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: Signature, actual: Signature },
    #[error("campaigns still processing after {waited_secs}s")]
    DrainTimeout { waited_secs: u64 },
    #[error("install failed: {0}")]
    Install(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UpdateError {
    /// Collaborator failures outside the step taxonomy.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, UpdateError::Store(_) | UpdateError::Io(_))
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    UpToDate {
        installed: ReleaseVersion,
        remote: ReleaseVersion,
    },
    /// Files were replaced; `migrated` says whether the upgrade routine succeeded.
    Updated {
        version: ReleaseVersion,
        migrated: bool,
    },
    Failed {
        step: UpdateStep,
        error: UpdateError,
    },
}

#[derive(Debug)]
pub struct UpdateReport {
    pub outcome: UpdateOutcome,
    pub log: RunLog,
    /// `None` when the run never became notifiable.
    pub notified: Option<DeliveryReport>,
}

impl UpdateReport {
    pub fn failed_step(&self) -> Option<UpdateStep> {
        match &self.outcome {
            UpdateOutcome::Failed { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl JobReport for UpdateReport {
    fn exit_code(&self) -> i32 {
        match &self.outcome {
            UpdateOutcome::UpToDate { .. } | UpdateOutcome::Updated { .. } => 0,
            UpdateOutcome::Failed { .. } => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub platform: String,
    pub storage_dir: PathBuf,
    pub install_root: PathBuf,
    pub license_key: String,
    pub tools: ToolsConfig,
    pub app: AppEntryConfig,
    pub drain: DrainPolicy,
    pub lock_wait: Duration,
    /// Forwarded to the upgrade routine.
    pub verbose: bool,
}

impl UpdateSettings {
    pub fn from_config(update: &UpdateConfig, lock: &LockConfig, verbose: bool) -> Self {
        Self {
            platform: update.platform.clone(),
            storage_dir: update.storage_dir.clone(),
            install_root: update.install_root.clone(),
            license_key: update.license_key.clone(),
            tools: update.tools.clone(),
            app: update.app.clone(),
            drain: DrainPolicy::new(
                Duration::from_secs(update.drain.interval_secs),
                Duration::from_secs(update.drain.ceiling_secs),
            ),
            lock_wait: lock.wait(),
            verbose,
        }
    }
}

pub struct UpdateDeps {
    pub executor: Arc<dyn ProcessExecutor>,
    pub releases: Arc<dyn ReleaseSource>,
    pub options: Arc<dyn SiteOptions>,
    pub campaigns: Arc<dyn CampaignMonitor>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub backup: Option<Arc<dyn BackupProvider>>,
    pub mutex: Arc<dyn ProcessMutex>,
    pub gate: Arc<dyn ConnectivityGate>,
    pub sleeper: Arc<dyn Sleeper>,
    pub hooks: HookRegistry,
}

/// Progress that outlives an aborted or panicking pipeline.
#[derive(Debug, Default)]
struct RunState {
    notifiable: bool,
    workspace: Option<UpdateWorkspace>,
}

type StepResult<T> = Result<T, (UpdateStep, UpdateError)>;

trait AtStep<T> {
    fn at(self, step: UpdateStep) -> StepResult<T>;
}

impl<T, E: Into<UpdateError>> AtStep<T> for Result<T, E> {
    fn at(self, step: UpdateStep) -> StepResult<T> {
        self.map_err(|e| (step, e.into()))
    }
}

pub struct AutoUpdateJob {
    deps: UpdateDeps,
    settings: UpdateSettings,
}

impl AutoUpdateJob {
    pub fn new(deps: UpdateDeps, settings: UpdateSettings) -> Self {
        Self { deps, settings }
    }

    pub fn run(&self) -> JobOutcome<UpdateReport> {
        let run_id = RunId::new();
        let span = info_span!("auto_update", run_id = %run_id);
        let _enter = span.enter();

        let _lock = match JobLock::acquire(
            self.deps.mutex.as_ref(),
            LockKey::for_job(LOCK_NAME),
            run_id,
            self.settings.lock_wait,
        ) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!("cannot acquire lock, another update is already running");
                return JobOutcome::AlreadyRunning;
            }
            Err(err) => {
                error!(error = %err, "job lock unavailable");
                return JobOutcome::Crashed(err.to_string());
            }
        };

        self.dispatch(run_id, HookPoint::BeforeProcess);

        let mut log = RunLog::new(JOB_NAME, run_id);
        let mut state = RunState::default();
        let pipeline =
            panic::catch_unwind(AssertUnwindSafe(|| self.pipeline(&mut log, &mut state)));

        let outcome = match pipeline {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err((step, error))) => {
                if error.is_unexpected() {
                    error!(step = %step, error = %error, "update interrupted by a collaborator failure");
                }
                log.warn(format!("The update failed at step {step}: {error}"));
                self.abandon_workspace(&mut log, &state);
                Ok(UpdateOutcome::Failed { step, error })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log.warn(format!("The update was interrupted by an unexpected error: {message}"));
                self.abandon_workspace(&mut log, &state);
                Err(message)
            }
        };

        let notified = state.notifiable.then(|| self.notify(&log)).flatten();

        self.dispatch(run_id, HookPoint::AfterProcess);

        match outcome {
            Ok(outcome) => JobOutcome::Finished(UpdateReport {
                outcome,
                log,
                notified,
            }),
            Err(message) => JobOutcome::Crashed(message),
        }
    }

    fn dispatch(&self, run_id: RunId, point: HookPoint) {
        self.deps.hooks.dispatch(&HookContext {
            job: JOB_NAME,
            run_id,
            point,
        });
    }

    fn abandon_workspace(&self, log: &mut RunLog, state: &RunState) {
        if let Some(workspace) = &state.workspace {
            if let Err(err) = workspace.cleanup() {
                log.warn(format!("Unable to remove the update workspace: {err}"));
            }
        }
    }

    fn notify(&self, log: &RunLog) -> Option<DeliveryReport> {
        let notification = Notification::update_digest(log);
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
            notify_accounts(
                self.deps.accounts.as_ref(),
                self.deps.notifier.as_ref(),
                &notification,
            )
        }));
        match delivered {
            Ok(Ok(report)) => Some(report),
            Ok(Err(err)) => {
                warn!(step = %UpdateStep::Notify, error = %err, "notifications not sent");
                None
            }
            Err(payload) => {
                warn!(
                    step = %UpdateStep::Notify,
                    panic = %panic_message(payload.as_ref()),
                    "notifications not sent"
                );
                None
            }
        }
    }

    fn pipeline(&self, log: &mut RunLog, state: &mut RunState) -> StepResult<UpdateOutcome> {
        self.check_prereqs(log)?;

        let (installed, remote) = self.check_version(log)?;
        if !remote.is_newer_than(&installed) {
            log.record(format!(
                "Already at the latest version ({installed}), nothing to do."
            ));
            return Ok(UpdateOutcome::UpToDate { installed, remote });
        }
        log.record(format!("Version {remote} is available, installed is {installed}."));
        state.notifiable = true;

        let workspace = UpdateWorkspace::new(&self.settings.storage_dir, remote.clone());
        state.workspace = Some(workspace.clone());
        workspace
            .prepare()
            .map_err(|e| (UpdateStep::PrepareWorkspace, UpdateError::Workspace(e)))?;

        self.try_backup(log);

        log.record("Fetching the file signature...");
        let expected = self
            .deps
            .releases
            .signature(&remote)
            .map_err(|e| (UpdateStep::FetchSignature, UpdateError::Transport(e)))?;
        log.record(format!("The file signature is {expected}"));

        self.download(log, &remote, &workspace)?;
        self.verify(log, &workspace, &expected)?;

        self.deps
            .options
            .set_service_status(ServiceStatus::Offline)
            .at(UpdateStep::DisableService)?;
        log.record("The application is now offline.");

        self.drain(log)?;
        self.extract(log, &workspace)?;
        self.install(log, &workspace)?;

        let migrated = self.migrate(log);

        log.record("Removing the update archive and folder...");
        if let Err(err) = workspace.cleanup() {
            log.warn(format!("Unable to remove the update workspace: {err}"));
        }

        self.deps
            .options
            .set_service_status(ServiceStatus::from_online(migrated))
            .at(UpdateStep::RestoreService)?;
        if migrated {
            log.record("The application is back online.");
        } else {
            log.warn("The application stays offline until the upgrade is completed manually.");
        }

        log.record("Done!");
        Ok(UpdateOutcome::Updated {
            version: remote,
            migrated,
        })
    }

    fn check_prereqs(&self, log: &mut RunLog) -> StepResult<()> {
        let step = UpdateStep::CheckPrereqs;
        log.record("Checking the system for required capabilities and binaries...");
        if !self.deps.executor.can_spawn() {
            return Err((
                step,
                UpdateError::Prerequisite("external processes cannot be spawned".to_string()),
            ));
        }
        let tools = &self.settings.tools;
        for tool in [&tools.download, &tools.extract, &tools.copy] {
            if !self.deps.executor.resolve(tool) {
                return Err((
                    step,
                    UpdateError::Prerequisite(format!("required binary `{tool}` was not found")),
                ));
            }
        }
        log.record("All capabilities and binaries are in place.");
        Ok(())
    }

    fn check_version(&self, log: &mut RunLog) -> StepResult<(ReleaseVersion, ReleaseVersion)> {
        let step = UpdateStep::CheckVersion;
        log.record("Fetching the latest version number...");
        let installed = self.deps.options.app_version().at(step)?;
        let remote = self
            .deps
            .releases
            .latest_version(&ReleaseQuery {
                platform: self.settings.platform.clone(),
                app_version: installed.clone(),
            })
            .map_err(|e| (step, UpdateError::Transport(e)))?;
        Ok((installed, remote))
    }

    fn try_backup(&self, log: &mut RunLog) {
        log.record("Trying to back up the application before the update...");
        let provider = match &self.deps.backup {
            Some(provider) if provider.is_enabled() => provider,
            Some(_) => {
                log.record("The backup provider is disabled, no backup can be made.");
                return;
            }
            None => {
                log.record("No backup provider is configured, no backup can be made.");
                return;
            }
        };

        match provider.backup() {
            Ok(lines) => {
                log.record("Finished the backup process, here is the output:");
                for line in lines.iter().filter_map(|l| clean_log_line(l)) {
                    log.record(line);
                }
            }
            Err(err) => log.warn(format!("The backup failed: {err}")),
        }
    }

    fn download(
        &self,
        log: &mut RunLog,
        version: &ReleaseVersion,
        workspace: &UpdateWorkspace,
    ) -> StepResult<()> {
        let step = UpdateStep::Download;
        log.record("Downloading the update file, this might take a while...");
        let archive = workspace.archive_path();
        gate::suspended(self.deps.gate.as_ref(), || {
            self.deps
                .releases
                .download(version, &self.settings.license_key, &archive)
        })
        .map_err(|e| (step, UpdateError::Transport(e)))?;

        if !archive.is_file() {
            return Err((
                step,
                UpdateError::Transport(ReleaseError::MissingArtifact(archive.display().to_string())),
            ));
        }
        log.record("Download complete, checking the signature...");
        Ok(())
    }

    fn verify(
        &self,
        log: &mut RunLog,
        workspace: &UpdateWorkspace,
        expected: &Signature,
    ) -> StepResult<()> {
        let step = UpdateStep::Verify;
        let actual = integrity::file_signature(&workspace.archive_path()).at(step)?;
        if &actual != expected {
            if let Err(err) = workspace.discard_archive() {
                log.warn(format!("Unable to remove the rejected archive: {err}"));
            }
            return Err((
                step,
                UpdateError::Integrity {
                    expected: expected.clone(),
                    actual,
                },
            ));
        }
        log.record("The signature matches.");
        Ok(())
    }

    fn drain(&self, log: &mut RunLog) -> StepResult<()> {
        let step = UpdateStep::Drain;
        log.record("Waiting for running campaigns to finish...");
        let drained = wait_for_drain(
            self.deps.campaigns.as_ref(),
            self.deps.gate.as_ref(),
            self.deps.sleeper.as_ref(),
            self.settings.drain,
        );

        let error = match drained {
            Ok(DrainOutcome::Drained { waited, .. }) => {
                log.record(format!(
                    "Done waiting for campaigns to finish, it took {} seconds.",
                    waited.as_secs()
                ));
                return Ok(());
            }
            Ok(DrainOutcome::TimedOut { waited, .. }) => {
                log.warn(format!(
                    "After waiting for {} seconds campaigns are still running, giving up.",
                    waited.as_secs()
                ));
                UpdateError::DrainTimeout {
                    waited_secs: waited.as_secs(),
                }
            }
            Err(err) => err.into(),
        };

        // No file was touched yet; bring the service back.
        if let Err(err) = self.deps.options.set_service_status(ServiceStatus::Online) {
            log.warn(format!("Unable to put the application back online: {err}"));
        } else {
            log.record("The application is back online.");
        }
        Err((step, error))
    }

    fn extract(&self, log: &mut RunLog, workspace: &UpdateWorkspace) -> StepResult<()> {
        let step = UpdateStep::Extract;
        log.record("Unzipping the update archive...");
        let spec = CommandSpec::new(self.settings.tools.extract.clone())
            .arg("-o")
            .arg(workspace.archive_path())
            .arg("-d")
            .arg(workspace.root());
        let output = gate::suspended(self.deps.gate.as_ref(), || self.deps.executor.run(&spec))
            .map_err(|e| (step, UpdateError::Install(e.to_string())))?;

        if !output.is_success() {
            return Err((
                step,
                UpdateError::Install(format!(
                    "unable to unzip the archive (exit status {:?})",
                    output.code
                )),
            ));
        }
        let folder = workspace.folder_path();
        if !folder.is_dir() {
            return Err((
                step,
                UpdateError::Install(format!("{} missing after extraction", folder.display())),
            ));
        }
        log.record("The archive has been unzipped successfully.");
        Ok(())
    }

    fn install(&self, log: &mut RunLog, workspace: &UpdateWorkspace) -> StepResult<()> {
        let step = UpdateStep::Install;
        log.record("Copying the files over the installation...");
        let spec = CommandSpec::new(self.settings.tools.copy.clone())
            .arg("-Rf")
            .arg(workspace.folder_path().join("."))
            .arg(&self.settings.install_root);
        let output = gate::suspended(self.deps.gate.as_ref(), || self.deps.executor.run(&spec))
            .map_err(|e| (step, UpdateError::Install(e.to_string())))?;

        if !output.is_success() {
            return Err((
                step,
                UpdateError::Install(format!(
                    "unable to copy the files (exit status {:?})",
                    output.code
                )),
            ));
        }
        log.record("The files were copied successfully.");
        Ok(())
    }

    /// Run the application's upgrade routine; `true` on a zero exit.
    fn migrate(&self, log: &mut RunLog) -> bool {
        log.record("Starting the upgrade process...");
        let app = &self.settings.app;
        let mut spec = CommandSpec::new(app.program.clone())
            .args(&app.args)
            .arg("update")
            .arg("--interactive=0")
            .current_dir(&self.settings.install_root);
        if self.settings.verbose {
            spec = spec.arg("--verbose=1");
        }

        match self.deps.executor.run(&spec) {
            Ok(output) if output.is_success() => {
                log.record("The upgrade process finished successfully.");
                true
            }
            Ok(output) => {
                log.warn(format!(
                    "The upgrade process has failed (exit status {:?}).",
                    output.code
                ));
                false
            }
            Err(err) => {
                log.warn(format!("The upgrade process could not be started: {err}"));
                false
            }
        }
    }
}

impl core::fmt::Debug for AutoUpdateJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AutoUpdateJob")
            .field("settings", &self.settings)
            .field("hooks", &self.deps.hooks)
            .finish_non_exhaustive()
    }
}
