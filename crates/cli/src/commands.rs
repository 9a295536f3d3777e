//! Wiring of the jobs onto the production adapters.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use mailops_core::EndpointId;
use mailops_infra::backup::{BackupProvider, CommandBackup};
use mailops_infra::clock::ThreadSleeper;
use mailops_infra::config::AppConfig;
use mailops_infra::hooks::HookRegistry;
use mailops_infra::jobs::{
    AutoUpdateJob, BounceDeps, BounceJob, BounceSettings, CommandIngestor, JobOutcome,
    SelfExecLauncher, UpdateDeps, UpdateOutcome, UpdateSettings, WorkerCapability, run_worker,
};
use mailops_infra::lock::FileMutex;
use mailops_infra::process::{ProcessExecutor, SystemExecutor};
use mailops_infra::release::CurlReleaseSource;
use mailops_infra::store::{
    PgAccountDirectory, PgCampaignMonitor, PgConnectivityGate, PgDatabase, PgEndpointRepository,
    PgNotifier, PgSiteOptions,
};

/// Sender name on update notifications.
const NOTIFICATION_SENDER: &str = "MailOps";

pub struct Context {
    pub config_path: PathBuf,
    pub verbose: bool,
    pub cfg: AppConfig,
}

impl Context {
    fn database(&self) -> Result<Arc<PgDatabase>> {
        let db = &self.cfg.database;
        let url = db
            .url
            .as_deref()
            .context("database.url is not configured")?;
        let pg = PgDatabase::new(
            url,
            db.table_prefix.clone(),
            std::time::Duration::from_secs(db.connect_timeout_secs),
        )?;
        Ok(Arc::new(pg))
    }

    fn mutex(&self, job: &str) -> Arc<FileMutex> {
        Arc::new(FileMutex::new(&self.cfg.lock.dir).with_holder_label(format!("mailops {job}")))
    }

    /// Global arguments a worker child must be started with.
    fn worker_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--config"), self.config_path.clone().into()];
        if self.verbose {
            args.push("--verbose".into());
        }
        args
    }
}

pub fn auto_update(ctx: &Context) -> Result<i32> {
    let update = &ctx.cfg.update;
    let api_base = update
        .api_base
        .clone()
        .context("update.api_base is not configured")?;
    let db = ctx.database()?;
    let executor: Arc<dyn ProcessExecutor> = Arc::new(SystemExecutor::new());

    let backup = update.backup.as_ref().map(|cfg| {
        Arc::new(CommandBackup::new(executor.clone(), cfg)) as Arc<dyn BackupProvider>
    });

    let deps = UpdateDeps {
        executor: executor.clone(),
        releases: Arc::new(CurlReleaseSource::new(
            executor.clone(),
            update.tools.download.clone(),
            api_base,
        )),
        options: Arc::new(PgSiteOptions::new(db.clone())),
        campaigns: Arc::new(PgCampaignMonitor::new(db.clone())),
        accounts: Arc::new(PgAccountDirectory::new(db.clone())),
        notifier: Arc::new(PgNotifier::new(db.clone(), NOTIFICATION_SENDER)),
        backup,
        mutex: ctx.mutex("auto-update"),
        gate: Arc::new(PgConnectivityGate::new(db)),
        sleeper: Arc::new(ThreadSleeper),
        hooks: HookRegistry::new(),
    };
    let settings = UpdateSettings::from_config(update, &ctx.cfg.lock, ctx.verbose);

    let outcome = AutoUpdateJob::new(deps, settings).run();
    let code = outcome.exit_code();
    match &outcome {
        JobOutcome::Finished(report) => match &report.outcome {
            UpdateOutcome::UpToDate { installed, .. } => {
                info!(version = %installed, "already up to date");
            }
            UpdateOutcome::Updated { version, migrated } => {
                info!(version = %version, migrated, "update installed");
            }
            UpdateOutcome::Failed { step, error } => {
                warn!(step = %step, error = %error, exit_code = code, "update aborted");
            }
        },
        JobOutcome::AlreadyRunning => info!("another update holds the lock"),
        JobOutcome::NotReady(reason) => warn!(reason = %reason, "update not ready"),
        JobOutcome::Crashed(reason) => warn!(reason = %reason, "update crashed"),
    }
    Ok(code)
}

pub fn bounce(ctx: &Context, fast: Option<bool>) -> Result<i32> {
    let db = ctx.database()?;
    let executor: Arc<dyn ProcessExecutor> = Arc::new(SystemExecutor::new());
    let capability = WorkerCapability::detect(executor.as_ref());

    let mut settings = BounceSettings::from_config(&ctx.cfg.bounce, &ctx.cfg.lock);
    if let Some(fast) = fast {
        settings.fast = fast;
    }

    let deps = BounceDeps {
        endpoints: Arc::new(PgEndpointRepository::new(db.clone())),
        ingestor: Arc::new(CommandIngestor::new(
            executor,
            &ctx.cfg.bounce.ingest,
            ctx.verbose,
        )),
        mutex: ctx.mutex("bounce"),
        gate: Arc::new(PgConnectivityGate::new(db)),
        launcher: Arc::new(SelfExecLauncher::current(ctx.worker_args())?),
        sleeper: Arc::new(ThreadSleeper),
        hooks: HookRegistry::new(),
    };

    let outcome = BounceJob::new(deps, settings, capability).run();
    match &outcome {
        JobOutcome::Finished(report) => info!(
            mode = ?report.mode,
            endpoints = report.endpoints,
            succeeded = report.succeeded,
            failed = report.failed,
            "bounce pass finished"
        ),
        JobOutcome::AlreadyRunning => info!("another bounce pass holds the lock"),
        JobOutcome::NotReady(reason) => warn!(reason = %reason, "bounce pass not ready"),
        JobOutcome::Crashed(reason) => warn!(reason = %reason, "bounce pass crashed"),
    }
    Ok(outcome.exit_code())
}

pub fn bounce_worker(ctx: &Context, endpoint: u64) -> Result<i32> {
    let db = ctx.database()?;
    let endpoints = PgEndpointRepository::new(db);
    let ingestor = CommandIngestor::new(
        Arc::new(SystemExecutor::new()),
        &ctx.cfg.bounce.ingest,
        ctx.verbose,
    );
    Ok(run_worker(&endpoints, &ingestor, EndpointId::new(endpoint)))
}
