//! End-to-end runs of both jobs over in-memory stores and a scripted
//! process executor that plays curl, unzip, cp and the application console
//! against a real scratch directory.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use sha1::{Digest, Sha1};
    use url::Url;

    use mailops_core::{
        AccountId, EndpointId, EndpointStatus, ReleaseVersion, RunId, ServiceStatus, Signature,
    };

    use crate::clock::RecordingSleeper;
    use crate::config::{AppEntryConfig, ToolsConfig};
    use crate::gate::RecordingGate;
    use crate::hooks::{HookPoint, HookRegistry};
    use crate::jobs::{
        AutoUpdateJob, BounceDeps, BounceIngestor, BounceJob, BounceSettings, DrainPolicy, IngestError,
        JobOutcome, PassMode, ScriptedLauncher, UpdateDeps, UpdateError, UpdateOutcome, UpdateSettings,
        UpdateStep, WorkerCapability, run_worker,
    };
    use crate::lock::{FileMutex, LockKey, ProcessMutex};
    use crate::notify::RecordingNotifier;
    use crate::process::{CommandOutput, CommandSpec, ScriptedExecutor};
    use crate::release::CurlReleaseSource;
    use crate::store::{
        Account, Endpoint, EndpointRepository, InMemoryAccountDirectory, InMemoryEndpointRepository,
        InMemorySiteOptions, ScriptedCampaignMonitor, SiteOptions,
    };

    const ARCHIVE: &[u8] = b"PK\x03\x04 release 2.1.0";

    fn signature_of(bytes: &[u8]) -> Signature {
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&Sha1::digest(bytes));
        Signature::from_digest(&digest)
    }

    /// How the scripted tools behave.
    #[derive(Clone)]
    struct Remote {
        version: String,
        signature: Signature,
        copy_exit: i32,
        migrate_exit: i32,
    }

    impl Remote {
        fn release(version: &str) -> Self {
            Self {
                version: version.to_string(),
                signature: signature_of(ARCHIVE),
                copy_exit: 0,
                migrate_exit: 0,
            }
        }
    }

    fn respond(remote: &Remote, spec: &CommandSpec) -> CommandOutput {
        let last = spec
            .get_args()
            .last()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();
        match spec.program() {
            "curl" => {
                if let Some(dest) = spec.arg_after("--output") {
                    fs::write(dest, ARCHIVE).unwrap();
                    CommandOutput::success()
                } else if last.ends_with("/signature") {
                    CommandOutput::success()
                        .with_stdout([format!(r#"{{"signature":"{}"}}"#, remote.signature)])
                } else {
                    CommandOutput::success()
                        .with_stdout([format!(r#"{{"current_version":"{}"}}"#, remote.version)])
                }
            }
            "unzip" => {
                let dest = PathBuf::from(spec.arg_after("-d").unwrap());
                let folder = dest.join(format!("update-{}", remote.version)).join("apps");
                fs::create_dir_all(&folder).unwrap();
                fs::write(folder.join("VERSION"), &remote.version).unwrap();
                CommandOutput::success()
            }
            "cp" => {
                if remote.copy_exit == 0 {
                    fs::write(Path::new(&last).join("INSTALLED"), &remote.version).unwrap();
                }
                CommandOutput::failure(remote.copy_exit)
            }
            "php" => CommandOutput::failure(remote.migrate_exit),
            other => panic!("unexpected program {other}"),
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        executor: Arc<ScriptedExecutor>,
        options: Arc<InMemorySiteOptions>,
        campaigns: Arc<ScriptedCampaignMonitor>,
        notifier: Arc<RecordingNotifier>,
        gate: Arc<RecordingGate>,
        sleeper: Arc<RecordingSleeper>,
    }

    impl Harness {
        fn new(remote: Remote, campaigns: ScriptedCampaignMonitor) -> Self {
            Self::with_executor(
                ScriptedExecutor::new(move |spec| Ok(respond(&remote, spec))),
                campaigns,
            )
        }

        fn with_executor(executor: ScriptedExecutor, campaigns: ScriptedCampaignMonitor) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("app")).unwrap();
            Self {
                dir,
                executor: Arc::new(executor),
                options: Arc::new(InMemorySiteOptions::new(ReleaseVersion::new(2, 0, 0))),
                campaigns: Arc::new(campaigns),
                notifier: Arc::new(RecordingNotifier::new()),
                gate: Arc::new(RecordingGate::new()),
                sleeper: Arc::new(RecordingSleeper::new()),
            }
        }

        fn storage(&self) -> PathBuf {
            self.dir.path().join("runtime").join("auto-update")
        }

        fn install_root(&self) -> PathBuf {
            self.dir.path().join("app")
        }

        fn lock_dir(&self) -> PathBuf {
            self.dir.path().join("locks")
        }

        fn job(&self) -> AutoUpdateJob {
            self.job_with_hooks(HookRegistry::new())
        }

        fn job_with_hooks(&self, hooks: HookRegistry) -> AutoUpdateJob {
            let releases = CurlReleaseSource::new(
                self.executor.clone(),
                "curl",
                Url::parse("https://releases.example.com/api").unwrap(),
            );
            AutoUpdateJob::new(
                UpdateDeps {
                    executor: self.executor.clone(),
                    releases: Arc::new(releases),
                    options: self.options.clone(),
                    campaigns: self.campaigns.clone(),
                    accounts: Arc::new(InMemoryAccountDirectory::new([
                        Account {
                            id: AccountId::new(1),
                            name: "Ada Admin".to_string(),
                            email: "ada@example.com".to_string(),
                        },
                        Account {
                            id: AccountId::new(2),
                            name: "Sam Ops".to_string(),
                            email: "sam@example.com".to_string(),
                        },
                    ])),
                    notifier: self.notifier.clone(),
                    backup: None,
                    mutex: Arc::new(FileMutex::new(self.lock_dir())),
                    gate: self.gate.clone(),
                    sleeper: self.sleeper.clone(),
                    hooks,
                },
                UpdateSettings {
                    platform: "linux-x86_64".to_string(),
                    storage_dir: self.storage(),
                    install_root: self.install_root(),
                    license_key: "lic-0001".to_string(),
                    tools: ToolsConfig::default(),
                    app: AppEntryConfig::default(),
                    drain: DrainPolicy::new(Duration::from_secs(30), Duration::from_secs(120)),
                    lock_wait: Duration::from_millis(50),
                    verbose: false,
                },
            )
        }
    }

    #[test]
    fn newer_release_is_installed_end_to_end() {
        let h = Harness::new(Remote::release("2.1.0"), ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 0);
        let report = outcome.report().unwrap();
        assert!(matches!(
            &report.outcome,
            UpdateOutcome::Updated { version, migrated: true } if *version == ReleaseVersion::new(2, 1, 0)
        ));
        assert_eq!(h.options.status_writes(), vec![ServiceStatus::Offline, ServiceStatus::Online]);
        assert_eq!(h.options.service_status().unwrap(), ServiceStatus::Online);
        assert_eq!(
            fs::read_to_string(h.install_root().join("INSTALLED")).unwrap(),
            "2.1.0"
        );
        assert_eq!(h.executor.programs(), vec!["curl", "curl", "curl", "unzip", "cp", "php"]);

        let migrate = h.executor.calls().pop().unwrap();
        assert_eq!(migrate.get_current_dir(), Some(h.install_root().as_path()));
        assert!(migrate.get_args().iter().any(|a| a == "--interactive=0"));

        assert!(!h.storage().join("update-2.1.0.zip").exists());
        assert!(!h.storage().join("update-2.1.0").exists());
        assert!(h.gate.is_active());

        let emails = h.notifier.emails();
        assert_eq!(emails.len(), 2);
        assert_eq!(h.notifier.messages().len(), 2);
        let body = &emails[0].1.body;
        for step in ["Version 2.1.0 is available", "The signature matches", "Done!"] {
            assert!(body.contains(step), "digest lacks {step:?}");
        }
        assert_eq!(report.notified.as_ref().unwrap().failures, 0);
    }

    #[test]
    fn older_remote_version_is_a_silent_no_op() {
        let h = Harness::new(Remote::release("1.9.0"), ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 0);
        let report = outcome.report().unwrap();
        assert!(matches!(report.outcome, UpdateOutcome::UpToDate { .. }));
        assert!(report.notified.is_none());
        assert!(!h.storage().exists());
        assert!(h.notifier.emails().is_empty());
        assert!(h.options.status_writes().is_empty());
        assert_eq!(h.executor.programs(), vec!["curl"]);
    }

    #[test]
    fn equal_version_is_up_to_date() {
        let h = Harness::new(Remote::release("2.0.0"), ScriptedCampaignMonitor::new([0]));
        let outcome = h.job().run();
        assert!(matches!(
            outcome.report().unwrap().outcome,
            UpdateOutcome::UpToDate { .. }
        ));
    }

    #[test]
    fn short_published_version_is_fetched_as_published() {
        let h = Harness::new(Remote::release("2.1"), ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 0);
        let download = h
            .executor
            .calls()
            .into_iter()
            .find(|c| c.arg_after("--output").is_some())
            .unwrap();
        assert_eq!(
            download.get_args().last().unwrap(),
            "https://releases.example.com/api/download/update/2.1"
        );
        assert!(!h.storage().join("update-2.1.zip").exists());
    }

    #[test]
    fn tampered_archive_is_discarded_and_never_installed() {
        let mut remote = Remote::release("2.1.0");
        remote.signature = signature_of(b"something else");
        let h = Harness::new(remote, ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 1);
        let report = outcome.report().unwrap();
        assert!(matches!(
            report.outcome,
            UpdateOutcome::Failed {
                step: UpdateStep::Verify,
                error: UpdateError::Integrity { .. }
            }
        ));
        assert!(!h.storage().join("update-2.1.0.zip").exists());
        assert!(!h.executor.programs().iter().any(|p| p == "unzip" || p == "cp"));
        assert!(h.options.status_writes().is_empty());
        // Past the version check, so operators hear about it.
        assert_eq!(h.notifier.emails().len(), 2);
    }

    #[test]
    fn drain_timeout_restores_the_service() {
        let h = Harness::new(Remote::release("2.1.0"), ScriptedCampaignMonitor::always_busy(3));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.report().unwrap().failed_step(), Some(UpdateStep::Drain));
        assert_eq!(h.options.status_writes(), vec![ServiceStatus::Offline, ServiceStatus::Online]);
        assert_eq!(h.campaigns.polls(), 4);
        assert_eq!(h.sleeper.total(), Duration::from_secs(120));
        assert!(!h.executor.programs().iter().any(|p| p == "unzip"));
        assert!(!h.storage().join("update-2.1.0.zip").exists());
    }

    #[test]
    fn failed_copy_leaves_the_service_offline() {
        let mut remote = Remote::release("2.1.0");
        remote.copy_exit = 1;
        let h = Harness::new(remote, ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(h.options.status_writes(), vec![ServiceStatus::Offline]);
        assert_eq!(h.options.service_status().unwrap(), ServiceStatus::Offline);
        assert!(!h.executor.programs().iter().any(|p| p == "php"));
        assert_eq!(h.notifier.emails().len(), 2);
    }

    #[test]
    fn failed_migration_is_reported_but_not_fatal() {
        let mut remote = Remote::release("2.1.0");
        remote.migrate_exit = 255;
        let h = Harness::new(remote, ScriptedCampaignMonitor::new([0]));

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 0);
        assert!(matches!(
            outcome.report().unwrap().outcome,
            UpdateOutcome::Updated { migrated: false, .. }
        ));
        assert_eq!(h.options.status_writes(), vec![ServiceStatus::Offline, ServiceStatus::Offline]);
        assert!(!h.storage().join("update-2.1.0").exists());
    }

    #[test]
    fn missing_tool_fails_before_any_remote_call() {
        let remote = Remote::release("2.1.0");
        let h = Harness::with_executor(
            ScriptedExecutor::new(move |spec| Ok(respond(&remote, spec))).missing("unzip"),
            ScriptedCampaignMonitor::new([0]),
        );

        let outcome = h.job().run();

        assert_eq!(outcome.exit_code(), 1);
        assert!(h.executor.calls().is_empty());
        assert!(h.notifier.emails().is_empty());
    }

    #[test]
    fn concurrent_update_is_turned_away() {
        let h = Harness::new(Remote::release("2.1.0"), ScriptedCampaignMonitor::new([0]));
        let holder = FileMutex::new(h.lock_dir());
        let key = LockKey::for_job(crate::jobs::auto_update::LOCK_NAME);
        assert!(holder.acquire(&key, RunId::new(), Duration::ZERO).unwrap());

        let outcome = h.job().run();

        assert!(matches!(outcome, JobOutcome::AlreadyRunning));
        assert_eq!(outcome.exit_code(), 0);
        assert!(h.executor.calls().is_empty());

        holder.release(&key);
        assert_eq!(h.job().run().exit_code(), 0);
    }

    #[test]
    fn lock_file_names_the_run_holding_it() {
        let h = Harness::new(Remote::release("1.9.0"), ScriptedCampaignMonitor::new([0]));
        let lock_path = FileMutex::new(h.lock_dir())
            .path_for(&LockKey::for_job(crate::jobs::auto_update::LOCK_NAME));
        let seen = Arc::new(Mutex::new(None));

        let mut hooks = HookRegistry::new();
        let sink = seen.clone();
        hooks.register(HookPoint::BeforeProcess, "read-lock", move |ctx| {
            let record = fs::read_to_string(&lock_path)?;
            *sink.lock().unwrap() = Some((ctx.run_id, record));
            Ok(())
        });

        let outcome = h.job_with_hooks(hooks).run();

        let report = outcome.report().unwrap();
        let (run_id, record) = seen.lock().unwrap().take().unwrap();
        assert_eq!(run_id, report.log.run_id());
        assert!(record.contains(&format!("pid={}", std::process::id())));
        assert!(record.contains(&format!("run_id={run_id}")));
    }

    struct FlakyIngestor;

    impl BounceIngestor for FlakyIngestor {
        fn check_ready(&self) -> Result<(), IngestError> {
            Ok(())
        }

        fn ingest(&self, endpoint: &Endpoint) -> Result<(), IngestError> {
            match endpoint.id.get() {
                3 => Err(IngestError::Failed(Some(1))),
                5 => panic!("corrupt mailbox"),
                _ => Ok(()),
            }
        }
    }

    fn bounce_pass(parallel: bool) -> (Arc<InMemoryEndpointRepository>, crate::jobs::PassReport) {
        let repo = Arc::new(InMemoryEndpointRepository::new(
            (1..=6).map(|id| Endpoint::new(id, format!("imap{id}.example.com"), "bounces")),
        ));
        repo.set_status(EndpointId::new(6), EndpointStatus::Running).unwrap();
        let ingestor = Arc::new(FlakyIngestor);

        let launcher = {
            let repo = repo.clone();
            let ingestor = ingestor.clone();
            ScriptedLauncher::new(2)
                .on_launch(move |endpoint| run_worker(repo.as_ref(), ingestor.as_ref(), endpoint.id))
        };
        let lock_dir = tempfile::tempdir().unwrap();

        let job = BounceJob::new(
            BounceDeps {
                endpoints: repo.clone(),
                ingestor,
                mutex: Arc::new(FileMutex::new(lock_dir.path())),
                gate: Arc::new(RecordingGate::new()),
                launcher: Arc::new(launcher),
                sleeper: Arc::new(RecordingSleeper::new()),
                hooks: HookRegistry::new(),
            },
            BounceSettings {
                fast: false,
                lock_wait: Duration::from_millis(50),
                parallel,
                workers: 4,
                poll_interval: Duration::from_secs(1),
            },
            WorkerCapability::available(),
        );

        let outcome = job.run();
        assert_eq!(outcome.exit_code(), 0);
        let report = outcome.report().cloned().unwrap();
        (repo, report)
    }

    #[test]
    fn one_bad_endpoint_never_stops_the_others_in_either_mode() {
        for (parallel, mode) in [(false, PassMode::Sequential), (true, PassMode::Parallel)] {
            let (repo, report) = bounce_pass(parallel);

            assert_eq!(report.mode, mode);
            assert_eq!(report.reset, 1);
            assert_eq!(report.endpoints, 6);
            assert_eq!((report.succeeded, report.failed), (4, 2), "{mode:?}");
            for id in [1, 2, 3, 4, 6] {
                assert_eq!(
                    repo.status_of(EndpointId::new(id)),
                    Some(EndpointStatus::Active),
                    "{mode:?} endpoint {id}"
                );
            }
        }
    }
}
