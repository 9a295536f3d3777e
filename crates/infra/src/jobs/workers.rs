//! Worker processes for the parallel bounce pass.
//!
//! Each endpoint of a chunk is handed to a child process. The production
//! launcher re-executes the current binary with the hidden worker sub-command,
//! so children start from a clean process image instead of a fork of a parent
//! that holds open connections.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use mailops_core::EndpointId;

use crate::process::ProcessExecutor;
use crate::store::Endpoint;

/// Sub-command a worker child is started with.
pub const WORKER_SUBCOMMAND: &str = "bounce-worker";

/// Whether this host can run the parallel strategy. Computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCapability {
    can_launch: bool,
    can_reap: bool,
}

impl WorkerCapability {
    pub fn detect(executor: &dyn ProcessExecutor) -> Self {
        Self {
            can_launch: executor.can_spawn() && std::env::current_exe().is_ok(),
            can_reap: cfg!(any(unix, windows)),
        }
    }

    pub fn available() -> Self {
        Self {
            can_launch: true,
            can_reap: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            can_launch: false,
            can_reap: false,
        }
    }

    pub fn supports_parallel(&self) -> bool {
        self.can_launch && self.can_reap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A launched worker.
pub trait WorkerChild: Send {
    fn id(&self) -> u32;

    fn endpoint(&self) -> EndpointId;

    /// Non-blocking: `Ok(None)` while the child is still running.
    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>>;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<Box<dyn WorkerChild>>;
}

/// Starts `<program> <leading args> bounce-worker --endpoint <id>`.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl SelfExecLauncher {
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Launcher re-executing the running binary.
    pub fn current(leading_args: Vec<OsString>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, leading_args))
    }

    fn command(&self, endpoint: &Endpoint) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(WORKER_SUBCOMMAND)
            .arg("--endpoint")
            .arg(endpoint.id.to_string())
            .stdin(Stdio::null());
        cmd
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<Box<dyn WorkerChild>> {
        let child = self.command(endpoint).spawn()?;
        Ok(Box::new(ProcessWorker {
            child,
            endpoint: endpoint.id,
        }))
    }
}

struct ProcessWorker {
    child: Child,
    endpoint: EndpointId,
}

impl WorkerChild for ProcessWorker {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| WorkerExit { code: status.code() }))
    }
}

type LaunchHook = Box<dyn Fn(&Endpoint) -> i32 + Send + Sync>;

#[derive(Debug, Default)]
struct Occupancy {
    alive: usize,
    peak: usize,
}

/// In-process launcher (tests/dev).
///
/// The launch hook runs synchronously and yields the child's exit code; the
/// child then reports that exit after `polls_to_exit` sweeps.
pub struct ScriptedLauncher {
    polls_to_exit: usize,
    on_launch: LaunchHook,
    failing: HashSet<EndpointId>,
    launched: Mutex<Vec<EndpointId>>,
    occupancy: Arc<Mutex<Occupancy>>,
}

impl ScriptedLauncher {
    pub fn new(polls_to_exit: usize) -> Self {
        Self {
            polls_to_exit,
            on_launch: Box::new(|_| 0),
            failing: HashSet::new(),
            launched: Mutex::new(Vec::new()),
            occupancy: Arc::new(Mutex::new(Occupancy::default())),
        }
    }

    pub fn on_launch<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Endpoint) -> i32 + Send + Sync + 'static,
    {
        self.on_launch = Box::new(hook);
        self
    }

    /// Refuse to launch a worker for `endpoint`.
    pub fn failing_for(mut self, endpoint: EndpointId) -> Self {
        self.failing.insert(endpoint);
        self
    }

    pub fn launched(&self) -> Vec<EndpointId> {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Largest number of simultaneously running children observed.
    pub fn peak_concurrency(&self) -> usize {
        self.occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peak
    }

    pub fn running(&self) -> usize {
        self.occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alive
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<Box<dyn WorkerChild>> {
        if self.failing.contains(&endpoint.id) {
            return Err(io::Error::other(format!("cannot launch worker for {}", endpoint.id)));
        }
        let code = (self.on_launch)(endpoint);
        let id = {
            let mut launched = self.launched.lock().unwrap_or_else(PoisonError::into_inner);
            launched.push(endpoint.id);
            u32::try_from(launched.len()).unwrap_or(u32::MAX)
        };
        {
            let mut occ = self.occupancy.lock().unwrap_or_else(PoisonError::into_inner);
            occ.alive += 1;
            occ.peak = occ.peak.max(occ.alive);
        }
        Ok(Box::new(ScriptedWorker {
            id,
            endpoint: endpoint.id,
            remaining: self.polls_to_exit,
            code,
            occupancy: self.occupancy.clone(),
            exited: false,
        }))
    }
}

impl core::fmt::Debug for ScriptedLauncher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptedLauncher")
            .field("polls_to_exit", &self.polls_to_exit)
            .field("failing", &self.failing)
            .finish_non_exhaustive()
    }
}

struct ScriptedWorker {
    id: u32,
    endpoint: EndpointId,
    remaining: usize,
    code: i32,
    occupancy: Arc<Mutex<Occupancy>>,
    exited: bool,
}

impl WorkerChild for ScriptedWorker {
    fn id(&self) -> u32 {
        self.id
    }

    fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        if self.remaining > 0 {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return Ok(None);
        }
        if !self.exited {
            self.exited = true;
            self.occupancy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .alive -= 1;
        }
        Ok(Some(WorkerExit {
            code: Some(self.code),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn endpoint(id: u64) -> Endpoint {
        Endpoint::new(id, "imap.example.com", "bounces")
    }

    #[test]
    fn capability_requires_both_primitives() {
        assert!(WorkerCapability::available().supports_parallel());
        assert!(!WorkerCapability::unavailable().supports_parallel());
        let no_spawn = crate::process::ScriptedExecutor::succeeding().without_spawn();
        assert!(!WorkerCapability::detect(&no_spawn).supports_parallel());
    }

    #[cfg(unix)]
    #[test]
    fn self_exec_launcher_passes_worker_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = format!("printf '%s ' \"$@\" > {}", out.display());
        let launcher = SelfExecLauncher::new(
            "sh",
            vec!["-c".into(), script.into(), "sh".into(), "--verbose".into()],
        );

        let mut child = launcher.launch(&endpoint(42)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let exit = loop {
            if let Some(exit) = child.try_wait().unwrap() {
                break exit;
            }
            assert!(Instant::now() < deadline, "worker did not exit");
            std::thread::sleep(Duration::from_millis(10));
        };

        assert!(exit.success());
        assert_eq!(child.endpoint(), EndpointId::new(42));
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "--verbose bounce-worker --endpoint 42 "
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_worker_exit_is_reported() {
        let launcher = SelfExecLauncher::new("sh", vec!["-c".into(), "exit 3".into(), "sh".into()]);
        let mut child = launcher.launch(&endpoint(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let exit = loop {
            if let Some(exit) = child.try_wait().unwrap() {
                break exit;
            }
            assert!(Instant::now() < deadline, "worker did not exit");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit.code, Some(3));
    }

    #[test]
    fn scripted_workers_exit_after_their_polls() {
        let launcher = ScriptedLauncher::new(2);
        let mut a = launcher.launch(&endpoint(1)).unwrap();
        let _b = launcher.launch(&endpoint(2)).unwrap();
        assert_eq!(launcher.running(), 2);

        assert!(a.try_wait().unwrap().is_none());
        assert!(a.try_wait().unwrap().unwrap().success());
        assert_eq!(launcher.running(), 1);
        assert_eq!(launcher.peak_concurrency(), 2);
    }
}
