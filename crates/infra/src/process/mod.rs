//! External process execution.
//!
//! Jobs never build shell strings: every command is a program plus an argument
//! vector handed straight to the OS, so dynamic values (versions, paths, URLs,
//! license keys) reach the tool verbatim and cannot alter what is invoked.

pub mod detect;
pub mod scripted;

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

pub use scripted::ScriptedExecutor;

/// A program invocation described as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Value following `flag` in the argument vector, if any.
    pub fn arg_after(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }

    /// Lossy rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Exit status and captured standard output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<String>,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stdout: Vec::new(),
        }
    }

    pub fn failure(code: i32) -> Self {
        Self {
            code: Some(code),
            stdout: Vec::new(),
        }
    }

    pub fn with_stdout<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdout = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }
}

/// Process execution errors (the command never produced an exit status).
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
}

/// Runs external commands to completion.
pub trait ProcessExecutor: Send + Sync {
    /// Whether this host can spawn external processes at all.
    fn can_spawn(&self) -> bool;

    /// Whether `program` resolves to an executable.
    fn resolve(&self, program: &str) -> bool;

    /// Run `spec`, blocking until it exits.
    ///
    /// A non-zero exit is returned as data; only a failure to start the
    /// process is an error.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// [`ProcessExecutor`] backed by `std::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessExecutor for SystemExecutor {
    fn can_spawn(&self) -> bool {
        cfg!(any(unix, windows))
    }

    fn resolve(&self, program: &str) -> bool {
        detect::ProgramLocator::from_env().locate(program).is_some()
    }

    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %spec.display(), "running external command");
        let output = cmd.output().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(program = %spec.program, stderr = %stderr.trim(), "external command stderr");
        }

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_display_is_lossy_and_ordered() {
        let spec = CommandSpec::new("unzip")
            .arg("-o")
            .arg(Path::new("/tmp/update-2.1.0.zip"))
            .args(["-d", "/tmp"]);
        assert_eq!(spec.display(), "unzip -o /tmp/update-2.1.0.zip -d /tmp");
        assert_eq!(spec.get_args().len(), 4);
    }

    #[test]
    fn first_line_skips_blank_lines() {
        let out = CommandOutput::success().with_stdout(["", "  ", "{\"a\":1}", "tail"]);
        assert_eq!(out.first_line(), Some("{\"a\":1}"));
        assert!(out.is_success());
        assert!(!CommandOutput::failure(2).is_success());
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_captures_stdout_and_status() {
        let exec = SystemExecutor::new();
        let out = exec
            .run(&CommandSpec::new("sh").args(["-c", "echo one; echo two; exit 3"]))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, vec!["one".to_string(), "two".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn dynamic_arguments_are_not_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pwned");
        let hostile = format!("2.1.0; touch {}", marker.display());

        let exec = SystemExecutor::new();
        let out = exec
            .run(&CommandSpec::new("sh").args(["-c", "printf '%s\\n' \"$1\"", "sh", &hostile]))
            .unwrap();

        assert!(out.is_success());
        assert_eq!(out.stdout, vec![hostile]);
        assert!(!marker.exists());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let exec = SystemExecutor::new();
        let err = exec
            .run(&CommandSpec::new("mailops-definitely-not-a-real-binary"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!exec.resolve("mailops-definitely-not-a-real-binary"));
    }
}
