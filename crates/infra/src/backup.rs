//! Best-effort snapshot of the installation before an update.

use std::sync::Arc;

use tracing::debug;

use crate::config::BackupConfig;
use crate::process::{CommandSpec, ProcessError, ProcessExecutor};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup command exited with status {0:?}")]
    Failed(Option<i32>),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub trait BackupProvider: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Take the snapshot; returns the provider's log lines.
    fn backup(&self) -> Result<Vec<String>, BackupError>;
}

/// Runs a configured external snapshot command.
pub struct CommandBackup {
    executor: Arc<dyn ProcessExecutor>,
    enabled: bool,
    spec: CommandSpec,
}

impl CommandBackup {
    pub fn new(executor: Arc<dyn ProcessExecutor>, config: &BackupConfig) -> Self {
        Self {
            executor,
            enabled: config.enabled,
            spec: CommandSpec::new(config.program.clone()).args(&config.args),
        }
    }
}

impl BackupProvider for CommandBackup {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn backup(&self) -> Result<Vec<String>, BackupError> {
        debug!(command = %self.spec.display(), "running backup");
        let output = self.executor.run(&self.spec)?;
        if !output.is_success() {
            return Err(BackupError::Failed(output.code));
        }
        Ok(output.stdout)
    }
}

impl core::fmt::Debug for CommandBackup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandBackup")
            .field("enabled", &self.enabled)
            .field("command", &self.spec.display())
            .finish()
    }
}

/// Drop the bracketed prefix (timestamps, levels) and the `-` separators
/// around a backup log line. Returns `None` when nothing is left.
pub fn clean_log_line(line: &str) -> Option<String> {
    let stripped = match (line.find('['), line.rfind(']')) {
        (Some(open), Some(close)) if open < close => {
            format!("{}{}", &line[..open], &line[close + 1..])
        }
        _ => line.to_string(),
    };
    let cleaned = stripped.trim_matches(|c| c == ' ' || c == '-');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, ScriptedExecutor};

    #[test]
    fn log_lines_lose_their_prefix() {
        assert_eq!(
            clean_log_line("[2024-05-01 10:00:00] [info] - Dumping database").as_deref(),
            Some("Dumping database")
        );
        assert_eq!(clean_log_line("plain line -").as_deref(), Some("plain line"));
        assert_eq!(clean_log_line("[only prefix] - "), None);
    }

    #[test]
    fn failing_command_is_an_error() {
        let exec = Arc::new(ScriptedExecutor::new(|_| Ok(CommandOutput::failure(4))));
        let backup = CommandBackup::new(
            exec,
            &BackupConfig {
                enabled: true,
                program: "snapshot".to_string(),
                args: vec!["--all".to_string()],
            },
        );
        assert!(matches!(backup.backup(), Err(BackupError::Failed(Some(4)))));
    }

    #[test]
    fn stdout_is_returned_as_log_lines() {
        let exec = Arc::new(ScriptedExecutor::new(|_| {
            Ok(CommandOutput::success().with_stdout(["[a] - one", "[b] - two"]))
        }));
        let backup = CommandBackup::new(
            exec.clone(),
            &BackupConfig {
                enabled: true,
                program: "snapshot".to_string(),
                args: Vec::new(),
            },
        );
        assert_eq!(backup.backup().unwrap().len(), 2);
        assert_eq!(exec.programs(), vec!["snapshot".to_string()]);
    }
}
