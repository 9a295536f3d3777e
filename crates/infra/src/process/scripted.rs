//! Scripted executor for tests/dev: nothing is spawned, every invocation is
//! recorded and answered by a caller-provided responder.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use super::{CommandOutput, CommandSpec, ProcessError, ProcessExecutor};

type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync>;

pub struct ScriptedExecutor {
    responder: Responder,
    can_spawn: bool,
    missing: HashSet<String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            can_spawn: true,
            missing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Executor on which every command succeeds with no output.
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(CommandOutput::success()))
    }

    pub fn without_spawn(mut self) -> Self {
        self.can_spawn = false;
        self
    }

    /// Make `program` unresolvable.
    pub fn missing(mut self, program: impl Into<String>) -> Self {
        self.missing.insert(program.into());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Programs invoked, in order.
    pub fn programs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.program().to_string())
            .collect()
    }
}

impl ProcessExecutor for ScriptedExecutor {
    fn can_spawn(&self) -> bool {
        self.can_spawn
    }

    fn resolve(&self, program: &str) -> bool {
        !self.missing.contains(program)
    }

    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        (self.responder)(spec)
    }
}

impl core::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("can_spawn", &self.can_spawn)
            .field("missing", &self.missing)
            .finish_non_exhaustive()
    }
}
