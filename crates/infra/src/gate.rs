//! Connectivity gate around long blocking calls.
//!
//! Shared external connections (the database pool above all) are closed while
//! the job blocks on something slow, such as a multi-minute download or a
//! drain sleep, and re-established lazily on next use. This is resource
//! hygiene only: a gate that never toggles must not change job results.

use std::sync::{Mutex, PoisonError};

/// Toggles whether the process keeps its shared connections open.
pub trait ConnectivityGate: Send + Sync {
    /// Never fails; implementations log their own problems.
    fn set_active(&self, active: bool);
}

/// Gate for hosts with nothing to close.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGate;

impl ConnectivityGate for NoopGate {
    fn set_active(&self, _active: bool) {}
}

struct Restore<'a> {
    gate: &'a dyn ConnectivityGate,
    active: bool,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        self.gate.set_active(self.active);
    }
}

/// Run `f` with the gate closed, reopening it afterwards on every path.
pub fn suspended<T>(gate: &dyn ConnectivityGate, f: impl FnOnce() -> T) -> T {
    gate.set_active(false);
    let _restore = Restore { gate, active: true };
    f()
}

/// Run `f` with the gate open, closing it again afterwards.
pub fn activated<T>(gate: &dyn ConnectivityGate, f: impl FnOnce() -> T) -> T {
    gate.set_active(true);
    let _restore = Restore {
        gate,
        active: false,
    };
    f()
}

/// Gate that remembers every toggle (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingGate {
    toggles: Mutex<Vec<bool>>,
}

impl RecordingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggles(&self) -> Vec<bool> {
        self.toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last state set, or `true` (connections start open) if never toggled.
    pub fn is_active(&self) -> bool {
        self.toggles().last().copied().unwrap_or(true)
    }
}

impl ConnectivityGate for RecordingGate {
    fn set_active(&self, active: bool) {
        self.toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(active);
    }
}
