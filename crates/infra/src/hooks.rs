//! Extension points around a job's processing.
//!
//! Listeners register for one of two boundaries and run in registration order.
//! A listener that errors or panics is logged and skipped; it never changes
//! the job's result.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, warn};

use mailops_core::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeProcess,
    AfterProcess,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeProcess => "before_process",
            HookPoint::AfterProcess => "after_process",
        }
    }
}

/// What a listener is told about the invocation.
#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    pub job: &'static str,
    pub run_id: RunId,
    pub point: HookPoint,
}

type Listener = Box<dyn Fn(&HookContext) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    name: String,
    point: HookPoint,
    listener: Listener,
}

/// Ordered listener registry.
#[derive(Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, point: HookPoint, name: impl Into<String>, listener: F)
    where
        F: Fn(&HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            name: name.into(),
            point,
            listener: Box::new(listener),
        });
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Run every listener registered for `ctx.point`; returns how many failed.
    pub fn dispatch(&self, ctx: &HookContext) -> usize {
        let mut failed = 0;
        for reg in self.registrations.iter().filter(|r| r.point == ctx.point) {
            debug!(hook = %reg.name, point = ctx.point.as_str(), job = ctx.job, "dispatching hook");
            match panic::catch_unwind(AssertUnwindSafe(|| (reg.listener)(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(
                        hook = %reg.name,
                        point = ctx.point.as_str(),
                        job = ctx.job,
                        run_id = %ctx.run_id,
                        error = %err,
                        "hook listener failed"
                    );
                }
                Err(_) => {
                    failed += 1;
                    error!(
                        hook = %reg.name,
                        point = ctx.point.as_str(),
                        job = ctx.job,
                        run_id = %ctx.run_id,
                        "hook listener panicked"
                    );
                }
            }
        }
        failed
    }
}

impl core::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.registrations.iter().map(|r| (r.point, &r.name)))
            .finish()
    }
}
