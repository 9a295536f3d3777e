//! Waiting for in-flight campaigns before files are replaced.

use std::time::Duration;

use tracing::debug;

use crate::clock::Sleeper;
use crate::gate::{self, ConnectivityGate};
use crate::store::{CampaignMonitor, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    interval: Duration,
    ceiling: Duration,
}

impl DrainPolicy {
    /// A zero interval is raised to one second so the wait always progresses.
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self {
            interval: if interval.is_zero() {
                Duration::from_secs(1)
            } else {
                interval
            },
            ceiling,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(12 * 3600))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { polls: u32, waited: Duration },
    TimedOut { polls: u32, waited: Duration },
}

/// Poll the processing count until it reaches zero or the ceiling is hit.
///
/// Connections stay closed for the whole wait except around each count query.
pub fn wait_for_drain(
    monitor: &dyn CampaignMonitor,
    gate: &dyn ConnectivityGate,
    sleeper: &dyn Sleeper,
    policy: DrainPolicy,
) -> Result<DrainOutcome, StoreError> {
    gate::suspended(gate, || {
        let mut polls = 0u32;
        let mut waited = Duration::ZERO;

        while waited < policy.ceiling {
            let count = gate::activated(gate, || monitor.processing_count())?;
            polls += 1;
            if count == 0 {
                return Ok(DrainOutcome::Drained { polls, waited });
            }
            debug!(processing = count, waited_secs = waited.as_secs(), "campaigns still processing");
            sleeper.sleep(policy.interval);
            waited += policy.interval;
        }

        Ok(DrainOutcome::TimedOut { polls, waited })
    })
}
