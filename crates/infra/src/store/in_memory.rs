//! In-memory stores for tests/dev.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use mailops_core::{EndpointId, EndpointStatus, ReleaseVersion, ServiceStatus};

use super::{
    Account, AccountDirectory, CampaignMonitor, Endpoint, EndpointRepository, SiteOptions,
    StoreError,
};

/// Site options held in memory; remembers every status write.
#[derive(Debug)]
pub struct InMemorySiteOptions {
    version: ReleaseVersion,
    status: Mutex<ServiceStatus>,
    writes: Mutex<Vec<ServiceStatus>>,
}

impl InMemorySiteOptions {
    pub fn new(version: ReleaseVersion) -> Self {
        Self {
            version,
            status: Mutex::new(ServiceStatus::Online),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Every status written so far, in order.
    pub fn status_writes(&self) -> Vec<ServiceStatus> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SiteOptions for InMemorySiteOptions {
    fn app_version(&self) -> Result<ReleaseVersion, StoreError> {
        Ok(self.version.clone())
    }

    fn service_status(&self) -> Result<ServiceStatus, StoreError> {
        Ok(*self.status.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_service_status(&self, status: ServiceStatus) -> Result<(), StoreError> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status);
        Ok(())
    }
}

/// Replays a script of processing counts, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedCampaignMonitor {
    script: Mutex<VecDeque<u64>>,
    last: Mutex<u64>,
    polls: Mutex<usize>,
}

impl ScriptedCampaignMonitor {
    pub fn new(counts: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(counts.into_iter().collect()),
            last: Mutex::new(0),
            polls: Mutex::new(0),
        }
    }

    /// A monitor whose count never drops to zero.
    pub fn always_busy(count: u64) -> Self {
        let monitor = Self::new([]);
        *monitor.last.lock().unwrap_or_else(PoisonError::into_inner) = count;
        monitor
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CampaignMonitor for ScriptedCampaignMonitor {
    fn processing_count(&self) -> Result<u64, StoreError> {
        *self.polls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            *last = next;
        }
        Ok(*last)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEndpointRepository {
    endpoints: Mutex<BTreeMap<EndpointId, Endpoint>>,
    transitions: Mutex<Vec<(EndpointId, EndpointStatus)>>,
}

impl InMemoryEndpointRepository {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints.into_iter().map(|e| (e.id, e)).collect()),
            transitions: Mutex::new(Vec::new()),
        }
    }

    pub fn status_of(&self, id: EndpointId) -> Option<EndpointStatus> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|e| e.status)
    }

    /// Status changes made through `set_status`, in order.
    pub fn transitions(&self) -> Vec<(EndpointId, EndpointStatus)> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EndpointRepository for InMemoryEndpointRepository {
    fn reset_running(&self) -> Result<usize, StoreError> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let mut reset = 0;
        for endpoint in endpoints.values_mut() {
            if endpoint.status == EndpointStatus::Running {
                endpoint.status = EndpointStatus::Active;
                reset += 1;
            }
        }
        Ok(reset)
    }

    fn list_active(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.status == EndpointStatus::Active)
            .cloned()
            .collect())
    }

    fn get(&self, id: EndpointId) -> Result<Option<Endpoint>, StoreError> {
        Ok(self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn set_status(&self, id: EndpointId, status: EndpointStatus) -> Result<(), StoreError> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let endpoint = endpoints
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("endpoint {id}")))?;
        endpoint.status = status;
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, status));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: Vec<Account>,
}

impl InMemoryAccountDirectory {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }
}

impl AccountDirectory for InMemoryAccountDirectory {
    fn notifiable_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.accounts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_running_only_touches_running_endpoints() {
        let repo = InMemoryEndpointRepository::new([
            Endpoint::new(1, "imap.a", "a"),
            Endpoint::new(2, "imap.b", "b").with_status(EndpointStatus::Running),
            Endpoint::new(3, "imap.c", "c").with_status(EndpointStatus::Inactive),
        ]);

        assert_eq!(repo.reset_running().unwrap(), 1);
        let active: Vec<_> = repo.list_active().unwrap().into_iter().map(|e| e.id.get()).collect();
        assert_eq!(active, vec![1, 2]);
        assert_eq!(repo.status_of(EndpointId::new(3)), Some(EndpointStatus::Inactive));
    }

    #[test]
    fn scripted_monitor_repeats_last_count() {
        let monitor = ScriptedCampaignMonitor::new([2, 0]);
        assert_eq!(monitor.processing_count().unwrap(), 2);
        assert_eq!(monitor.processing_count().unwrap(), 0);
        assert_eq!(monitor.processing_count().unwrap(), 0);
        assert_eq!(monitor.polls(), 3);
    }

    #[test]
    fn set_status_on_unknown_endpoint_fails() {
        let repo = InMemoryEndpointRepository::default();
        assert!(matches!(
            repo.set_status(EndpointId::new(9), EndpointStatus::Active),
            Err(StoreError::Missing(_))
        ));
    }
}
