//! Persistence seams to the host application's data.
//!
//! The jobs only ever read or flip a handful of values owned by the host
//! application: the site options, the count of campaigns still sending, the
//! bounce endpoints and the operator accounts. Each concern is one trait with
//! an in-memory adapter (tests/dev) and a Postgres adapter (production).

pub mod in_memory;
pub mod postgres;

use serde::Serialize;

use mailops_core::{AccountId, DomainError, EndpointId, EndpointStatus, ReleaseVersion, ServiceStatus};

pub use in_memory::{
    InMemoryAccountDirectory, InMemoryEndpointRepository, InMemorySiteOptions,
    ScriptedCampaignMonitor,
};
pub use postgres::{
    PgAccountDirectory, PgCampaignMonitor, PgConnectivityGate, PgDatabase, PgEndpointRepository,
    PgNotifier, PgSiteOptions,
};

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("missing value: {0}")]
    Missing(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Site-wide options: installed version and the service availability flag.
pub trait SiteOptions: Send + Sync {
    /// Version currently recorded as installed.
    fn app_version(&self) -> Result<ReleaseVersion, StoreError>;

    fn service_status(&self) -> Result<ServiceStatus, StoreError>;

    fn set_service_status(&self, status: ServiceStatus) -> Result<(), StoreError>;
}

/// Long-running work that must finish before application files change.
pub trait CampaignMonitor: Send + Sync {
    /// Number of campaigns currently in the "processing" state.
    fn processing_count(&self) -> Result<u64, StoreError>;
}

/// A mail-retrieval endpoint (bounce server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub hostname: String,
    pub username: String,
    pub status: EndpointStatus,
}

impl Endpoint {
    pub fn new(id: u64, hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: EndpointId::new(id),
            hostname: hostname.into(),
            username: username.into(),
            status: EndpointStatus::Active,
        }
    }

    pub fn with_status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }
}

pub trait EndpointRepository: Send + Sync {
    /// Reset stale `Running` markers to `Active`; returns how many changed.
    fn reset_running(&self) -> Result<usize, StoreError>;

    fn list_active(&self) -> Result<Vec<Endpoint>, StoreError>;

    fn get(&self, id: EndpointId) -> Result<Option<Endpoint>, StoreError>;

    fn set_status(&self, id: EndpointId, status: EndpointStatus) -> Result<(), StoreError>;
}

/// An operator account that receives job notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub email: String,
}

pub trait AccountDirectory: Send + Sync {
    /// Accounts that are active and not marked removable.
    fn notifiable_accounts(&self) -> Result<Vec<Account>, StoreError>;
}
