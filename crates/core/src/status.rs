//! Persisted status flags shared with the host application.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Service availability flag gating user-facing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Online,
    Offline,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Online => "online",
            ServiceStatus::Offline => "offline",
        }
    }

    pub fn from_online(online: bool) -> Self {
        if online {
            ServiceStatus::Online
        } else {
            ServiceStatus::Offline
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "online" => Ok(ServiceStatus::Online),
            "offline" => Ok(ServiceStatus::Offline),
            other => Err(DomainError::unknown_status(format!("service status `{other}`"))),
        }
    }
}

impl core::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a mail-retrieval endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointStatus {
    /// Eligible for the next processing pass.
    Active,
    /// Disabled by an operator.
    Inactive,
    /// Claimed by a pass that is (or was, if it crashed) processing it.
    Running,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Inactive => "inactive",
            EndpointStatus::Running => "cron-running",
        }
    }
}

impl FromStr for EndpointStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(EndpointStatus::Active),
            "inactive" => Ok(EndpointStatus::Inactive),
            "cron-running" | "running" => Ok(EndpointStatus::Running),
            other => Err(DomainError::unknown_status(format!("endpoint status `{other}`"))),
        }
    }
}

impl core::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_status_uses_host_literals() {
        assert_eq!(EndpointStatus::Running.as_str(), "cron-running");
        assert_eq!("cron-running".parse::<EndpointStatus>().unwrap(), EndpointStatus::Running);
        assert!("paused".parse::<EndpointStatus>().is_err());
    }

    #[test]
    fn service_status_from_flag() {
        assert_eq!(ServiceStatus::from_online(true), ServiceStatus::Online);
        assert_eq!(ServiceStatus::from_online(false), ServiceStatus::Offline);
        assert_eq!("offline".parse::<ServiceStatus>().unwrap(), ServiceStatus::Offline);
    }
}
