//! Generic infrastructure record shared by every provisioned resource kind.
//!
//! Billing and UI consumers only look at this record, so every orchestration
//! step that changes cluster health must be mirrored here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::ids::InfrastructureId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InfrastructureKind {
    PostgresCluster,
    PostgresSingle,
    Nginx,
    NginxCluster,
    ClickHouse,
    DinD,
    K8sCluster,
    DockerService,
}

impl InfrastructureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfrastructureKind::PostgresCluster => "postgres_cluster",
            InfrastructureKind::PostgresSingle => "postgres_single",
            InfrastructureKind::Nginx => "nginx",
            InfrastructureKind::NginxCluster => "nginx_cluster",
            InfrastructureKind::ClickHouse => "clickhouse",
            InfrastructureKind::DinD => "dind",
            InfrastructureKind::K8sCluster => "k8s_cluster",
            InfrastructureKind::DockerService => "docker_service",
        }
    }
}

impl fmt::Display for InfrastructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InfrastructureKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres_cluster" => Ok(InfrastructureKind::PostgresCluster),
            "postgres_single" => Ok(InfrastructureKind::PostgresSingle),
            "nginx" => Ok(InfrastructureKind::Nginx),
            "nginx_cluster" => Ok(InfrastructureKind::NginxCluster),
            "clickhouse" => Ok(InfrastructureKind::ClickHouse),
            "dind" => Ok(InfrastructureKind::DinD),
            "k8s_cluster" => Ok(InfrastructureKind::K8sCluster),
            "docker_service" => Ok(InfrastructureKind::DockerService),
            other => Err(UnknownVariant::new("infrastructure kind", other)),
        }
    }
}

/// Overall health of a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InfrastructureStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    Deleting,
    Deleted,
}

impl InfrastructureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfrastructureStatus::Creating => "creating",
            InfrastructureStatus::Running => "running",
            InfrastructureStatus::Stopped => "stopped",
            InfrastructureStatus::Failed => "failed",
            InfrastructureStatus::Deleting => "deleting",
            InfrastructureStatus::Deleted => "deleted",
        }
    }

    /// Statuses during which another operation owns the resource.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            InfrastructureStatus::Creating | InfrastructureStatus::Deleting
        )
    }
}

impl fmt::Display for InfrastructureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InfrastructureStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(InfrastructureStatus::Creating),
            "running" => Ok(InfrastructureStatus::Running),
            "stopped" => Ok(InfrastructureStatus::Stopped),
            "failed" => Ok(InfrastructureStatus::Failed),
            "deleting" => Ok(InfrastructureStatus::Deleting),
            "deleted" => Ok(InfrastructureStatus::Deleted),
            other => Err(UnknownVariant::new("infrastructure status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InfrastructureRecord {
    pub id: InfrastructureId,
    pub name: String,
    pub kind: InfrastructureKind,
    pub status: InfrastructureStatus,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfrastructureRecord {
    pub fn new(
        name: impl Into<String>,
        kind: InfrastructureKind,
        owner_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InfrastructureId::new(),
            name: name.into(),
            kind,
            status: InfrastructureStatus::Creating,
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Returned when a persisted string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.value)
    }
}

impl std::error::Error for UnknownVariant {}
