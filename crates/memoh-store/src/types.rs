//! Catalogue row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use memoh_core::{Error, Result};

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRow {
    pub id: Uuid,
    /// External charset-restricted id.
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a container record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "deleted" => Ok(ContainerStatus::Deleted),
            other => Err(Error::internal(format!("unknown container status {other}"))),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-user container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRow {
    pub id: Uuid,
    /// External user id (also the value of the `user` label).
    pub user_id: String,
    /// Runtime container id, `memoh-user-<user_id>`. Globally unique.
    pub container_id: String,
    /// Human-facing name. Globally unique.
    pub container_name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub namespace: String,
    pub auto_start: bool,
    /// Host directory bind-mounted into the container, if any.
    pub host_path: Option<String>,
    /// Container-side mount point for persistent data.
    pub container_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
}

/// Fields required to insert a container record.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub namespace: String,
    pub auto_start: bool,
    pub host_path: Option<String>,
    pub container_path: String,
}

/// A runtime snapshot known to the catalogue. Snapshots form a forest: each
/// has at most one parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub container_id: String,
    pub parent_snapshot_id: Option<String>,
    pub snapshotter: String,
    /// Runtime-side snapshot key or committed name.
    pub snapshot_key: String,
    pub digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An immutable, numbered version of a container's data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRow {
    pub id: Uuid,
    pub container_id: String,
    /// Committed snapshot name (`<container_id>:v<version>`).
    pub snapshot_id: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

/// Append-only lifecycle audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRow {
    pub id: Uuid,
    pub container_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
