//! The `Catalogue` trait: transactional record of users, containers,
//! snapshots, versions and lifecycle events.

use async_trait::async_trait;
use uuid::Uuid;

use memoh_core::Result;

use crate::types::{
    ContainerRow, ContainerStatus, EventRow, NewContainer, SnapshotRow, UserRow, VersionRow,
};

/// An open version-numbering transaction.
///
/// Created by [`Catalogue::begin_version`], which computes the next version
/// number inside the transaction. The runtime snapshot commit cannot
/// participate, so it runs between `begin_version` and [`commit`]; callers
/// must [`rollback`] on every failure path in between.
///
/// [`commit`]: VersionTransaction::commit
/// [`rollback`]: VersionTransaction::rollback
#[async_trait]
pub trait VersionTransaction: Send {
    /// The version number reserved by this transaction.
    fn version(&self) -> i32;

    /// Insert the snapshot row and the version row, then commit. A
    /// concurrent insert of the same `(container_id, version)` surfaces as
    /// [`memoh_core::Error::Conflict`].
    async fn commit(
        self: Box<Self>,
        snapshot_name: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<VersionRow>;

    /// Abort without recording anything.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage backend for the container catalogue.
///
/// Implementations must guarantee that a [`VersionTransaction`] computes
/// its number and inserts the snapshot and version rows within one
/// transaction, and that a duplicate `(container_id, version)` pair
/// surfaces as [`memoh_core::Error::Conflict`].
#[async_trait]
pub trait Catalogue: Send + Sync {
    // Users
    async fn create_user(&self, username: &str) -> Result<UserRow>;
    async fn create_user_with_id(&self, id: Uuid, username: &str) -> Result<UserRow>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>>;
    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>>;
    /// Insert the user if absent, returning the existing row otherwise.
    async fn upsert_user_by_username(&self, username: &str) -> Result<UserRow>;
    async fn count_users(&self) -> Result<i64>;

    // Containers
    async fn create_container(&self, new: NewContainer) -> Result<ContainerRow>;
    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRow>>;
    async fn list_containers_by_user(&self, user_id: &str) -> Result<Vec<ContainerRow>>;
    /// Update status and stamp `updated_at`; `started`/`stopped` flags also
    /// stamp `last_started_at` / `last_stopped_at`.
    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        started: bool,
        stopped: bool,
    ) -> Result<()>;
    /// Delete the container row, cascading to snapshots, versions and events.
    async fn delete_container(&self, container_id: &str) -> Result<()>;

    // Snapshots
    async fn insert_snapshot(
        &self,
        container_id: &str,
        snapshot_key: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<SnapshotRow>;
    async fn list_snapshots(&self, container_id: &str) -> Result<Vec<SnapshotRow>>;
    async fn delete_snapshot(&self, id: Uuid) -> Result<()>;

    // Versions
    /// `MAX(version) + 1`, or 1 for the first version. Point-in-time read;
    /// version creation goes through [`begin_version`].
    ///
    /// [`begin_version`]: Catalogue::begin_version
    async fn next_version(&self, container_id: &str) -> Result<i32>;
    /// Open a version transaction: compute the next version number and
    /// hold the transaction open until commit or rollback.
    async fn begin_version(&self, container_id: &str) -> Result<Box<dyn VersionTransaction>>;
    /// Versions of a container, ascending.
    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionRow>>;
    /// Snapshot name for `(container_id, version)`.
    async fn version_snapshot_id(&self, container_id: &str, version: i32)
        -> Result<Option<String>>;

    // Events
    async fn append_event(
        &self,
        container_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventRow>;
    /// Events for a container ordered by creation time.
    async fn list_events(&self, container_id: &str) -> Result<Vec<EventRow>>;
}
