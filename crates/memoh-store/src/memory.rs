//! In-memory catalogue for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use memoh_core::{Error, Result};

use crate::catalogue::{Catalogue, VersionTransaction};
use crate::types::{
    ContainerRow, ContainerStatus, EventRow, NewContainer, SnapshotRow, UserRow, VersionRow,
};

#[derive(Default)]
struct State {
    users: HashMap<String, UserRow>,
    containers: HashMap<String, ContainerRow>,
    snapshots: Vec<SnapshotRow>,
    versions: Vec<VersionRow>,
    events: Vec<EventRow>,
}

/// Catalogue backed by process memory. Mirrors the Postgres semantics,
/// including the `(container_id, version)` uniqueness and cascade deletes.
#[derive(Default)]
pub struct MemoryCatalogue {
    state: Arc<RwLock<State>>,
}

impl MemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Version transaction over the shared in-memory state. The number is
/// computed at begin; commit re-checks uniqueness, mirroring the Postgres
/// conflict behaviour.
struct MemoryVersionTransaction {
    state: Arc<RwLock<State>>,
    container_id: String,
    version: i32,
}

#[async_trait]
impl VersionTransaction for MemoryVersionTransaction {
    fn version(&self) -> i32 {
        self.version
    }

    async fn commit(
        self: Box<Self>,
        snapshot_name: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<VersionRow> {
        let mut state = self.state.write().await;
        if state
            .versions
            .iter()
            .any(|v| v.container_id == self.container_id && v.version == self.version)
        {
            return Err(Error::Conflict(format!(
                "version {} of {} already recorded",
                self.version, self.container_id
            )));
        }
        state.snapshots.push(SnapshotRow {
            id: Uuid::new_v4(),
            container_id: self.container_id.clone(),
            parent_snapshot_id: parent_snapshot_id.map(str::to_string),
            snapshotter: snapshotter.to_string(),
            snapshot_key: snapshot_name.to_string(),
            digest: None,
            created_at: Utc::now(),
        });
        let row = VersionRow {
            id: Uuid::new_v4(),
            container_id: self.container_id.clone(),
            snapshot_id: snapshot_name.to_string(),
            version: self.version,
            created_at: Utc::now(),
        };
        state.versions.push(row.clone());
        Ok(row)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Catalogue for MemoryCatalogue {
    async fn create_user(&self, username: &str) -> Result<UserRow> {
        self.create_user_with_id(Uuid::new_v4(), username).await
    }

    async fn create_user_with_id(&self, id: Uuid, username: &str) -> Result<UserRow> {
        let mut state = self.state.write().await;
        if state.users.contains_key(username) {
            return Err(Error::Conflict(format!("user {username} already exists")));
        }
        let row = UserRow {
            id,
            username: username.to_string(),
            created_at: Utc::now(),
        };
        state.users.insert(username.to_string(), row.clone());
        Ok(row)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let state = self.state.read().await;
        Ok(state.users.get(username).cloned())
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.id == id).cloned())
    }

    async fn upsert_user_by_username(&self, username: &str) -> Result<UserRow> {
        {
            let state = self.state.read().await;
            if let Some(existing) = state.users.get(username) {
                return Ok(existing.clone());
            }
        }
        self.create_user(username).await
    }

    async fn count_users(&self) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.users.len() as i64)
    }

    async fn create_container(&self, new: NewContainer) -> Result<ContainerRow> {
        let mut state = self.state.write().await;
        if state.containers.contains_key(&new.container_id) {
            return Err(Error::Conflict(format!(
                "container {} already exists",
                new.container_id
            )));
        }
        let now = Utc::now();
        let row = ContainerRow {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            container_id: new.container_id.clone(),
            container_name: new.container_name,
            image: new.image,
            status: ContainerStatus::Created,
            namespace: new.namespace,
            auto_start: new.auto_start,
            host_path: new.host_path,
            container_path: new.container_path,
            created_at: now,
            updated_at: now,
            last_started_at: None,
            last_stopped_at: None,
        };
        state.containers.insert(new.container_id, row.clone());
        Ok(row)
    }

    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRow>> {
        let state = self.state.read().await;
        Ok(state.containers.get(container_id).cloned())
    }

    async fn list_containers_by_user(&self, user_id: &str) -> Result<Vec<ContainerRow>> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .containers
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        started: bool,
        stopped: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let row = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        let now = Utc::now();
        row.status = status;
        row.updated_at = now;
        if started {
            row.last_started_at = Some(now);
        }
        if stopped {
            row.last_stopped_at = Some(now);
        }
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.containers.remove(container_id);
        state.snapshots.retain(|s| s.container_id != container_id);
        state.versions.retain(|v| v.container_id != container_id);
        state.events.retain(|e| e.container_id != container_id);
        Ok(())
    }

    async fn insert_snapshot(
        &self,
        container_id: &str,
        snapshot_key: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<SnapshotRow> {
        let mut state = self.state.write().await;
        let row = SnapshotRow {
            id: Uuid::new_v4(),
            container_id: container_id.to_string(),
            parent_snapshot_id: parent_snapshot_id.map(str::to_string),
            snapshotter: snapshotter.to_string(),
            snapshot_key: snapshot_key.to_string(),
            digest: None,
            created_at: Utc::now(),
        };
        state.snapshots.push(row.clone());
        Ok(row)
    }

    async fn list_snapshots(&self, container_id: &str) -> Result<Vec<SnapshotRow>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.container_id == container_id)
            .cloned()
            .collect())
    }

    async fn delete_snapshot(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshots.retain(|s| s.id != id);
        Ok(())
    }

    async fn next_version(&self, container_id: &str) -> Result<i32> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.container_id == container_id)
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn begin_version(&self, container_id: &str) -> Result<Box<dyn VersionTransaction>> {
        let version = self.next_version(container_id).await?;
        Ok(Box::new(MemoryVersionTransaction {
            state: self.state.clone(),
            container_id: container_id.to_string(),
            version,
        }))
    }

    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionRow>> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .versions
            .iter()
            .filter(|v| v.container_id == container_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.version);
        Ok(rows)
    }

    async fn version_snapshot_id(
        &self,
        container_id: &str,
        version: i32,
    ) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .iter()
            .find(|v| v.container_id == container_id && v.version == version)
            .map(|v| v.snapshot_id.clone()))
    }

    async fn append_event(
        &self,
        container_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventRow> {
        let mut state = self.state.write().await;
        let row = EventRow {
            id: Uuid::new_v4(),
            container_id: container_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        state.events.push(row.clone());
        Ok(row)
    }

    async fn list_events(&self, container_id: &str) -> Result<Vec<EventRow>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.container_id == container_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_container(user: &str) -> NewContainer {
        NewContainer {
            user_id: user.to_string(),
            container_id: format!("memoh-user-{user}"),
            container_name: format!("memoh-user-{user}"),
            image: "docker.io/library/alpine:latest".to_string(),
            namespace: "default".to_string(),
            auto_start: false,
            host_path: Some(format!("/var/lib/memoh/users/{user}")),
            container_path: "/data".to_string(),
        }
    }

    #[tokio::test]
    async fn container_crud() {
        let store = MemoryCatalogue::new();
        let row = store.create_container(new_container("alice")).await.unwrap();
        assert_eq!(row.status, ContainerStatus::Created);

        let fetched = store.get_container("memoh-user-alice").await.unwrap();
        assert_eq!(fetched.unwrap().user_id, "alice");

        store
            .update_container_status("memoh-user-alice", ContainerStatus::Running, true, false)
            .await
            .unwrap();
        let running = store
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, ContainerStatus::Running);
        assert!(running.last_started_at.is_some());
        assert!(running.last_stopped_at.is_none());

        store.delete_container("memoh-user-alice").await.unwrap();
        assert!(store
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_container_conflicts() {
        let store = MemoryCatalogue::new();
        store.create_container(new_container("alice")).await.unwrap();
        let err = store
            .create_container(new_container("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn versions_are_dense_and_ordered() {
        let store = MemoryCatalogue::new();
        store.create_container(new_container("alice")).await.unwrap();
        let cid = "memoh-user-alice";

        for expected in 1..=3 {
            let tx = store.begin_version(cid).await.unwrap();
            let v = tx.version();
            assert_eq!(v, expected);
            tx.commit(&format!("{cid}:v{v}"), Some(cid), "overlayfs")
                .await
                .unwrap();
        }

        let versions = store.list_versions(cid).await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            store.version_snapshot_id(cid, 2).await.unwrap().unwrap(),
            "memoh-user-alice:v2"
        );
        assert!(store.version_snapshot_id(cid, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn racing_version_transactions_conflict() {
        let store = MemoryCatalogue::new();
        store.create_container(new_container("alice")).await.unwrap();
        let cid = "memoh-user-alice";

        // Both transactions reserve version 1; the second commit loses.
        let first = store.begin_version(cid).await.unwrap();
        let second = store.begin_version(cid).await.unwrap();
        assert_eq!(first.version(), 1);
        assert_eq!(second.version(), 1);

        first
            .commit("memoh-user-alice:v1", None, "overlayfs")
            .await
            .unwrap();
        let err = second
            .commit("memoh-user-alice:v1-dup", None, "overlayfs")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn rolled_back_version_transaction_records_nothing() {
        let store = MemoryCatalogue::new();
        store.create_container(new_container("alice")).await.unwrap();
        let cid = "memoh-user-alice";

        let tx = store.begin_version(cid).await.unwrap();
        assert_eq!(tx.version(), 1);
        tx.rollback().await.unwrap();

        assert!(store.list_versions(cid).await.unwrap().is_empty());
        assert_eq!(store.next_version(cid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_versions_and_events() {
        let store = MemoryCatalogue::new();
        store.create_container(new_container("alice")).await.unwrap();
        let cid = "memoh-user-alice";
        let tx = store.begin_version(cid).await.unwrap();
        tx.commit("memoh-user-alice:v1", None, "overlayfs")
            .await
            .unwrap();
        store
            .append_event(cid, "created", serde_json::json!({}))
            .await
            .unwrap();

        store.delete_container(cid).await.unwrap();
        assert!(store.list_versions(cid).await.unwrap().is_empty());
        assert!(store.list_events(cid).await.unwrap().is_empty());
        assert!(store.list_snapshots(cid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent() {
        let store = MemoryCatalogue::new();
        let first = store.upsert_user_by_username("alice").await.unwrap();
        let second = store.upsert_user_by_username("alice").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.count_users().await.unwrap(), 1);
    }
}
