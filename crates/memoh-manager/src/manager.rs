//! The user-container manager.
//!
//! Composes the runtime adapter and the catalogue inside a per-user
//! critical section. Lifecycle events are best-effort audit records: a
//! failed event write is logged but never rolls back the transition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use memoh_core::config::Config;
use memoh_core::{
    container_id_for_user, validate_user_id, version_snapshot_name, Error, Result, USER_LABEL_KEY,
};
use memoh_runtime::types::{
    ContainerInfo, CreateContainerRequest, DeleteContainerOptions, DeleteTaskOptions,
    ExecTaskRequest, HostMount, PullImageOptions, StartTaskOptions, StopTaskOptions,
};
use memoh_runtime::RuntimeService;
use memoh_store::{Catalogue, ContainerStatus, NewContainer, VersionRow, VersionTransaction};

use crate::lock::UserLocks;

/// Stop deadline for internal stops (delete, rollback) where the caller
/// supplies none.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Manager settings derived from the configuration file.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base image for user containers.
    pub image: String,
    /// Container-side data directory.
    pub data_mount: String,
    /// Host directory for per-user data; empty disables the host bind.
    pub host_path_root: String,
    pub namespace: String,
    pub snapshotter: String,
}

impl ManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.mcp.image.clone(),
            data_mount: config.mcp.data_mount.clone(),
            host_path_root: config.mcp.host_path_root.clone(),
            namespace: config.containerd.namespace.clone(),
            snapshotter: config.containerd.snapshotter.clone(),
        }
    }
}

/// A user-scoped exec request.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub user_id: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub work_dir: Option<String>,
    pub terminal: bool,
    pub use_stdio: bool,
}

/// Result of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: u32,
}

/// Orchestrates per-user container lifecycle and versioning.
pub struct Manager {
    runtime: Arc<dyn RuntimeService>,
    catalogue: Arc<dyn Catalogue>,
    config: ManagerConfig,
    locks: UserLocks,
}

impl Manager {
    pub fn new(
        runtime: Arc<dyn RuntimeService>,
        catalogue: Arc<dyn Catalogue>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            runtime,
            catalogue,
            config,
            locks: UserLocks::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeService> {
        &self.runtime
    }

    pub fn catalogue(&self) -> &Arc<dyn Catalogue> {
        &self.catalogue
    }

    pub fn data_mount(&self) -> &str {
        &self.config.data_mount
    }

    /// Idempotent bootstrap: pull the base image if absent.
    pub async fn init(&self) -> Result<()> {
        match self.runtime.get_image(&self.config.image).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::info!(image = %self.config.image, "pulling base image");
                self.runtime
                    .pull_image(
                        &self.config.image,
                        &PullImageOptions {
                            unpack: true,
                            snapshotter: self.config.snapshotter.clone(),
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Ensure the user's container exists, creating it on first use.
    pub async fn ensure_user(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let container_id = container_id_for_user(user_id);

        let existing = self
            .runtime
            .list_containers_by_label(USER_LABEL_KEY, Some(user_id))
            .await?;
        if let Some(info) = existing.first() {
            self.reconcile(user_id, info).await?;
            return Ok(());
        }

        self.catalogue.upsert_user_by_username(user_id).await?;

        let host_path = self.host_path_for(user_id)?;
        let mounts = match &host_path {
            Some(path) => vec![HostMount {
                host_path: path.clone(),
                container_path: self.config.data_mount.clone(),
                read_only: false,
            }],
            None => Vec::new(),
        };

        let mut labels = HashMap::new();
        labels.insert(USER_LABEL_KEY.to_string(), user_id.to_string());

        self.runtime
            .create_container(CreateContainerRequest {
                id: container_id.clone(),
                image_ref: self.config.image.clone(),
                snapshot_key: container_id.clone(),
                snapshotter: self.config.snapshotter.clone(),
                labels,
                mounts,
                env: Vec::new(),
            })
            .await?;

        self.catalogue
            .create_container(NewContainer {
                user_id: user_id.to_string(),
                container_id: container_id.clone(),
                container_name: container_id.clone(),
                image: self.config.image.clone(),
                namespace: self.config.namespace.clone(),
                auto_start: false,
                host_path: host_path.map(|p| p.to_string_lossy().to_string()),
                container_path: self.config.data_mount.clone(),
            })
            .await?;
        self.catalogue
            .insert_snapshot(&container_id, &container_id, None, &self.config.snapshotter)
            .await?;

        self.event(&container_id, "created", json!({ "user": user_id }))
            .await;
        Ok(())
    }

    /// Start the user's container; running containers are a no-op.
    pub async fn start(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        if self.start_locked(&info).await? {
            self.event(&info.id, "started", json!({})).await;
        }
        Ok(())
    }

    /// Stop the user's container: the stop signal, then SIGKILL after
    /// `timeout`. A missing task counts as already stopped.
    pub async fn stop(&self, user_id: &str, timeout: Duration) -> Result<()> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        self.stop_locked(&info, timeout).await?;

        self.catalogue
            .update_container_status(&info.id, ContainerStatus::Stopped, false, true)
            .await?;
        self.event(&info.id, "stopped", json!({ "timeout_secs": timeout.as_secs() }))
            .await;
        Ok(())
    }

    /// Delete the user's container, its writable snapshot and all
    /// catalogue rows.
    pub async fn delete(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        self.stop_locked(&info, DEFAULT_STOP_TIMEOUT).await?;

        self.event(&info.id, "deleted", json!({ "user": user_id }))
            .await;

        self.runtime
            .delete_container(
                &info.id,
                &DeleteContainerOptions {
                    cleanup_snapshot: true,
                },
            )
            .await?;
        self.catalogue.delete_container(&info.id).await?;
        Ok(())
    }

    /// Execute a command in the user's container, starting it if needed.
    pub async fn exec(&self, req: ExecRequest) -> Result<ExecResult> {
        validate_user_id(&req.user_id)?;
        if req.command.is_empty() {
            return Err(Error::invalid("command is required"));
        }
        let lock = self.locks.for_user(&req.user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(&req.user_id).await?;
        if self.start_locked(&info).await? {
            self.event(&info.id, "started", json!({})).await;
        }

        let result = self
            .runtime
            .exec_task(
                &info.id,
                ExecTaskRequest {
                    args: req.command,
                    env: req.env,
                    work_dir: req.work_dir,
                    terminal: req.terminal,
                    use_stdio: req.use_stdio,
                },
            )
            .await?;
        Ok(ExecResult {
            exit_code: result.exit_code,
        })
    }

    /// Commit the current writable snapshot as the next version.
    ///
    /// The version number is computed inside an open catalogue transaction;
    /// the runtime snapshot commit runs between the compute and the row
    /// inserts, which land when the transaction commits.
    pub async fn create_version(&self, user_id: &str) -> Result<VersionRow> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        let tx = self.catalogue.begin_version(&info.id).await?;
        let version = tx.version();
        let snapshot_name = version_snapshot_name(&info.id, version);

        if let Err(err) = self
            .runtime
            .commit_snapshot(&info.snapshotter, &snapshot_name, &info.snapshot_key)
            .await
        {
            self.abort_version(tx, &info.id).await;
            return Err(err);
        }
        // Restore the writable key right away so the container is never
        // left without an active snapshot.
        if let Err(err) = self
            .runtime
            .prepare_snapshot(&info.snapshotter, &info.snapshot_key, &snapshot_name)
            .await
        {
            if let Err(cleanup) = self
                .runtime
                .remove_snapshot(&info.snapshotter, &snapshot_name)
                .await
            {
                tracing::warn!(
                    container = %info.id,
                    snapshot = %snapshot_name,
                    error = %cleanup,
                    "failed to remove committed snapshot"
                );
            }
            self.abort_version(tx, &info.id).await;
            return Err(err);
        }

        let parent = if version > 1 {
            Some(version_snapshot_name(&info.id, version - 1))
        } else {
            None
        };

        match tx
            .commit(&snapshot_name, parent.as_deref(), &info.snapshotter)
            .await
        {
            Ok(row) => {
                self.event(
                    &info.id,
                    "version_created",
                    json!({ "version": version, "snapshot_id": snapshot_name }),
                )
                .await;
                Ok(row)
            }
            Err(err) => {
                // Best-effort compensation; the writable child usually pins
                // the committed snapshot, in which case it stays behind and
                // is reported.
                if let Err(cleanup) = self
                    .runtime
                    .remove_snapshot(&info.snapshotter, &snapshot_name)
                    .await
                {
                    tracing::warn!(
                        container = %info.id,
                        snapshot = %snapshot_name,
                        error = %cleanup,
                        "version snapshot left without catalogue row"
                    );
                }
                Err(err)
            }
        }
    }

    async fn abort_version(&self, tx: Box<dyn VersionTransaction>, container_id: &str) {
        if let Err(err) = tx.rollback().await {
            tracing::warn!(
                container = container_id,
                error = %err,
                "failed to abort version transaction"
            );
        }
    }

    /// Versions of the user's container, ascending.
    pub async fn list_versions(&self, user_id: &str) -> Result<Vec<VersionRow>> {
        validate_user_id(user_id)?;
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        self.catalogue.list_versions(&info.id).await
    }

    /// Snapshot name recorded for `(user, version)`. Version 0 and unknown
    /// versions are absent by definition.
    pub async fn version_snapshot_id(&self, user_id: &str, version: i32) -> Result<String> {
        validate_user_id(user_id)?;
        if version <= 0 {
            return Err(Error::not_found(
                "version",
                format!("{}:v{version}", container_id_for_user(user_id)),
            ));
        }
        let container_id = container_id_for_user(user_id);
        self.catalogue
            .version_snapshot_id(&container_id, version)
            .await?
            .ok_or_else(|| Error::not_found("version", format!("{container_id}:v{version}")))
    }

    /// Replace the writable snapshot with a fresh one parented on version
    /// `version`. Uncommitted changes are discarded; intermediate versions
    /// are kept. The container id stays `memoh-user-<user_id>`.
    pub async fn rollback(&self, user_id: &str, version: i32) -> Result<()> {
        validate_user_id(user_id)?;
        if version <= 0 {
            return Err(Error::not_found(
                "version",
                format!("{}:v{version}", container_id_for_user(user_id)),
            ));
        }
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let info = self.load_guarded(user_id).await?;
        let snapshot_id = self
            .catalogue
            .version_snapshot_id(&info.id, version)
            .await?
            .ok_or_else(|| Error::not_found("version", format!("{}:v{version}", info.id)))?;

        self.stop_locked(&info, DEFAULT_STOP_TIMEOUT).await?;

        tracing::warn!(
            container = %info.id,
            version,
            "rolling back; uncommitted changes in the writable snapshot are discarded"
        );

        self.runtime
            .delete_container(
                &info.id,
                &DeleteContainerOptions {
                    cleanup_snapshot: false,
                },
            )
            .await?;
        self.runtime
            .remove_snapshot(&info.snapshotter, &info.snapshot_key)
            .await?;
        self.runtime
            .prepare_snapshot(&info.snapshotter, &info.snapshot_key, &snapshot_id)
            .await?;

        let row = self.catalogue.get_container(&info.id).await?;
        let mounts = match row.as_ref().and_then(|r| r.host_path.clone()) {
            Some(path) => vec![HostMount {
                host_path: PathBuf::from(path),
                container_path: self.config.data_mount.clone(),
                read_only: false,
            }],
            None => Vec::new(),
        };

        self.runtime
            .create_container_from_snapshot(CreateContainerRequest {
                id: info.id.clone(),
                image_ref: info.image.clone(),
                snapshot_key: info.snapshot_key.clone(),
                snapshotter: info.snapshotter.clone(),
                labels: info.labels.clone(),
                mounts,
                env: Vec::new(),
            })
            .await?;

        if row.is_some() {
            self.catalogue
                .update_container_status(&info.id, ContainerStatus::Stopped, false, false)
                .await?;
        }
        self.event(&info.id, "rolled_back", json!({ "version": version }))
            .await;
        Ok(())
    }

    /// User ids derived from containers carrying the user label, sorted.
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let containers = self
            .runtime
            .list_containers_by_label(USER_LABEL_KEY, None)
            .await?;
        let mut users: Vec<String> = containers
            .iter()
            .filter_map(|c| c.labels.get(USER_LABEL_KEY).cloned())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// Re-create missing catalogue rows for a container the runtime already
    /// has. Covers the window where a previous create lost the race between
    /// runtime and catalogue writes.
    async fn reconcile(&self, user_id: &str, info: &ContainerInfo) -> Result<()> {
        self.catalogue.upsert_user_by_username(user_id).await?;
        if self.catalogue.get_container(&info.id).await?.is_some() {
            return Ok(());
        }
        tracing::info!(container = %info.id, user = user_id, "reconciling catalogue");
        self.catalogue
            .create_container(NewContainer {
                user_id: user_id.to_string(),
                container_id: info.id.clone(),
                container_name: info.id.clone(),
                image: info.image.clone(),
                namespace: self.config.namespace.clone(),
                auto_start: false,
                host_path: None,
                container_path: self.config.data_mount.clone(),
            })
            .await?;
        self.catalogue
            .insert_snapshot(&info.id, &info.snapshot_key, None, &info.snapshotter)
            .await?;
        Ok(())
    }

    /// Load the user's container and enforce the user-label guard.
    async fn load_guarded(&self, user_id: &str) -> Result<ContainerInfo> {
        let container_id = container_id_for_user(user_id);
        let info = self.runtime.get_container(&container_id).await?;
        match info.labels.get(USER_LABEL_KEY) {
            Some(label) if label == user_id => Ok(info),
            _ => Err(Error::forbidden("user mismatch")),
        }
    }

    /// Start the container if it is not running. Returns whether a start
    /// happened. Caller holds the user lock.
    async fn start_locked(&self, info: &ContainerInfo) -> Result<bool> {
        match self.runtime.get_task(&info.id).await {
            Ok(task) if task.status.is_running() => return Ok(false),
            Ok(_) => {
                // A stopped task blocks a fresh start until deleted.
                let _ = self
                    .runtime
                    .delete_task(&info.id, &DeleteTaskOptions::default())
                    .await;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        self.runtime
            .start_task(
                &info.id,
                &StartTaskOptions {
                    use_stdio: true,
                    terminal: false,
                    fifo_dir: None,
                },
            )
            .await?;
        self.catalogue
            .update_container_status(&info.id, ContainerStatus::Running, true, false)
            .await?;
        Ok(true)
    }

    /// Stop and delete the task if present, waiting up to `timeout` before
    /// SIGKILL. Caller holds the user lock.
    async fn stop_locked(&self, info: &ContainerInfo, timeout: Duration) -> Result<()> {
        match self
            .runtime
            .stop_task(
                &info.id,
                &StopTaskOptions {
                    signal: libc::SIGTERM,
                    timeout,
                    force: true,
                },
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        match self
            .runtime
            .delete_task(&info.id, &DeleteTaskOptions::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn host_path_for(&self, user_id: &str) -> Result<Option<PathBuf>> {
        if self.config.host_path_root.is_empty() {
            return Ok(None);
        }
        let path = PathBuf::from(&self.config.host_path_root).join(user_id);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::internal(format!("create host path {}: {e}", path.display())))?;
        Ok(Some(path))
    }

    async fn event(&self, container_id: &str, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self
            .catalogue
            .append_event(container_id, event_type, payload)
            .await
        {
            tracing::warn!(
                container = container_id,
                event = event_type,
                error = %err,
                "failed to record lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoh_runtime::MockRuntime;
    use memoh_store::MemoryCatalogue;

    const IMAGE: &str = "docker.io/library/alpine:latest";

    struct Fixture {
        manager: Manager,
        runtime: Arc<MockRuntime>,
        catalogue: Arc<MemoryCatalogue>,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MockRuntime::new());
        let catalogue = Arc::new(MemoryCatalogue::new());
        let manager = Manager::new(
            runtime.clone(),
            catalogue.clone(),
            ManagerConfig {
                image: IMAGE.to_string(),
                data_mount: "/data".to_string(),
                host_path_root: String::new(),
                namespace: "default".to_string(),
                snapshotter: "overlayfs".to_string(),
            },
        );
        Fixture {
            manager,
            runtime,
            catalogue,
        }
    }

    #[tokio::test]
    async fn ensure_user_creates_labelled_container_and_rows() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();

        let containers = fx
            .runtime
            .list_containers_by_label("user", Some("alice"))
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "memoh-user-alice");

        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.user_id, "alice");
        assert_eq!(row.container_path, "/data");
        assert_eq!(row.status, ContainerStatus::Created);

        let events = fx.catalogue.list_events("memoh-user-alice").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "created");
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager.ensure_user("alice").await.unwrap();

        let containers = fx
            .runtime
            .list_containers_by_label("user", Some("alice"))
            .await
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(fx.catalogue.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ensure_user_reconciles_catalogue_for_existing_container() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        // Simulate a lost catalogue.
        fx.catalogue.delete_container("memoh-user-alice").await.unwrap();

        fx.manager.ensure_user("alice").await.unwrap();
        assert!(fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn invalid_user_id_fails_before_touching_runtime() {
        let fx = fixture();
        for id in ["", "a/b", "naughty id", "x;y"] {
            let err = fx.manager.ensure_user(id).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{id:?}");
        }
        assert!(fx.runtime.list_containers().await.unwrap().is_empty());
        assert_eq!(fx.catalogue.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_update_status_and_events() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();

        fx.manager.start("alice").await.unwrap();
        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ContainerStatus::Running);
        assert!(row.last_started_at.is_some());

        // Second start is a no-op.
        fx.manager.start("alice").await.unwrap();

        fx.manager
            .stop("alice", Duration::from_secs(5))
            .await
            .unwrap();
        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ContainerStatus::Stopped);
        assert!(row.last_stopped_at.is_some());

        let events: Vec<String> = fx
            .catalogue
            .list_events("memoh-user-alice")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(events, vec!["created", "started", "stopped"]);
    }

    #[tokio::test]
    async fn stop_without_task_is_already_stopped() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager
            .stop("alice", Duration::from_secs(5))
            .await
            .unwrap();
        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_forwards_caller_timeout_to_runtime() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager.start("alice").await.unwrap();

        fx.manager
            .stop("alice", Duration::from_secs(42))
            .await
            .unwrap();

        let stops = fx.runtime.stop_requests().await;
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].signal, libc::SIGTERM);
        assert_eq!(stops[0].timeout, Duration::from_secs(42));
        assert!(stops[0].force);

        // Internal stops (delete, rollback) keep the default deadline.
        fx.manager.start("alice").await.unwrap();
        fx.manager.delete("alice").await.unwrap();
        let stops = fx.runtime.stop_requests().await;
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[1].timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn start_on_missing_container_is_not_found() {
        let fx = fixture();
        assert!(fx.manager.start("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn label_mismatch_is_forbidden() {
        let fx = fixture();
        // A container with alice's id but bob's label.
        let mut labels = HashMap::new();
        labels.insert("user".to_string(), "bob".to_string());
        fx.runtime
            .create_container(CreateContainerRequest {
                id: "memoh-user-alice".to_string(),
                image_ref: IMAGE.to_string(),
                snapshotter: "overlayfs".to_string(),
                labels,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = fx.manager.start("alice").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = fx
            .manager
            .create_version("alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn exec_starts_container_and_forwards_exit_code() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.runtime.set_exec_exit_code(3).await;

        let result = fx
            .manager
            .exec(ExecRequest {
                user_id: "alice".to_string(),
                command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
                use_stdio: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);

        let requests = fx.runtime.exec_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].args[0], "sh");

        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn exec_requires_command() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        let err = fx
            .manager
            .exec(ExecRequest {
                user_id: "alice".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn versions_are_dense_and_repoint_the_writable_snapshot() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();

        for expected in 1..=3 {
            let row = fx.manager.create_version("alice").await.unwrap();
            assert_eq!(row.version, expected);
            assert_eq!(
                row.snapshot_id,
                format!("memoh-user-alice:v{expected}")
            );
        }

        let versions = fx.manager.list_versions("alice").await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // The writable snapshot is parented on the latest version.
        assert_eq!(
            fx.runtime.snapshot_parent("memoh-user-alice").await.unwrap(),
            "memoh-user-alice:v3"
        );
        assert_eq!(
            fx.runtime.snapshot_keys().await,
            vec![
                "memoh-user-alice",
                "memoh-user-alice:v1",
                "memoh-user-alice:v2",
                "memoh-user-alice:v3",
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_version_creates_stay_dense() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        let manager = Arc::new(fx.manager);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.create_version("alice").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let versions = manager.list_versions("alice").await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn version_snapshot_id_lookup() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager.create_version("alice").await.unwrap();

        assert_eq!(
            fx.manager.version_snapshot_id("alice", 1).await.unwrap(),
            "memoh-user-alice:v1"
        );
        assert!(fx
            .manager
            .version_snapshot_id("alice", 2)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(fx
            .manager
            .version_snapshot_id("alice", 0)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn rollback_reparents_writable_and_keeps_versions() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager.start("alice").await.unwrap();
        fx.manager.create_version("alice").await.unwrap();
        fx.manager.create_version("alice").await.unwrap();

        fx.manager.rollback("alice", 1).await.unwrap();

        // Same external container id, writable parented on v1.
        let info = fx.runtime.get_container("memoh-user-alice").await.unwrap();
        assert_eq!(info.labels.get("user").unwrap(), "alice");
        assert_eq!(
            fx.runtime.snapshot_parent("memoh-user-alice").await.unwrap(),
            "memoh-user-alice:v1"
        );

        // Intermediate versions survive.
        let versions = fx.manager.list_versions("alice").await.unwrap();
        assert_eq!(versions.len(), 2);

        let row = fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ContainerStatus::Stopped);

        let events: Vec<String> = fx
            .catalogue
            .list_events("memoh-user-alice")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert!(events.contains(&"rolled_back".to_string()));
    }

    #[tokio::test]
    async fn rollback_to_missing_version_is_not_found() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        assert!(fx
            .manager
            .rollback("alice", 7)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_runtime_and_catalogue_state() {
        let fx = fixture();
        fx.manager.ensure_user("alice").await.unwrap();
        fx.manager.start("alice").await.unwrap();
        fx.manager.create_version("alice").await.unwrap();

        fx.manager.delete("alice").await.unwrap();

        assert!(fx
            .runtime
            .get_container("memoh-user-alice")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(fx
            .catalogue
            .get_container("memoh-user-alice")
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .catalogue
            .list_versions("memoh-user-alice")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_users_reports_labelled_containers() {
        let fx = fixture();
        fx.manager.ensure_user("bob").await.unwrap();
        fx.manager.ensure_user("alice").await.unwrap();

        assert_eq!(fx.manager.list_users().await.unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn init_pulls_image_once() {
        let fx = fixture();
        fx.manager.init().await.unwrap();
        assert!(fx.runtime.get_image(IMAGE).await.is_ok());
        // Second init is a no-op.
        fx.manager.init().await.unwrap();
    }
}
