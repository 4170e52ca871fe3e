//! In-memory runtime for tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use memoh_core::{Error, Result};

use crate::service::RuntimeService;
use crate::types::{
    ContainerInfo, CreateContainerRequest, DeleteContainerOptions, DeleteImageOptions,
    DeleteTaskOptions, ExecTaskRequest, ExecTaskResult, ImageInfo, ListTasksOptions, MountSpec,
    PullImageOptions, StartTaskOptions, StopTaskOptions, TaskInfo, TaskStatus,
};

#[derive(Debug, Clone)]
struct MockTask {
    running: bool,
    exit_status: u32,
}

#[derive(Debug, Clone)]
struct MockContainer {
    info: ContainerInfo,
    task: Option<MockTask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MockSnapshot {
    parent: String,
    committed: bool,
}

#[derive(Default)]
struct MockState {
    images: HashMap<String, ImageInfo>,
    containers: HashMap<String, MockContainer>,
    snapshots: HashMap<String, MockSnapshot>,
}

/// Runtime double mirroring the containerd adapter's observable behaviour:
/// not-found conditions, snapshot key lifecycles, and task state
/// transitions.
pub struct MockRuntime {
    state: RwLock<MockState>,
    exec_exit_code: Mutex<u32>,
    exec_log: Mutex<Vec<ExecTaskRequest>>,
    stop_log: Mutex<Vec<StopTaskOptions>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState::default()),
            exec_exit_code: Mutex::new(0),
            exec_log: Mutex::new(Vec::new()),
            stop_log: Mutex::new(Vec::new()),
        }
    }

    /// Exit code returned by subsequent execs.
    pub async fn set_exec_exit_code(&self, code: u32) {
        *self.exec_exit_code.lock().await = code;
    }

    /// Exec requests observed so far.
    pub async fn exec_requests(&self) -> Vec<ExecTaskRequest> {
        self.exec_log.lock().await.clone()
    }

    /// Stop options observed so far, in call order.
    pub async fn stop_requests(&self) -> Vec<StopTaskOptions> {
        self.stop_log.lock().await.clone()
    }

    /// Snapshot keys currently known, sorted.
    pub async fn snapshot_keys(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut keys: Vec<_> = state.snapshots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Parent of a snapshot key, if present.
    pub async fn snapshot_parent(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state.snapshots.get(key).map(|s| s.parent.clone())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeService for MockRuntime {
    async fn pull_image(&self, image_ref: &str, _opts: &PullImageOptions) -> Result<ImageInfo> {
        if image_ref.is_empty() {
            return Err(Error::invalid("image ref is required"));
        }
        let mut state = self.state.write().await;
        let info = ImageInfo {
            name: image_ref.to_string(),
            digest: Some(format!("sha256:mock-{image_ref}")),
        };
        state.images.insert(image_ref.to_string(), info.clone());
        Ok(info)
    }

    async fn get_image(&self, image_ref: &str) -> Result<ImageInfo> {
        let state = self.state.read().await;
        state
            .images
            .get(image_ref)
            .cloned()
            .ok_or_else(|| Error::not_found("image", image_ref))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let state = self.state.read().await;
        Ok(state.images.values().cloned().collect())
    }

    async fn delete_image(&self, image_ref: &str, _opts: &DeleteImageOptions) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .images
            .remove(image_ref)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("image", image_ref))
    }

    async fn create_container(&self, req: CreateContainerRequest) -> Result<ContainerInfo> {
        if req.id.is_empty() || req.image_ref.is_empty() {
            return Err(Error::invalid("container id and image ref are required"));
        }
        let mut state = self.state.write().await;
        if state.containers.contains_key(&req.id) {
            return Err(Error::internal(format!(
                "container {} already exists",
                req.id
            )));
        }
        state.images.entry(req.image_ref.clone()).or_insert(ImageInfo {
            name: req.image_ref.clone(),
            digest: None,
        });

        let snapshot_key = if req.snapshot_key.is_empty() {
            req.id.clone()
        } else {
            req.snapshot_key.clone()
        };
        if state.snapshots.contains_key(&snapshot_key) {
            return Err(Error::internal(format!(
                "snapshot {snapshot_key} already exists"
            )));
        }
        state.snapshots.insert(
            snapshot_key.clone(),
            MockSnapshot {
                parent: format!("image:{}", req.image_ref),
                committed: false,
            },
        );

        let info = ContainerInfo {
            id: req.id.clone(),
            image: req.image_ref,
            labels: req.labels,
            snapshotter: req.snapshotter,
            snapshot_key,
            spec: None,
        };
        state.containers.insert(
            req.id,
            MockContainer {
                info: info.clone(),
                task: None,
            },
        );
        Ok(info)
    }

    async fn create_container_from_snapshot(
        &self,
        req: CreateContainerRequest,
    ) -> Result<ContainerInfo> {
        if req.id.is_empty() || req.snapshot_key.is_empty() {
            return Err(Error::invalid("container id and snapshot key are required"));
        }
        let mut state = self.state.write().await;
        if state.containers.contains_key(&req.id) {
            return Err(Error::internal(format!(
                "container {} already exists",
                req.id
            )));
        }
        if !state.snapshots.contains_key(&req.snapshot_key) {
            return Err(Error::not_found("snapshot", &req.snapshot_key));
        }
        let info = ContainerInfo {
            id: req.id.clone(),
            image: req.image_ref,
            labels: req.labels,
            snapshotter: req.snapshotter,
            snapshot_key: req.snapshot_key,
            spec: None,
        };
        state.containers.insert(
            req.id,
            MockContainer {
                info: info.clone(),
                task: None,
            },
        );
        Ok(info)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.state.read().await;
        state
            .containers
            .get(id)
            .map(|c| c.info.clone())
            .ok_or_else(|| Error::not_found("container", id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let state = self.state.read().await;
        Ok(state.containers.values().map(|c| c.info.clone()).collect())
    }

    async fn list_containers_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerInfo>> {
        let all = self.list_containers().await?;
        Ok(all
            .into_iter()
            .filter(|c| match (c.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect())
    }

    async fn delete_container(&self, id: &str, opts: &DeleteContainerOptions) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .remove(id)
            .ok_or_else(|| Error::not_found("container", id))?;
        if opts.cleanup_snapshot {
            state.snapshots.remove(&container.info.snapshot_key);
        }
        Ok(())
    }

    async fn start_task(&self, container_id: &str, _opts: &StartTaskOptions) -> Result<TaskInfo> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        container.task = Some(MockTask {
            running: true,
            exit_status: 0,
        });
        Ok(TaskInfo {
            container_id: container_id.to_string(),
            id: container_id.to_string(),
            pid: 4242,
            status: TaskStatus::Running,
            exit_status: 0,
        })
    }

    async fn get_task(&self, container_id: &str) -> Result<TaskInfo> {
        let state = self.state.read().await;
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        let task = container
            .task
            .as_ref()
            .ok_or_else(|| Error::not_found("task", container_id))?;
        Ok(TaskInfo {
            container_id: container_id.to_string(),
            id: container_id.to_string(),
            pid: 4242,
            status: if task.running {
                TaskStatus::Running
            } else {
                TaskStatus::Stopped
            },
            exit_status: task.exit_status,
        })
    }

    async fn list_tasks(&self, _opts: &ListTasksOptions) -> Result<Vec<TaskInfo>> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .values()
            .filter_map(|c| {
                c.task.as_ref().map(|t| TaskInfo {
                    container_id: c.info.id.clone(),
                    id: c.info.id.clone(),
                    pid: 4242,
                    status: if t.running {
                        TaskStatus::Running
                    } else {
                        TaskStatus::Stopped
                    },
                    exit_status: t.exit_status,
                })
            })
            .collect())
    }

    async fn stop_task(&self, container_id: &str, opts: &StopTaskOptions) -> Result<()> {
        self.stop_log.lock().await.push(opts.clone());
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        let task = container
            .task
            .as_mut()
            .ok_or_else(|| Error::not_found("task", container_id))?;
        task.running = false;
        Ok(())
    }

    async fn delete_task(&self, container_id: &str, _opts: &DeleteTaskOptions) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        if container.task.take().is_none() {
            return Err(Error::not_found("task", container_id));
        }
        Ok(())
    }

    async fn exec_task(&self, container_id: &str, req: ExecTaskRequest) -> Result<ExecTaskResult> {
        if req.args.is_empty() {
            return Err(Error::invalid("command is required"));
        }
        {
            let state = self.state.read().await;
            let container = state
                .containers
                .get(container_id)
                .ok_or_else(|| Error::not_found("container", container_id))?;
            let task = container
                .task
                .as_ref()
                .ok_or_else(|| Error::not_found("task", container_id))?;
            if !task.running {
                return Err(Error::not_found("task", container_id));
            }
        }
        self.exec_log.lock().await.push(req);
        Ok(ExecTaskResult {
            exit_code: *self.exec_exit_code.lock().await,
        })
    }

    async fn prepare_snapshot(&self, _snapshotter: &str, key: &str, parent: &str) -> Result<()> {
        if key.is_empty() || parent.is_empty() {
            return Err(Error::invalid("key and parent are required"));
        }
        let mut state = self.state.write().await;
        if state.snapshots.contains_key(key) {
            return Err(Error::internal(format!("snapshot {key} already exists")));
        }
        state.snapshots.insert(
            key.to_string(),
            MockSnapshot {
                parent: parent.to_string(),
                committed: false,
            },
        );
        Ok(())
    }

    async fn commit_snapshot(&self, _snapshotter: &str, name: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let active = state
            .snapshots
            .remove(key)
            .ok_or_else(|| Error::not_found("snapshot", key))?;
        if active.committed {
            state.snapshots.insert(key.to_string(), active);
            return Err(Error::invalid(format!("snapshot {key} is not active")));
        }
        state.snapshots.insert(
            name.to_string(),
            MockSnapshot {
                parent: active.parent,
                committed: true,
            },
        );
        Ok(())
    }

    async fn remove_snapshot(&self, _snapshotter: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .snapshots
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("snapshot", key))
    }

    async fn snapshot_mounts(&self, _snapshotter: &str, key: &str) -> Result<Vec<MountSpec>> {
        let state = self.state.read().await;
        if !state.snapshots.contains_key(key) {
            return Err(Error::not_found("snapshot", key));
        }
        Ok(vec![MountSpec {
            kind: "bind".to_string(),
            source: PathBuf::from("/var/lib/memoh/mock")
                .join(key)
                .to_string_lossy()
                .to_string(),
            options: vec!["rbind".to_string(), "rw".to_string()],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> CreateContainerRequest {
        CreateContainerRequest {
            id: id.to_string(),
            image_ref: "docker.io/library/alpine:latest".to_string(),
            snapshotter: "overlayfs".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn container_lifecycle() {
        let runtime = MockRuntime::new();
        runtime.create_container(request("c1")).await.unwrap();

        runtime
            .start_task("c1", &StartTaskOptions::default())
            .await
            .unwrap();
        assert!(runtime.get_task("c1").await.unwrap().status.is_running());

        runtime
            .stop_task("c1", &StopTaskOptions::default())
            .await
            .unwrap();
        assert_eq!(
            runtime.get_task("c1").await.unwrap().status,
            TaskStatus::Stopped
        );

        runtime
            .delete_task("c1", &DeleteTaskOptions::default())
            .await
            .unwrap();
        assert!(runtime.get_task("c1").await.unwrap_err().is_not_found());

        runtime
            .delete_container("c1", &DeleteContainerOptions::default())
            .await
            .unwrap();
        assert!(runtime.get_container("c1").await.unwrap_err().is_not_found());
        assert!(runtime.snapshot_keys().await.is_empty());
    }

    #[tokio::test]
    async fn commit_replaces_active_key_with_name() {
        let runtime = MockRuntime::new();
        runtime.create_container(request("c1")).await.unwrap();

        runtime
            .commit_snapshot("overlayfs", "c1:v1", "c1")
            .await
            .unwrap();
        runtime
            .prepare_snapshot("overlayfs", "c1", "c1:v1")
            .await
            .unwrap();

        assert_eq!(runtime.snapshot_keys().await, vec!["c1", "c1:v1"]);
        assert_eq!(runtime.snapshot_parent("c1").await.unwrap(), "c1:v1");
    }

    #[tokio::test]
    async fn stop_records_received_options() {
        let runtime = MockRuntime::new();
        runtime.create_container(request("c1")).await.unwrap();
        runtime
            .start_task("c1", &StartTaskOptions::default())
            .await
            .unwrap();

        runtime
            .stop_task(
                "c1",
                &StopTaskOptions {
                    signal: libc::SIGTERM,
                    timeout: std::time::Duration::from_secs(42),
                    force: true,
                },
            )
            .await
            .unwrap();

        let stops = runtime.stop_requests().await;
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].signal, libc::SIGTERM);
        assert_eq!(stops[0].timeout, std::time::Duration::from_secs(42));
        assert!(stops[0].force);
    }

    #[tokio::test]
    async fn label_filtering() {
        let runtime = MockRuntime::new();
        let mut req = request("c1");
        req.labels.insert("user".to_string(), "alice".to_string());
        runtime.create_container(req).await.unwrap();

        let mut req = request("c2");
        req.labels.insert("user".to_string(), "bob".to_string());
        runtime.create_container(req).await.unwrap();

        let alice = runtime
            .list_containers_by_label("user", Some("alice"))
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, "c1");

        let labelled = runtime
            .list_containers_by_label("user", None)
            .await
            .unwrap();
        assert_eq!(labelled.len(), 2);
    }

    #[tokio::test]
    async fn exec_requires_running_task() {
        let runtime = MockRuntime::new();
        runtime.create_container(request("c1")).await.unwrap();

        let exec = ExecTaskRequest {
            args: vec!["echo".to_string(), "hi".to_string()],
            ..Default::default()
        };
        assert!(runtime
            .exec_task("c1", exec.clone())
            .await
            .unwrap_err()
            .is_not_found());

        runtime
            .start_task("c1", &StartTaskOptions::default())
            .await
            .unwrap();
        let result = runtime.exec_task("c1", exec).await.unwrap();
        assert_eq!(result.exit_code, 0);
    }
}
