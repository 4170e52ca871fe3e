//! The runtime adapter trait.

use async_trait::async_trait;

use memoh_core::Result;

use crate::types::{
    ContainerInfo, CreateContainerRequest, DeleteContainerOptions, DeleteImageOptions,
    DeleteTaskOptions, ExecTaskRequest, ExecTaskResult, ImageInfo, ListTasksOptions, MountSpec,
    PullImageOptions, StartTaskOptions, StopTaskOptions, TaskInfo,
};

/// Typed surface over the container runtime.
///
/// Every operation is scoped to the namespace the implementation was
/// constructed with. Missing entities surface as
/// [`memoh_core::Error::NotFound`], malformed requests as
/// [`memoh_core::Error::InvalidArgument`]; other runtime failures propagate
/// as [`memoh_core::Error::Internal`].
#[async_trait]
pub trait RuntimeService: Send + Sync {
    // Images
    async fn pull_image(&self, image_ref: &str, opts: &PullImageOptions) -> Result<ImageInfo>;
    async fn get_image(&self, image_ref: &str) -> Result<ImageInfo>;
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;
    async fn delete_image(&self, image_ref: &str, opts: &DeleteImageOptions) -> Result<()>;

    // Containers
    /// Create a container with a fresh writable snapshot prepared from the
    /// image's root filesystem.
    async fn create_container(&self, req: CreateContainerRequest) -> Result<ContainerInfo>;
    /// Create a container bound to an already-prepared snapshot key.
    async fn create_container_from_snapshot(
        &self,
        req: CreateContainerRequest,
    ) -> Result<ContainerInfo>;
    async fn get_container(&self, id: &str) -> Result<ContainerInfo>;
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    /// Containers carrying label `key`, optionally restricted to `value`.
    async fn list_containers_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerInfo>>;
    async fn delete_container(&self, id: &str, opts: &DeleteContainerOptions) -> Result<()>;

    // Tasks
    async fn start_task(&self, container_id: &str, opts: &StartTaskOptions) -> Result<TaskInfo>;
    async fn get_task(&self, container_id: &str) -> Result<TaskInfo>;
    async fn list_tasks(&self, opts: &ListTasksOptions) -> Result<Vec<TaskInfo>>;
    /// Send `opts.signal`, wait up to `opts.timeout`; SIGKILL when forced,
    /// [`memoh_core::Error::TaskStopTimeout`] otherwise.
    async fn stop_task(&self, container_id: &str, opts: &StopTaskOptions) -> Result<()>;
    async fn delete_task(&self, container_id: &str, opts: &DeleteTaskOptions) -> Result<()>;
    async fn exec_task(&self, container_id: &str, req: ExecTaskRequest) -> Result<ExecTaskResult>;

    // Snapshots
    async fn prepare_snapshot(&self, snapshotter: &str, key: &str, parent: &str) -> Result<()>;
    async fn commit_snapshot(&self, snapshotter: &str, name: &str, key: &str) -> Result<()>;
    async fn remove_snapshot(&self, snapshotter: &str, key: &str) -> Result<()>;
    async fn snapshot_mounts(&self, snapshotter: &str, key: &str) -> Result<Vec<MountSpec>>;
}
