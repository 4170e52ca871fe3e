//! containerd adapter for memoh.
//!
//! A narrow, typed surface over the external container runtime: image pull,
//! container create (from image or from an existing snapshot), task
//! start/stop/delete/exec, snapshot prepare/commit/mount, and label-filtered
//! listing. All operations are pinned to a configured containerd namespace.
//!
//! [`RuntimeService`] is the seam: production uses the gRPC-backed
//! [`ContainerdRuntime`], tests use [`MockRuntime`].

pub mod containerd;
pub mod mock;
pub mod mount;
pub mod service;
pub mod types;

pub use containerd::ContainerdRuntime;
pub use mock::MockRuntime;
pub use mount::{mount_container_snapshot, mount_snapshot, MountedSnapshot};
pub use service::RuntimeService;
pub use types::{
    ContainerInfo, CreateContainerRequest, DeleteContainerOptions, DeleteImageOptions,
    DeleteTaskOptions, ExecTaskRequest, ExecTaskResult, HostMount, ImageInfo, ListTasksOptions,
    MountSpec, PullImageOptions, StartTaskOptions, StopTaskOptions, TaskInfo, TaskStatus,
};
