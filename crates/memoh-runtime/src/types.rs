//! Request and result records for the runtime adapter.
//!
//! Requests are plain structs rather than positional argument lists so that
//! mock implementations can be written against [`crate::RuntimeService`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Options for pulling an image.
#[derive(Debug, Clone)]
pub struct PullImageOptions {
    /// Unpack the image into the snapshotter after pull.
    pub unpack: bool,
    /// Snapshotter to unpack into.
    pub snapshotter: String,
}

impl Default for PullImageOptions {
    fn default() -> Self {
        Self {
            unpack: true,
            snapshotter: "overlayfs".to_string(),
        }
    }
}

/// Options for deleting an image.
#[derive(Debug, Clone, Default)]
pub struct DeleteImageOptions {
    /// Wait for referenced resources to be cleaned up.
    pub synchronous: bool,
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone)]
pub struct HostMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Request to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerRequest {
    /// Runtime container id. Also the default writable snapshot key.
    pub id: String,
    pub image_ref: String,
    /// Snapshot key to bind the container to. Empty means a fresh snapshot
    /// keyed by `id` (create) or is invalid (create-from-snapshot).
    pub snapshot_key: String,
    pub snapshotter: String,
    pub labels: HashMap<String, String>,
    /// Bind mounts added to the OCI spec.
    pub mounts: Vec<HostMount>,
    /// Extra environment entries (`KEY=value`) appended to the image env.
    pub env: Vec<String>,
}

/// Options for deleting a container.
#[derive(Debug, Clone)]
pub struct DeleteContainerOptions {
    /// Also remove the container's writable snapshot.
    pub cleanup_snapshot: bool,
}

impl Default for DeleteContainerOptions {
    fn default() -> Self {
        Self {
            cleanup_snapshot: true,
        }
    }
}

/// Options for starting a container task.
#[derive(Debug, Clone, Default)]
pub struct StartTaskOptions {
    /// Inherit the caller's stdio.
    pub use_stdio: bool,
    pub terminal: bool,
    /// Directory for stdio FIFOs; a temporary directory when unset.
    pub fifo_dir: Option<PathBuf>,
}

/// Options for stopping a task.
#[derive(Debug, Clone)]
pub struct StopTaskOptions {
    /// Signal sent first (SIGTERM by default).
    pub signal: i32,
    /// How long to wait for the task to exit.
    pub timeout: Duration,
    /// Send SIGKILL when the timeout elapses instead of failing.
    pub force: bool,
}

impl Default for StopTaskOptions {
    fn default() -> Self {
        Self {
            signal: libc::SIGTERM,
            timeout: Duration::from_secs(10),
            force: false,
        }
    }
}

/// Options for deleting a task.
#[derive(Debug, Clone, Default)]
pub struct DeleteTaskOptions {
    /// SIGKILL the task before deleting it.
    pub force: bool,
}

/// Request to execute a process inside a running container.
///
/// The container's OCI spec is reused; `args`, `env`, `work_dir` and
/// `terminal` overlay the stored process definition.
#[derive(Debug, Clone, Default)]
pub struct ExecTaskRequest {
    pub args: Vec<String>,
    /// `KEY=value` entries appended to the container environment.
    pub env: Vec<String>,
    pub work_dir: Option<String>,
    pub terminal: bool,
    /// Relay process stdio to the caller's terminal as it is produced.
    pub use_stdio: bool,
}

/// Result of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecTaskResult {
    pub exit_code: u32,
}

/// Options for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct ListTasksOptions {
    /// containerd filter expression.
    pub filter: Option<String>,
}

/// Task status as reported by containerd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

impl TaskStatus {
    pub fn from_i32(status: i32) -> Self {
        match status {
            1 => TaskStatus::Created,
            2 => TaskStatus::Running,
            3 => TaskStatus::Stopped,
            4 => TaskStatus::Paused,
            5 => TaskStatus::Pausing,
            _ => TaskStatus::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

/// Task metadata.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub container_id: String,
    pub id: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub exit_status: u32,
}

/// Image metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub digest: Option<String>,
}

/// Container metadata.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub snapshotter: String,
    pub snapshot_key: String,
    /// Serialized OCI spec, reused by exec.
    pub spec: Option<prost_types::Any>,
}

/// One mount instruction for materializing a snapshot on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Filesystem type ("overlay", "bind", ...).
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_defaults_are_sigterm_ten_seconds() {
        let opts = StopTaskOptions::default();
        assert_eq!(opts.signal, libc::SIGTERM);
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert!(!opts.force);
    }

    #[test]
    fn task_status_mapping() {
        assert_eq!(TaskStatus::from_i32(2), TaskStatus::Running);
        assert_eq!(TaskStatus::from_i32(3), TaskStatus::Stopped);
        assert_eq!(TaskStatus::from_i32(42), TaskStatus::Unknown);
        assert!(TaskStatus::Running.is_running());
        assert!(!TaskStatus::Stopped.is_running());
    }
}
