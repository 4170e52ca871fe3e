//! containerd-backed implementation of [`RuntimeService`].
//!
//! Talks to containerd over its gRPC socket. Container processes get their
//! stdio through FIFOs created under the state directory; exec relays FIFO
//! output to the caller's terminal while the process runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime as ContainerRuntimeSpec;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    CommitSnapshotRequest, MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest as ApiCreateContainerRequest, CreateTaskRequest,
    DeleteContainerRequest, DeleteImageRequest, DeleteProcessRequest, DeleteTaskRequest,
    ExecProcessRequest, GetContainerRequest, GetImageRequest, GetRequest as GetTaskRequest,
    KillRequest, ListContainersRequest, ListImagesRequest, ListTasksRequest, ReadContentRequest,
    StartRequest, TransferRequest, WaitRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform};
use containerd_client::{connect, to_any, with_namespace};
use oci_spec::runtime::{
    LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, MountBuilder, Process,
    ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use sha2::{Digest, Sha256};
use tokio::fs;
use tonic::transport::Channel;
// Required for the with_namespace! macro.
use tonic::Request;

use memoh_core::{Error, Result};

use crate::service::RuntimeService;
use crate::types::{
    ContainerInfo, CreateContainerRequest, DeleteContainerOptions, DeleteImageOptions,
    DeleteTaskOptions, ExecTaskRequest, ExecTaskResult, ImageInfo, ListTasksOptions, MountSpec,
    PullImageOptions, StartTaskOptions, StopTaskOptions, TaskInfo, TaskStatus,
};

const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const RUNTIME_NAME: &str = "io.containerd.runc.v2";

const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const PROCESS_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";

/// Container runtime over the containerd gRPC API.
pub struct ContainerdRuntime {
    channel: Channel,
    namespace: String,
    state_dir: PathBuf,
}

impl ContainerdRuntime {
    /// Connect to containerd at `socket_path`, pinning `namespace`.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        namespace: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| Error::internal(format!("create state dir: {e}")))?;

        let channel = connect(socket_path.as_ref())
            .await
            .map_err(|e| Error::internal(format!("connect containerd: {e}")))?;

        Ok(Self {
            channel,
            namespace: namespace.into(),
            state_dir,
        })
    }

    fn ns(&self) -> &str {
        self.namespace.as_str()
    }

    fn container_state_dir(&self, container_id: &str) -> PathBuf {
        self.state_dir.join(container_id)
    }

    async fn create_fifo(&self, path: &Path) -> Result<()> {
        let _ = fs::remove_file(path).await;
        nix::unistd::mkfifo(
            path,
            nix::sys::stat::Mode::from_bits(0o600).unwrap_or(nix::sys::stat::Mode::S_IRUSR),
        )
        .map_err(|e| Error::internal(format!("mkfifo {}: {e}", path.display())))?;
        Ok(())
    }

    /// Read the image's OCI config: rootfs chain id plus process defaults.
    async fn image_config(&self, image_ref: &str) -> Result<ImageRuntimeConfig> {
        let mut images = ImagesClient::new(self.channel.clone());
        let __req_req_1 = GetImageRequest {
                name: image_ref.to_string(),
            };
        let req = with_namespace!(__req_req_1, self.ns());
        let image = images
            .get(req)
            .await
            .map_err(|e| grpc_err("image", image_ref, e))?
            .into_inner()
            .image
            .ok_or_else(|| Error::not_found("image", image_ref))?;

        let manifest_digest = image
            .target
            .ok_or_else(|| Error::internal(format!("image {image_ref} has no target")))?
            .digest;

        let manifest: serde_json::Value = self.read_content_json(&manifest_digest).await?;

        // Multi-platform images point at an index; descend into the first
        // linux manifest.
        let manifest = if manifest.get("manifests").is_some() {
            let digest = manifest["manifests"]
                .as_array()
                .and_then(|m| {
                    m.iter().find(|entry| {
                        entry["platform"]["os"].as_str() == Some("linux")
                            && entry["platform"]["architecture"].as_str() == Some(oci_arch())
                    })
                })
                .and_then(|entry| entry["digest"].as_str())
                .ok_or_else(|| {
                    Error::internal(format!("image {image_ref}: no linux manifest in index"))
                })?
                .to_string();
            self.read_content_json(&digest).await?
        } else {
            manifest
        };

        let config_digest = manifest["config"]["digest"]
            .as_str()
            .ok_or_else(|| Error::internal(format!("image {image_ref}: manifest has no config")))?
            .to_string();

        let config: serde_json::Value = self.read_content_json(&config_digest).await?;

        let diff_ids: Vec<String> = config["rootfs"]["diff_ids"]
            .as_array()
            .ok_or_else(|| Error::internal(format!("image {image_ref}: config has no diff_ids")))?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();

        let string_list = |value: &serde_json::Value| -> Vec<String> {
            value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut args = string_list(&config["config"]["Entrypoint"]);
        args.extend(string_list(&config["config"]["Cmd"]));

        Ok(ImageRuntimeConfig {
            chain_id: compute_chain_id(&diff_ids),
            env: string_list(&config["config"]["Env"]),
            args,
            cwd: config["config"]["WorkingDir"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    async fn read_content_json(&self, digest: &str) -> Result<serde_json::Value> {
        let mut content = ContentClient::new(self.channel.clone());
        let __req_req_2 = ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
            };
        let req = with_namespace!(__req_req_2, self.ns());
        let mut stream = content
            .read(req)
            .await
            .map_err(|e| grpc_err("content", digest, e))?
            .into_inner();

        let mut bytes = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|e| Error::internal(format!("read content {digest}: {e}")))?
        {
            bytes.extend_from_slice(&chunk.data);
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::internal(format!("parse content {digest}: {e}")))
    }

    async fn raw_snapshot_mounts(&self, snapshotter: &str, key: &str) -> Result<Vec<Mount>> {
        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let __req_req_3 = MountsRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
            };
        let req = with_namespace!(__req_req_3, self.ns());
        let response = snapshots
            .mounts(req)
            .await
            .map_err(|e| grpc_err("snapshot", key, e))?;
        Ok(response.into_inner().mounts)
    }

    async fn create_container_inner(
        &self,
        req: CreateContainerRequest,
        prepare_fresh_snapshot: bool,
    ) -> Result<ContainerInfo> {
        if req.id.is_empty() || req.image_ref.is_empty() {
            return Err(Error::invalid("container id and image ref are required"));
        }
        if !prepare_fresh_snapshot && req.snapshot_key.is_empty() {
            return Err(Error::invalid("snapshot key is required"));
        }

        // Pull on demand so first use does not need a separate init step.
        let image = match self.image_config(&req.image_ref).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => {
                self.pull_image(
                    &req.image_ref,
                    &PullImageOptions {
                        unpack: true,
                        snapshotter: req.snapshotter.clone(),
                    },
                )
                .await?;
                self.image_config(&req.image_ref).await?
            }
            Err(err) => return Err(err),
        };

        let snapshot_key = if req.snapshot_key.is_empty() {
            req.id.clone()
        } else {
            req.snapshot_key.clone()
        };

        if prepare_fresh_snapshot {
            self.prepare_snapshot(&req.snapshotter, &snapshot_key, &image.chain_id)
                .await?;
        }

        let oci_spec = build_oci_spec(&req, &image)?;
        let spec_json = serde_json::to_vec(&oci_spec)
            .map_err(|e| Error::internal(format!("serialize OCI spec: {e}")))?;
        let spec_any = prost_types::Any {
            type_url: SPEC_TYPE_URL.to_string(),
            value: spec_json,
        };

        let container = Container {
            id: req.id.clone(),
            labels: req.labels.clone(),
            image: req.image_ref.clone(),
            runtime: Some(ContainerRuntimeSpec {
                name: RUNTIME_NAME.to_string(),
                options: None,
            }),
            spec: Some(spec_any.clone()),
            snapshotter: req.snapshotter.clone(),
            snapshot_key: snapshot_key.clone(),
            extensions: HashMap::new(),
            sandbox: String::new(),
            created_at: None,
            updated_at: None,
        };

        let mut containers = ContainersClient::new(self.channel.clone());
        let __create_req_4 = ApiCreateContainerRequest {
                container: Some(container),
            };
        let create = with_namespace!(__create_req_4, self.ns());
        containers
            .create(create)
            .await
            .map_err(|e| grpc_err("container", &req.id, e))?;

        Ok(ContainerInfo {
            id: req.id,
            image: req.image_ref,
            labels: req.labels,
            snapshotter: req.snapshotter,
            snapshot_key,
            spec: Some(spec_any),
        })
    }
}

/// Process-relevant bits of an image's OCI config.
#[derive(Debug, Clone, Default)]
struct ImageRuntimeConfig {
    chain_id: String,
    env: Vec<String>,
    args: Vec<String>,
    cwd: Option<String>,
}

fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        arch => arch,
    }
}

/// Compute the chain id from layer diff ids (OCI image spec algorithm).
fn compute_chain_id(diff_ids: &[String]) -> String {
    let mut chain_id = String::new();
    for diff_id in diff_ids {
        if chain_id.is_empty() {
            chain_id = diff_id.clone();
        } else {
            let input = format!("{chain_id} {diff_id}");
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            chain_id = format!("sha256:{:x}", hasher.finalize());
        }
    }
    chain_id
}

/// Build the OCI runtime spec for a user container.
fn build_oci_spec(req: &CreateContainerRequest, image: &ImageRuntimeConfig) -> Result<Spec> {
    let user = UserBuilder::default()
        .uid(0u32)
        .gid(0u32)
        .build()
        .map_err(|e| Error::internal(format!("build user: {e}")))?;

    let mut env = vec![DEFAULT_PATH_ENV.to_string()];
    env.extend(image.env.iter().cloned());
    env.extend(req.env.iter().cloned());

    let args = if image.args.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        image.args.clone()
    };

    let process = ProcessBuilder::default()
        .terminal(false)
        .user(user)
        .args(args)
        .env(env)
        .cwd(image.cwd.clone().unwrap_or_else(|| "/".to_string()))
        .no_new_privileges(true)
        .build()
        .map_err(|e| Error::internal(format!("build process: {e}")))?;

    let root = RootBuilder::default()
        .path("rootfs".to_string())
        .readonly(false)
        .build()
        .map_err(|e| Error::internal(format!("build root: {e}")))?;

    let namespaces = [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
    ]
    .into_iter()
    .map(|typ| {
        LinuxNamespaceBuilder::default()
            .typ(typ)
            .build()
            .map_err(|e| Error::internal(format!("build namespace: {e}")))
    })
    .collect::<Result<Vec<_>>>()?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .build()
        .map_err(|e| Error::internal(format!("build linux config: {e}")))?;

    let mounts = req
        .mounts
        .iter()
        .map(|m| {
            let mut options = vec!["rbind".to_string()];
            options.push(if m.read_only { "ro" } else { "rw" }.to_string());
            MountBuilder::default()
                .destination(m.container_path.clone())
                .typ("bind".to_string())
                .source(m.host_path.clone())
                .options(options)
                .build()
                .map_err(|e| Error::internal(format!("build mount: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut builder = SpecBuilder::default()
        .version("1.0.0".to_string())
        .root(root)
        .process(process)
        .linux(linux);
    if !mounts.is_empty() {
        builder = builder.mounts(mounts);
    }

    builder
        .build()
        .map_err(|e| Error::internal(format!("build OCI spec: {e}")))
}

fn grpc_err(kind: &'static str, id: &str, status: tonic::Status) -> Error {
    match status.code() {
        tonic::Code::NotFound => Error::not_found(kind, id),
        tonic::Code::InvalidArgument => {
            Error::invalid(format!("{kind} {id}: {}", status.message()))
        }
        _ => Error::internal(format!("{kind} {id}: {}", status.message())),
    }
}

fn container_info(container: Container) -> ContainerInfo {
    ContainerInfo {
        id: container.id,
        image: container.image,
        labels: container.labels,
        snapshotter: container.snapshotter,
        snapshot_key: container.snapshot_key,
        spec: container.spec,
    }
}

/// Relay a FIFO's content to the caller's stdout or stderr until EOF.
fn spawn_fifo_pump(path: PathBuf, to_stderr: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut fifo) = tokio::fs::File::open(&path).await else {
            return;
        };
        if to_stderr {
            let mut out = tokio::io::stderr();
            let _ = tokio::io::copy(&mut fifo, &mut out).await;
        } else {
            let mut out = tokio::io::stdout();
            let _ = tokio::io::copy(&mut fifo, &mut out).await;
        }
    })
}

#[async_trait]
impl RuntimeService for ContainerdRuntime {
    async fn pull_image(&self, image_ref: &str, opts: &PullImageOptions) -> Result<ImageInfo> {
        if image_ref.is_empty() {
            return Err(Error::invalid("image ref is required"));
        }

        let mut transfer = TransferClient::new(self.channel.clone());

        let source = OciRegistry {
            reference: image_ref.to_string(),
            resolver: None,
        };

        let platform = Platform {
            os: "linux".to_string(),
            architecture: oci_arch().to_string(),
            variant: String::new(),
            os_version: String::new(),
        };

        let unpacks = if opts.unpack {
            vec![UnpackConfiguration {
                platform: Some(platform.clone()),
                snapshotter: opts.snapshotter.clone(),
            }]
        } else {
            Vec::new()
        };

        let destination = ImageStore {
            name: image_ref.to_string(),
            labels: HashMap::new(),
            platforms: vec![platform],
            all_metadata: false,
            manifest_limit: 0,
            extra_references: vec![],
            unpacks,
        };

        let request = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: None,
        };
        let __request_req_5 = request;
        let request = with_namespace!(__request_req_5, self.ns());

        transfer
            .transfer(request)
            .await
            .map_err(|e| Error::internal(format!("pull {image_ref}: {}", e.message())))?;

        self.get_image(image_ref).await
    }

    async fn get_image(&self, image_ref: &str) -> Result<ImageInfo> {
        if image_ref.is_empty() {
            return Err(Error::invalid("image ref is required"));
        }
        let mut images = ImagesClient::new(self.channel.clone());
        let __req_req_6 = GetImageRequest {
                name: image_ref.to_string(),
            };
        let req = with_namespace!(__req_req_6, self.ns());
        let image = images
            .get(req)
            .await
            .map_err(|e| grpc_err("image", image_ref, e))?
            .into_inner()
            .image
            .ok_or_else(|| Error::not_found("image", image_ref))?;
        Ok(ImageInfo {
            name: image.name,
            digest: image.target.map(|t| t.digest),
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let mut images = ImagesClient::new(self.channel.clone());
        let __req_req_7 = ListImagesRequest { filters: vec![] };
        let req = with_namespace!(__req_req_7, self.ns());
        let response = images
            .list(req)
            .await
            .map_err(|e| Error::internal(format!("list images: {}", e.message())))?;
        Ok(response
            .into_inner()
            .images
            .into_iter()
            .map(|image| ImageInfo {
                name: image.name,
                digest: image.target.map(|t| t.digest),
            })
            .collect())
    }

    async fn delete_image(&self, image_ref: &str, opts: &DeleteImageOptions) -> Result<()> {
        if image_ref.is_empty() {
            return Err(Error::invalid("image ref is required"));
        }
        let mut images = ImagesClient::new(self.channel.clone());
        let __req_req_8 = DeleteImageRequest {
                name: image_ref.to_string(),
                sync: opts.synchronous,
            };
        let req = with_namespace!(__req_req_8, self.ns());
        images
            .delete(req)
            .await
            .map_err(|e| grpc_err("image", image_ref, e))?;
        Ok(())
    }

    async fn create_container(&self, req: CreateContainerRequest) -> Result<ContainerInfo> {
        self.create_container_inner(req, true).await
    }

    async fn create_container_from_snapshot(
        &self,
        req: CreateContainerRequest,
    ) -> Result<ContainerInfo> {
        self.create_container_inner(req, false).await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo> {
        if id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }
        let mut containers = ContainersClient::new(self.channel.clone());
        let __req_req_9 = GetContainerRequest { id: id.to_string() };
        let req = with_namespace!(__req_req_9, self.ns());
        let container = containers
            .get(req)
            .await
            .map_err(|e| grpc_err("container", id, e))?
            .into_inner()
            .container
            .ok_or_else(|| Error::not_found("container", id))?;
        Ok(container_info(container))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let mut containers = ContainersClient::new(self.channel.clone());
        let __req_req_10 = ListContainersRequest { filters: vec![] };
        let req = with_namespace!(__req_req_10, self.ns());
        let response = containers
            .list(req)
            .await
            .map_err(|e| Error::internal(format!("list containers: {}", e.message())))?;
        Ok(response
            .into_inner()
            .containers
            .into_iter()
            .map(container_info)
            .collect())
    }

    async fn list_containers_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerInfo>> {
        if key.is_empty() {
            return Err(Error::invalid("label key is required"));
        }
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
        if id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }

        let info = self.get_container(id).await?;

        let mut containers = ContainersClient::new(self.channel.clone());
        let __req_req_11 = DeleteContainerRequest { id: id.to_string() };
        let req = with_namespace!(__req_req_11, self.ns());
        containers
            .delete(req)
            .await
            .map_err(|e| grpc_err("container", id, e))?;

        if opts.cleanup_snapshot {
            if let Err(err) = self
                .remove_snapshot(&info.snapshotter, &info.snapshot_key)
                .await
            {
                tracing::warn!(container = id, error = %err, "failed to remove snapshot");
            }
        }

        let _ = fs::remove_dir_all(self.container_state_dir(id)).await;
        Ok(())
    }

    async fn start_task(&self, container_id: &str, opts: &StartTaskOptions) -> Result<TaskInfo> {
        if container_id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }

        let info = self.get_container(container_id).await?;
        let rootfs = self
            .raw_snapshot_mounts(&info.snapshotter, &info.snapshot_key)
            .await?;

        let fifo_dir = opts
            .fifo_dir
            .clone()
            .unwrap_or_else(|| self.container_state_dir(container_id));
        fs::create_dir_all(&fifo_dir)
            .await
            .map_err(|e| Error::internal(format!("create fifo dir: {e}")))?;

        let stdout_path = fifo_dir.join("stdout");
        let stderr_path = fifo_dir.join("stderr");
        self.create_fifo(&stdout_path).await?;
        self.create_fifo(&stderr_path).await?;

        if opts.use_stdio {
            spawn_fifo_pump(stdout_path.clone(), false);
            spawn_fifo_pump(stderr_path.clone(), true);
        }

        let mut tasks = TasksClient::new(self.channel.clone());

        let __create_req_12 = CreateTaskRequest {
                container_id: container_id.to_string(),
                rootfs,
                stdin: String::new(),
                stdout: stdout_path.to_string_lossy().to_string(),
                stderr: stderr_path.to_string_lossy().to_string(),
                terminal: opts.terminal,
                checkpoint: None,
                options: None,
                runtime_path: String::new(),
            };
        let create = with_namespace!(__create_req_12, self.ns());
        let created = tasks
            .create(create)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;
        let pid = created.into_inner().pid;

        let __start_req_13 = StartRequest {
                container_id: container_id.to_string(),
                exec_id: String::new(),
            };
        let start = with_namespace!(__start_req_13, self.ns());
        tasks
            .start(start)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;

        Ok(TaskInfo {
            container_id: container_id.to_string(),
            id: container_id.to_string(),
            pid,
            status: TaskStatus::Running,
            exit_status: 0,
        })
    }

    async fn get_task(&self, container_id: &str) -> Result<TaskInfo> {
        if container_id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }
        let mut tasks = TasksClient::new(self.channel.clone());
        let __req_req_14 = GetTaskRequest {
                container_id: container_id.to_string(),
                exec_id: String::new(),
            };
        let req = with_namespace!(__req_req_14, self.ns());
        let process = tasks
            .get(req)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?
            .into_inner()
            .process
            .ok_or_else(|| Error::not_found("task", container_id))?;
        Ok(TaskInfo {
            container_id: container_id.to_string(),
            id: process.id,
            pid: process.pid,
            status: TaskStatus::from_i32(process.status),
            exit_status: process.exit_status,
        })
    }

    async fn list_tasks(&self, opts: &ListTasksOptions) -> Result<Vec<TaskInfo>> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let __req_req_15 = ListTasksRequest {
                filter: opts.filter.clone().unwrap_or_default(),
            };
        let req = with_namespace!(__req_req_15, self.ns());
        let response = tasks
            .list(req)
            .await
            .map_err(|e| Error::internal(format!("list tasks: {}", e.message())))?;
        Ok(response
            .into_inner()
            .tasks
            .into_iter()
            .map(|p| TaskInfo {
                container_id: p.container_id,
                id: p.id,
                pid: p.pid,
                status: TaskStatus::from_i32(p.status),
                exit_status: p.exit_status,
            })
            .collect())
    }

    async fn stop_task(&self, container_id: &str, opts: &StopTaskOptions) -> Result<()> {
        if container_id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }

        let mut tasks = TasksClient::new(self.channel.clone());

        let __kill_req_16 = KillRequest {
                container_id: container_id.to_string(),
                exec_id: String::new(),
                signal: opts.signal as u32,
                all: true,
            };
        let kill = with_namespace!(__kill_req_16, self.ns());
        tasks
            .kill(kill)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;

        let __wait_req_17 = WaitRequest {
                container_id: container_id.to_string(),
                exec_id: String::new(),
            };
        let wait = with_namespace!(__wait_req_17, self.ns());
        match tokio::time::timeout(opts.timeout, tasks.wait(wait)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(grpc_err("task", container_id, e)),
            Err(_) if opts.force => {
                let __kill_req_18 = KillRequest {
                        container_id: container_id.to_string(),
                        exec_id: String::new(),
                        signal: libc::SIGKILL as u32,
                        all: true,
                    };
                let kill = with_namespace!(__kill_req_18, self.ns());
                tasks
                    .kill(kill)
                    .await
                    .map_err(|e| grpc_err("task", container_id, e))?;
                let __wait_req_19 = WaitRequest {
                        container_id: container_id.to_string(),
                        exec_id: String::new(),
                    };
                let wait = with_namespace!(__wait_req_19, self.ns());
                tasks
                    .wait(wait)
                    .await
                    .map_err(|e| grpc_err("task", container_id, e))?;
                Ok(())
            }
            Err(_) => Err(Error::TaskStopTimeout {
                timeout: opts.timeout,
            }),
        }
    }

    async fn delete_task(&self, container_id: &str, opts: &DeleteTaskOptions) -> Result<()> {
        if container_id.is_empty() {
            return Err(Error::invalid("container id is required"));
        }
        let mut tasks = TasksClient::new(self.channel.clone());

        if opts.force {
            let __kill_req_20 = KillRequest {
                    container_id: container_id.to_string(),
                    exec_id: String::new(),
                    signal: libc::SIGKILL as u32,
                    all: true,
                };
            let kill = with_namespace!(__kill_req_20, self.ns());
            let _ = tasks.kill(kill).await;
        }

        let __delete_req_21 = DeleteTaskRequest {
                container_id: container_id.to_string(),
            };
        let delete = with_namespace!(__delete_req_21, self.ns());
        tasks
            .delete(delete)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;
        Ok(())
    }

    async fn exec_task(&self, container_id: &str, req: ExecTaskRequest) -> Result<ExecTaskResult> {
        if container_id.is_empty() || req.args.is_empty() {
            return Err(Error::invalid("container id and command are required"));
        }

        let info = self.get_container(container_id).await?;

        // Reuse the container's stored process definition, overlaying the
        // request's args, env, cwd and terminal.
        let spec_any = info
            .spec
            .ok_or_else(|| Error::internal(format!("container {container_id} has no spec")))?;
        let spec: Spec = serde_json::from_slice(&spec_any.value)
            .map_err(|e| Error::internal(format!("parse container spec: {e}")))?;
        let mut process: Process = spec.process().clone().unwrap_or_default();

        process.set_args(Some(req.args.clone()));
        if !req.env.is_empty() {
            let mut env = process.env().clone().unwrap_or_default();
            env.extend(req.env.iter().cloned());
            process.set_env(Some(env));
        }
        if let Some(work_dir) = &req.work_dir {
            process.set_cwd(PathBuf::from(work_dir));
        }
        if req.terminal {
            process.set_terminal(Some(true));
        }

        let process_json = serde_json::to_vec(&process)
            .map_err(|e| Error::internal(format!("serialize exec process: {e}")))?;
        let process_any = prost_types::Any {
            type_url: PROCESS_TYPE_URL.to_string(),
            value: process_json,
        };

        let exec_id = format!("exec-{}", uuid::Uuid::new_v4());
        let fifo_dir = self.container_state_dir(container_id);
        fs::create_dir_all(&fifo_dir)
            .await
            .map_err(|e| Error::internal(format!("create fifo dir: {e}")))?;
        let stdout_path = fifo_dir.join(format!("{exec_id}-stdout"));
        let stderr_path = fifo_dir.join(format!("{exec_id}-stderr"));
        self.create_fifo(&stdout_path).await?;
        self.create_fifo(&stderr_path).await?;

        let pumps = if req.use_stdio {
            vec![
                spawn_fifo_pump(stdout_path.clone(), false),
                spawn_fifo_pump(stderr_path.clone(), true),
            ]
        } else {
            Vec::new()
        };

        let mut tasks = TasksClient::new(self.channel.clone());

        let __exec_req_22 = ExecProcessRequest {
                container_id: container_id.to_string(),
                stdin: String::new(),
                stdout: stdout_path.to_string_lossy().to_string(),
                stderr: stderr_path.to_string_lossy().to_string(),
                terminal: req.terminal,
                spec: Some(process_any),
                exec_id: exec_id.clone(),
            };
        let exec = with_namespace!(__exec_req_22, self.ns());
        tasks
            .exec(exec)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;

        let __start_req_23 = StartRequest {
                container_id: container_id.to_string(),
                exec_id: exec_id.clone(),
            };
        let start = with_namespace!(__start_req_23, self.ns());
        tasks
            .start(start)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?;

        let __wait_req_24 = WaitRequest {
                container_id: container_id.to_string(),
                exec_id: exec_id.clone(),
            };
        let wait = with_namespace!(__wait_req_24, self.ns());
        let exit_status = tasks
            .wait(wait)
            .await
            .map_err(|e| grpc_err("task", container_id, e))?
            .into_inner()
            .exit_status;

        // The FIFO writers close when the process exits; give the pumps a
        // moment to drain.
        for pump in pumps {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), pump).await;
        }

        let __delete_req_25 = DeleteProcessRequest {
                container_id: container_id.to_string(),
                exec_id: exec_id.clone(),
            };
        let delete = with_namespace!(__delete_req_25, self.ns());
        let _ = tasks.delete_process(delete).await;

        let _ = fs::remove_file(&stdout_path).await;
        let _ = fs::remove_file(&stderr_path).await;

        Ok(ExecTaskResult { exit_code: exit_status })
    }

    async fn prepare_snapshot(&self, snapshotter: &str, key: &str, parent: &str) -> Result<()> {
        if snapshotter.is_empty() || key.is_empty() || parent.is_empty() {
            return Err(Error::invalid("snapshotter, key and parent are required"));
        }
        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let __req_req_26 = PrepareSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                parent: parent.to_string(),
                labels: HashMap::new(),
            };
        let req = with_namespace!(__req_req_26, self.ns());
        snapshots
            .prepare(req)
            .await
            .map_err(|e| grpc_err("snapshot", key, e))?;
        Ok(())
    }

    async fn commit_snapshot(&self, snapshotter: &str, name: &str, key: &str) -> Result<()> {
        if snapshotter.is_empty() || name.is_empty() || key.is_empty() {
            return Err(Error::invalid("snapshotter, name and key are required"));
        }
        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let __req_req_27 = CommitSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                name: name.to_string(),
                key: key.to_string(),
                labels: HashMap::new(),
            };
        let req = with_namespace!(__req_req_27, self.ns());
        snapshots
            .commit(req)
            .await
            .map_err(|e| grpc_err("snapshot", key, e))?;
        Ok(())
    }

    async fn remove_snapshot(&self, snapshotter: &str, key: &str) -> Result<()> {
        if snapshotter.is_empty() || key.is_empty() {
            return Err(Error::invalid("snapshotter and key are required"));
        }
        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let __req_req_28 = RemoveSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
            };
        let req = with_namespace!(__req_req_28, self.ns());
        snapshots
            .remove(req)
            .await
            .map_err(|e| grpc_err("snapshot", key, e))?;
        Ok(())
    }

    async fn snapshot_mounts(&self, snapshotter: &str, key: &str) -> Result<Vec<MountSpec>> {
        if snapshotter.is_empty() || key.is_empty() {
            return Err(Error::invalid("snapshotter and key are required"));
        }
        let mounts = self.raw_snapshot_mounts(snapshotter, key).await?;
        Ok(mounts
            .into_iter()
            .map(|m| MountSpec {
                kind: m.r#type,
                source: m.source,
                options: m.options,
            })
            .collect())
    }
}
