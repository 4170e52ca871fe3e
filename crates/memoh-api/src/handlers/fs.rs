//! Filesystem endpoints over the user's container snapshot.
//!
//! Every handler resolves the authenticated user id, mounts the container's
//! writable snapshot (or a version snapshot for diff), performs the
//! operation host-side and releases the mount on all paths.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use memoh_core::{container_id_for_user, validate_user_id, USER_LABEL_KEY};
use memoh_manager::fs;
use memoh_runtime::{mount_container_snapshot, mount_snapshot, MountedSnapshot};

use crate::auth::AuthUser;
use crate::error::{ApiError, Result};
use crate::router::ApiState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadResponse {
    pub path: String,
    /// Base64-encoded file content.
    pub content: String,
    pub encoding: String,
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListResponse {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WriteAtomicRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyPatchRequest {
    pub path: String,
    pub patch: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommitResponse {
    pub id: Uuid,
    pub version: i32,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DiffResponse {
    pub path: String,
    pub version: i32,
    pub diff: String,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub recursive: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    #[serde(default)]
    pub path: Option<String>,
    pub version: i32,
}

fn require_user_id(user: &AuthUser) -> Result<String> {
    validate_user_id(&user.user_id)?;
    Ok(user.user_id.clone())
}

/// Mount the user's container snapshot and enforce the user-label guard.
async fn mount_user(state: &ApiState, user_id: &str) -> Result<MountedSnapshot> {
    let container_id = container_id_for_user(user_id);
    let mount = mount_container_snapshot(state.manager.runtime().as_ref(), &container_id).await?;
    match mount.labels().get(USER_LABEL_KEY) {
        Some(label) if label == user_id => Ok(mount),
        _ => {
            let _ = mount.release();
            Err(ApiError::Forbidden("user mismatch".to_string()))
        }
    }
}

fn release(mount: MountedSnapshot) -> Result<()> {
    mount.release().map_err(ApiError::from)
}

#[utoipa::path(
    get,
    path = "/fs/read",
    params(("path" = Option<String>, Query, description = "Path under the data mount")),
    responses(
        (status = 200, description = "File content", body = ReadResponse),
        (status = 400, description = "Invalid path"),
        (status = 404, description = "File not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Filesystem"
)]
pub async fn read(
    user: AuthUser,
    State(state): State<ApiState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ReadResponse>> {
    let user_id = require_user_id(&user)?;
    let mount = mount_user(&state, &user_id).await?;

    let result = fs::read_file(
        mount.dir(),
        state.manager.data_mount(),
        query.path.as_deref().unwrap_or(""),
    );
    release(mount)?;
    let file = result?;

    Ok(Json(ReadResponse {
        path: file.container_path,
        content: base64::engine::general_purpose::STANDARD.encode(&file.data),
        encoding: "base64".to_string(),
        size: file.size,
        mode: file.mode,
        mod_time: file.modified,
    }))
}

#[utoipa::path(
    get,
    path = "/fs/list",
    params(
        ("path" = Option<String>, Query, description = "Path under the data mount"),
        ("recursive" = Option<bool>, Query, description = "Recursive listing"),
    ),
    responses(
        (status = 200, description = "Directory entries", body = ListResponse),
        (status = 400, description = "Invalid path"),
        (status = 404, description = "Path not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Filesystem"
)]
pub async fn list(
    user: AuthUser,
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let user_id = require_user_id(&user)?;
    let mount = mount_user(&state, &user_id).await?;

    let result = fs::list_dir(
        mount.dir(),
        state.manager.data_mount(),
        query.path.as_deref().unwrap_or(""),
        query.recursive.unwrap_or(false),
    );
    release(mount)?;
    let (path, entries) = result?;

    Ok(Json(ListResponse {
        path,
        entries: entries
            .into_iter()
            .map(|e| FileEntry {
                path: e.container_path,
                is_dir: e.is_dir,
                size: e.size,
                mode: e.mode,
                mod_time: e.modified,
            })
            .collect(),
    }))
}

#[utoipa::path(
    put,
    path = "/fs/write_atomic",
    request_body = WriteAtomicRequest,
    responses(
        (status = 204, description = "File written"),
        (status = 400, description = "Invalid path or encoding"),
        (status = 404, description = "Container not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Filesystem"
)]
pub async fn write_atomic(
    user: AuthUser,
    State(state): State<ApiState>,
    Json(req): Json<WriteAtomicRequest>,
) -> Result<StatusCode> {
    let user_id = require_user_id(&user)?;
    if req.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".to_string()));
    }

    let data = fs::decode_content(&req.content, req.encoding.as_deref().unwrap_or(""))?;

    let mount = mount_user(&state, &user_id).await?;
    let result = fs::write_atomic(
        mount.dir(),
        state.manager.data_mount(),
        &req.path,
        &data,
        &fs::WriteOptions {
            mode: req.mode,
            mtime: req.mtime,
        },
    );
    release(mount)?;
    result?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/fs/apply_patch",
    request_body = ApplyPatchRequest,
    responses(
        (status = 204, description = "Patch applied"),
        (status = 400, description = "Malformed patch or mismatch"),
        (status = 404, description = "File not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Filesystem"
)]
pub async fn apply_patch(
    user: AuthUser,
    State(state): State<ApiState>,
    Json(req): Json<ApplyPatchRequest>,
) -> Result<StatusCode> {
    let user_id = require_user_id(&user)?;
    if req.path.is_empty() || req.patch.is_empty() {
        return Err(ApiError::BadRequest(
            "path and patch are required".to_string(),
        ));
    }

    let mount = mount_user(&state, &user_id).await?;
    let result = fs::apply_patch_file(
        mount.dir(),
        state.manager.data_mount(),
        &req.path,
        &req.patch,
    );
    release(mount)?;
    result?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/fs/commit",
    responses(
        (status = 200, description = "New version", body = CommitResponse),
        (status = 404, description = "Container not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Versions"
)]
pub async fn commit(
    user: AuthUser,
    State(state): State<ApiState>,
) -> Result<Json<CommitResponse>> {
    let user_id = require_user_id(&user)?;
    let row = state.manager.create_version(&user_id).await?;
    Ok(Json(CommitResponse {
        id: row.id,
        version: row.version,
        snapshot_id: row.snapshot_id,
        created_at: row.created_at,
    }))
}

#[utoipa::path(
    get,
    path = "/fs/diff",
    params(
        ("path" = Option<String>, Query, description = "Path under the data mount"),
        ("version" = i32, Query, description = "Version to diff against"),
    ),
    responses(
        (status = 200, description = "Unified diff", body = DiffResponse),
        (status = 400, description = "Invalid version"),
        (status = 404, description = "Version not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Versions"
)]
pub async fn diff(
    user: AuthUser,
    State(state): State<ApiState>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffResponse>> {
    let user_id = require_user_id(&user)?;
    if query.version <= 0 {
        return Err(ApiError::NotFound("version not found".to_string()));
    }

    let current = mount_user(&state, &user_id).await?;

    let snapshot_id = match state
        .manager
        .version_snapshot_id(&user_id, query.version)
        .await
    {
        Ok(id) => id,
        Err(err) => {
            let _ = current.release();
            return Err(err.into());
        }
    };

    let version_mount = match mount_snapshot(
        state.manager.runtime().as_ref(),
        current.snapshotter(),
        &snapshot_id,
    )
    .await
    {
        Ok(mount) => mount,
        Err(err) => {
            let _ = current.release();
            return Err(err.into());
        }
    };

    let result = fs::diff_against(
        current.dir(),
        version_mount.dir(),
        state.manager.data_mount(),
        query.path.as_deref().unwrap_or(""),
    );
    let released_version = release(version_mount);
    let released_current = release(current);
    let (path, diff) = result?;
    released_version?;
    released_current?;

    Ok(Json(DiffResponse {
        path,
        version: query.version,
        diff,
    }))
}
