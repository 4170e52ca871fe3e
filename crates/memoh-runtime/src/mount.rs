//! Host-side snapshot mounting.
//!
//! Materializes a snapshot's mount instructions into a unique temporary
//! directory and hands back a [`MountedSnapshot`] whose release unmounts and
//! removes it. Handles are scoped to a single operation; callers must
//! release on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use memoh_core::{Error, Result};

use crate::service::RuntimeService;
use crate::types::MountSpec;

/// A snapshot mounted on the host.
#[derive(Debug)]
pub struct MountedSnapshot {
    dir: PathBuf,
    snapshotter: String,
    snapshot_key: String,
    labels: HashMap<String, String>,
    mounted: bool,
}

impl MountedSnapshot {
    /// Host directory the snapshot is mounted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Labels of the container the snapshot belongs to (empty for
    /// free-standing snapshot mounts).
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// Unmount and remove the mount directory.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        umount2(&self.dir, MntFlags::MNT_DETACH)
            .map_err(|e| Error::internal(format!("umount {}: {e}", self.dir.display())))?;
        std::fs::remove_dir_all(&self.dir)
            .map_err(|e| Error::internal(format!("remove {}: {e}", self.dir.display())))?;
        Ok(())
    }

    /// Wrap an already-materialized directory. Used by runtime
    /// implementations whose snapshots live directly on the host
    /// filesystem; release then only removes bookkeeping, not data.
    pub fn from_host_dir(
        dir: PathBuf,
        snapshotter: impl Into<String>,
        snapshot_key: impl Into<String>,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            dir,
            snapshotter: snapshotter.into(),
            snapshot_key: snapshot_key.into(),
            labels,
            mounted: false,
        }
    }
}

impl Drop for MountedSnapshot {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = self.release_inner() {
                tracing::warn!(dir = %self.dir.display(), error = %err, "leaked snapshot mount");
            }
        }
    }
}

/// Mount the writable snapshot of a container. The handle carries the
/// container's labels so callers can enforce the user-label guard.
pub async fn mount_container_snapshot(
    service: &dyn RuntimeService,
    container_id: &str,
) -> Result<MountedSnapshot> {
    let info = service.get_container(container_id).await?;
    let mounts = service
        .snapshot_mounts(&info.snapshotter, &info.snapshot_key)
        .await?;
    materialize(mounts, info.snapshotter, info.snapshot_key, info.labels)
}

/// Mount an arbitrary named snapshot (used for version diffs).
pub async fn mount_snapshot(
    service: &dyn RuntimeService,
    snapshotter: &str,
    snapshot_key: &str,
) -> Result<MountedSnapshot> {
    let mounts = service.snapshot_mounts(snapshotter, snapshot_key).await?;
    materialize(
        mounts,
        snapshotter.to_string(),
        snapshot_key.to_string(),
        HashMap::new(),
    )
}

fn materialize(
    mounts: Vec<MountSpec>,
    snapshotter: String,
    snapshot_key: String,
    labels: HashMap<String, String>,
) -> Result<MountedSnapshot> {
    if mounts.is_empty() {
        return Err(Error::internal(format!(
            "snapshot {snapshot_key} has no mounts"
        )));
    }

    let dir = tempfile::Builder::new()
        .prefix("memoh-snapshot-")
        .tempdir()
        .map_err(|e| Error::internal(format!("create mount dir: {e}")))?
        .keep();

    for spec in &mounts {
        if let Err(err) = apply_mount(spec, &dir) {
            let _ = umount2(&dir, MntFlags::MNT_DETACH);
            let _ = std::fs::remove_dir_all(&dir);
            return Err(err);
        }
    }

    Ok(MountedSnapshot {
        dir,
        snapshotter,
        snapshot_key,
        labels,
        mounted: true,
    })
}

fn apply_mount(spec: &MountSpec, target: &Path) -> Result<()> {
    let (flags, data) = split_options(&spec.kind, &spec.options);
    let fstype = if spec.kind == "bind" {
        None
    } else {
        Some(spec.kind.as_str())
    };
    let data_ref = if data.is_empty() {
        None
    } else {
        Some(data.as_str())
    };

    mount(
        Some(spec.source.as_str()),
        target,
        fstype,
        flags,
        data_ref,
    )
    .map_err(|e| {
        Error::internal(format!(
            "mount {} ({}) at {}: {e}",
            spec.source,
            spec.kind,
            target.display()
        ))
    })
}

/// Partition mount options into syscall flags and filesystem data.
fn split_options(kind: &str, options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    if kind == "bind" {
        flags |= MsFlags::MS_BIND;
    }
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            other => data.push(other.to_string()),
        }
    }
    (flags, data.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_options_separates_flags_from_data() {
        let options = vec![
            "ro".to_string(),
            "index=off".to_string(),
            "lowerdir=/a:/b".to_string(),
        ];
        let (flags, data) = split_options("overlay", &options);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data, "index=off,lowerdir=/a:/b");
    }

    #[test]
    fn split_options_bind_kind_sets_bind_flag() {
        let (flags, data) = split_options("bind", &["rbind".to_string(), "rw".to_string()]);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
        assert!(data.is_empty());
    }

    #[test]
    fn host_dir_handle_release_is_noop() {
        let handle = MountedSnapshot::from_host_dir(
            PathBuf::from("/tmp/somewhere"),
            "overlayfs",
            "memoh-user-alice",
            HashMap::new(),
        );
        assert_eq!(handle.dir(), Path::new("/tmp/somewhere"));
        handle.release().unwrap();
    }
}
