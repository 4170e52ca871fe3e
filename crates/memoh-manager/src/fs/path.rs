//! Container path resolution and symlink-safe host path joins.
//!
//! User-controlled paths never reach the host filesystem directly: they are
//! first confined to the data mount lexically, then re-resolved under the
//! snapshot mount directory refusing any symlink that escapes it.

use std::path::{Component, Path, PathBuf};

use memoh_core::{Error, Result};

/// Upper bound on symlink hops while resolving one path.
const MAX_SYMLINK_HOPS: u32 = 40;

/// Resolve a request path against the data mount.
///
/// `data_mount` must be absolute. An absolute request path must already lie
/// within the data mount; a relative one is joined under it. The result is
/// lexically cleaned and never escapes the mount.
pub fn resolve_container_path(data_mount: &str, request_path: &str) -> Result<String> {
    let mount = clean_path(data_mount);
    if !mount.starts_with('/') {
        return Err(Error::invalid("data mount must be absolute"));
    }

    if request_path.is_empty() {
        return Ok(mount);
    }

    let cleaned = clean_path(request_path);
    if cleaned.starts_with('/') {
        if !path_within(&cleaned, &mount) {
            return Err(Error::invalid("path outside data mount"));
        }
        return Ok(cleaned);
    }

    let joined = format!("{mount}/{cleaned}");
    let joined = clean_path(&joined);
    if !path_within(&joined, &mount) {
        return Err(Error::invalid("path outside data mount"));
    }
    Ok(joined)
}

/// Lexically clean a slash-separated path, resolving `.` and `..` without
/// touching the filesystem.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn path_within(target: &str, base: &str) -> bool {
    if base == "/" {
        return target.starts_with('/');
    }
    if target == base {
        return true;
    }
    match target.strip_prefix(base) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Securely join a container path under the snapshot mount directory.
///
/// Walks the path component by component. Any symlink whose target resolves
/// outside `mount_dir` fails with `InvalidArgument`; the final component may
/// be absent (for writes).
pub fn resolve_host_path(mount_dir: &Path, container_path: &str) -> Result<PathBuf> {
    let rel = container_path.trim_start_matches('/');
    let mut resolved = mount_dir.to_path_buf();
    let mut hops = 0u32;

    let mut pending: Vec<String> = rel
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    pending.reverse();

    while let Some(component) = pending.pop() {
        match component.as_str() {
            "." => continue,
            ".." => {
                if !resolved.starts_with(mount_dir) || resolved == mount_dir {
                    return Err(Error::invalid("path outside mount"));
                }
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = resolved.join(&component);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::invalid("too many symlinks"));
                }
                let target = std::fs::read_link(&candidate)
                    .map_err(|e| Error::internal(format!("readlink: {e}")))?;
                if target.is_absolute() {
                    // Absolute targets are re-rooted at the mount, matching
                    // in-container resolution where / is the snapshot root.
                    resolved = mount_dir.to_path_buf();
                    for part in target
                        .components()
                        .filter_map(|c| match c {
                            Component::Normal(p) => p.to_str(),
                            Component::ParentDir => Some(".."),
                            _ => None,
                        })
                        .rev()
                    {
                        pending.push(part.to_string());
                    }
                } else {
                    for part in target
                        .components()
                        .filter_map(|c| match c {
                            Component::Normal(p) => p.to_str(),
                            Component::ParentDir => Some(".."),
                            _ => None,
                        })
                        .rev()
                    {
                        pending.push(part.to_string());
                    }
                }
            }
            _ => {
                resolved = candidate;
            }
        }

        if !resolved.starts_with(mount_dir) {
            return Err(Error::invalid("path outside mount"));
        }
    }

    if !resolved.starts_with(mount_dir) {
        return Err(Error::invalid("path outside mount"));
    }
    Ok(resolved)
}

/// Container path for a host path under the mount directory.
pub fn container_path_for_host(mount_dir: &Path, host_path: &Path) -> Result<String> {
    let rel = host_path
        .strip_prefix(mount_dir)
        .map_err(|_| Error::invalid("path escapes mount"))?;
    let rel = rel.to_str().ok_or_else(|| Error::invalid("non-utf8 path"))?;
    Ok(format!("/{rel}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_path_defaults_to_mount() {
        assert_eq!(resolve_container_path("/data", "").unwrap(), "/data");
    }

    #[test]
    fn container_path_joins_relative() {
        assert_eq!(
            resolve_container_path("/data", "notes.txt").unwrap(),
            "/data/notes.txt"
        );
        assert_eq!(
            resolve_container_path("/data", "a/b/../c").unwrap(),
            "/data/a/c"
        );
    }

    #[test]
    fn container_path_accepts_absolute_inside_mount() {
        assert_eq!(
            resolve_container_path("/data", "/data/notes.txt").unwrap(),
            "/data/notes.txt"
        );
        assert_eq!(resolve_container_path("/data", "/data").unwrap(), "/data");
    }

    #[test]
    fn container_path_rejects_escape() {
        for path in ["/etc/passwd", "/data/../../etc/passwd", "../x", "/datax/y"] {
            assert!(
                matches!(
                    resolve_container_path("/data", path),
                    Err(Error::InvalidArgument(_))
                ),
                "expected {path} to be rejected"
            );
        }
    }

    #[test]
    fn container_path_requires_absolute_mount() {
        assert!(resolve_container_path("data", "x").is_err());
    }

    #[test]
    fn host_path_joins_under_mount() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_host_path(dir.path(), "/data/notes.txt").unwrap();
        assert_eq!(resolved, dir.path().join("data/notes.txt"));
    }

    #[test]
    fn host_path_rejects_dotdot_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_host_path(dir.path(), "/../etc/passwd").is_err());
        assert!(resolve_host_path(dir.path(), "a/../../etc").is_err());
    }

    #[test]
    fn host_path_refuses_escaping_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::os::unix::fs::symlink("../../../../etc", dir.path().join("data/evil")).unwrap();

        let result = resolve_host_path(dir.path(), "/data/evil/passwd");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn host_path_reroots_absolute_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::create_dir_all(dir.path().join("srv")).unwrap();
        std::fs::write(dir.path().join("srv/file"), b"x").unwrap();
        std::os::unix::fs::symlink("/srv", dir.path().join("data/link")).unwrap();

        let resolved = resolve_host_path(dir.path(), "/data/link/file").unwrap();
        assert_eq!(resolved, dir.path().join("srv/file"));
    }

    #[test]
    fn host_path_follows_safe_relative_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/real")).unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("data/alias")).unwrap();

        let resolved = resolve_host_path(dir.path(), "/data/alias/file.txt").unwrap();
        assert_eq!(resolved, dir.path().join("data/real/file.txt"));
    }

    #[test]
    fn container_path_for_host_reprefixes() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("data/a/b.txt");
        assert_eq!(
            container_path_for_host(dir.path(), &host).unwrap(),
            "/data/a/b.txt"
        );
        assert!(container_path_for_host(dir.path(), Path::new("/etc/passwd")).is_err());
    }
}
