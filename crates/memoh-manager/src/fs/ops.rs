//! File operations against a snapshot mount directory.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use base64::Engine;
use chrono::{DateTime, Utc};

use memoh_core::{Error, Result};

use super::patch::{apply_unified_patch, unified_diff};
use super::path::{container_path_for_host, resolve_container_path, resolve_host_path};

/// Default mode for newly written files.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode for parent directories created on write.
const DIR_MODE: u32 = 0o755;

/// Content and metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub container_path: String,
    pub data: Vec<u8>,
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    pub modified: DateTime<Utc>,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub container_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u32,
    pub modified: DateTime<Utc>,
}

/// Options for atomic writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Permission bits; 0644 when unset.
    pub mode: Option<u32>,
    pub mtime: Option<DateTime<Utc>>,
}

/// Decode request content per its declared encoding.
pub fn decode_content(content: &str, encoding: &str) -> Result<Vec<u8>> {
    match encoding.to_ascii_lowercase().as_str() {
        "" | "plain" => Ok(content.as_bytes().to_vec()),
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| Error::invalid(format!("invalid base64 content: {e}"))),
        _ => Err(Error::invalid("unsupported encoding")),
    }
}

fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Read a file under the data mount.
pub fn read_file(mount_dir: &Path, data_mount: &str, request_path: &str) -> Result<FileContent> {
    let container_path = resolve_container_path(data_mount, request_path)?;
    let host_path = resolve_host_path(mount_dir, &container_path)?;

    let meta = std::fs::metadata(&host_path)
        .map_err(|e| stat_error(e, &container_path))?;
    if meta.is_dir() {
        return Err(Error::invalid("path is a directory"));
    }

    let data = std::fs::read(&host_path)
        .map_err(|e| Error::internal(format!("read {container_path}: {e}")))?;

    Ok(FileContent {
        container_path,
        size: meta.len(),
        mode: meta.permissions().mode() & 0o777,
        modified: modified_time(&meta),
        data,
    })
}

/// List a directory under the data mount. Recursive listings walk
/// depth-first and exclude the root itself.
pub fn list_dir(
    mount_dir: &Path,
    data_mount: &str,
    request_path: &str,
    recursive: bool,
) -> Result<(String, Vec<FileEntry>)> {
    let container_path = resolve_container_path(data_mount, request_path)?;
    let host_path = resolve_host_path(mount_dir, &container_path)?;

    let meta = std::fs::metadata(&host_path)
        .map_err(|e| stat_error(e, &container_path))?;
    if !meta.is_dir() {
        return Err(Error::invalid("path is not a directory"));
    }

    let mut entries = Vec::new();
    collect_entries(mount_dir, &host_path, recursive, &mut entries)?;
    Ok((container_path, entries))
}

fn collect_entries(
    mount_dir: &Path,
    dir: &Path,
    recursive: bool,
    entries: &mut Vec<FileEntry>,
) -> Result<()> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| Error::internal(format!("read dir {}: {e}", dir.display())))?;
    let mut children: Vec<_> = read
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::internal(format!("read dir {}: {e}", dir.display())))?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let meta = child
            .metadata()
            .map_err(|e| Error::internal(format!("stat {}: {e}", path.display())))?;
        entries.push(FileEntry {
            container_path: container_path_for_host(mount_dir, &path)?,
            is_dir: meta.is_dir(),
            size: meta.len(),
            mode: meta.permissions().mode() & 0o777,
            modified: modified_time(&meta),
        });
        if recursive && meta.is_dir() {
            collect_entries(mount_dir, &path, recursive, entries)?;
        }
    }
    Ok(())
}

/// Atomically replace a file under the data mount.
///
/// The content lands in a temporary file in the target directory, is
/// fsynced, chmodded and finally renamed over the target; the rename is the
/// single commit point. Concurrent readers observe either the previous or
/// the new content, never a partial write.
pub fn write_atomic(
    mount_dir: &Path,
    data_mount: &str,
    request_path: &str,
    data: &[u8],
    opts: &WriteOptions,
) -> Result<String> {
    let container_path = resolve_container_path(data_mount, request_path)?;
    let host_path = resolve_host_path(mount_dir, &container_path)?;

    let dir = host_path
        .parent()
        .ok_or_else(|| Error::invalid("path has no parent directory"))?;
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::internal(format!("create parent dirs: {e}")))?;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE));
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| Error::internal(format!("create temp file: {e}")))?;

    tmp.write_all(data)
        .map_err(|e| Error::internal(format!("write temp file: {e}")))?;
    tmp.flush()
        .map_err(|e| Error::internal(format!("flush temp file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::internal(format!("sync temp file: {e}")))?;

    let mode = opts.mode.unwrap_or(DEFAULT_FILE_MODE) & 0o777;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::internal(format!("chmod temp file: {e}")))?;

    if let Some(mtime) = opts.mtime {
        set_file_times(tmp.path(), mtime)?;
    }

    tmp.persist(&host_path)
        .map_err(|e| Error::internal(format!("rename over {container_path}: {}", e.error)))?;

    if let Some(mtime) = opts.mtime {
        let _ = set_file_times(&host_path, mtime);
    }

    Ok(container_path)
}

fn set_file_times(path: &Path, when: DateTime<Utc>) -> Result<()> {
    let time = nix::sys::time::TimeVal::new(
        when.timestamp(),
        i64::from(when.timestamp_subsec_micros()),
    );
    nix::sys::stat::utimes(path, &time, &time)
        .map_err(|e| Error::internal(format!("set times on {}: {e}", path.display())))
}

/// Apply a unified-diff patch to a file, preserving its mode.
pub fn apply_patch_file(
    mount_dir: &Path,
    data_mount: &str,
    request_path: &str,
    patch: &str,
) -> Result<String> {
    let container_path = resolve_container_path(data_mount, request_path)?;
    let host_path = resolve_host_path(mount_dir, &container_path)?;

    let meta = std::fs::metadata(&host_path)
        .map_err(|e| stat_error(e, &container_path))?;
    if meta.is_dir() {
        return Err(Error::invalid("path is a directory"));
    }
    let original = std::fs::read_to_string(&host_path)
        .map_err(|e| Error::internal(format!("read {container_path}: {e}")))?;

    let updated = apply_unified_patch(&original, patch)?;

    write_atomic(
        mount_dir,
        data_mount,
        &container_path,
        updated.as_bytes(),
        &WriteOptions {
            mode: Some(meta.permissions().mode() & 0o777),
            mtime: None,
        },
    )?;
    Ok(container_path)
}

/// Unified diff of one file between a version snapshot root and the current
/// root. Missing files read as empty.
pub fn diff_against(
    current_root: &Path,
    version_root: &Path,
    data_mount: &str,
    request_path: &str,
) -> Result<(String, String)> {
    let container_path = resolve_container_path(data_mount, request_path)?;
    let current_path = resolve_host_path(current_root, &container_path)?;
    let version_path = resolve_host_path(version_root, &container_path)?;

    let current = read_or_empty(&current_path)?;
    let version = read_or_empty(&version_path)?;

    let diff = unified_diff(&container_path, &version, &current);
    Ok((container_path, diff))
}

fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::internal(format!("read {}: {e}", path.display()))),
    }
}

fn stat_error(err: std::io::Error, container_path: &str) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::not_found("path", container_path)
    } else {
        Error::internal(format!("stat {container_path}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mount_with_data() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        dir
    }

    #[test]
    fn decode_content_variants() {
        assert_eq!(decode_content("hi", "plain").unwrap(), b"hi");
        assert_eq!(decode_content("hi", "").unwrap(), b"hi");
        assert_eq!(decode_content("aGVsbG8K", "base64").unwrap(), b"hello\n");
        assert!(decode_content("x", "hex").is_err());
        assert!(decode_content("!!!", "base64").is_err());
    }

    #[test]
    fn write_then_read_round_trip() {
        let mount = mount_with_data();
        write_atomic(
            mount.path(),
            "/data",
            "/data/notes.txt",
            b"hello\n",
            &WriteOptions::default(),
        )
        .unwrap();

        let file = read_file(mount.path(), "/data", "notes.txt").unwrap();
        assert_eq!(file.container_path, "/data/notes.txt");
        assert_eq!(file.data, b"hello\n");
        assert_eq!(file.size, 6);
        assert_eq!(file.mode, 0o644);
    }

    #[test]
    fn write_creates_parent_directories() {
        let mount = mount_with_data();
        write_atomic(
            mount.path(),
            "/data",
            "a/b/c.txt",
            b"deep",
            &WriteOptions::default(),
        )
        .unwrap();

        let file = read_file(mount.path(), "/data", "/data/a/b/c.txt").unwrap();
        assert_eq!(file.data, b"deep");
    }

    #[test]
    fn write_honours_mode_and_mtime() {
        let mount = mount_with_data();
        let mtime = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        write_atomic(
            mount.path(),
            "/data",
            "script.sh",
            b"#!/bin/sh\n",
            &WriteOptions {
                mode: Some(0o755),
                mtime: Some(mtime),
            },
        )
        .unwrap();

        let file = read_file(mount.path(), "/data", "script.sh").unwrap();
        assert_eq!(file.mode, 0o755);
        assert_eq!(file.modified, mtime);
    }

    #[test]
    fn write_replaces_existing_content() {
        let mount = mount_with_data();
        for content in [b"first".as_slice(), b"second replacement".as_slice()] {
            write_atomic(
                mount.path(),
                "/data",
                "f.txt",
                content,
                &WriteOptions::default(),
            )
            .unwrap();
        }
        let file = read_file(mount.path(), "/data", "f.txt").unwrap();
        assert_eq!(file.data, b"second replacement");

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(mount.path().join("data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_rejects_directory_and_missing() {
        let mount = mount_with_data();
        std::fs::create_dir(mount.path().join("data/sub")).unwrap();

        assert!(matches!(
            read_file(mount.path(), "/data", "sub"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(read_file(mount.path(), "/data", "absent.txt")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn read_rejects_escaping_path() {
        let mount = mount_with_data();
        let err = read_file(mount.path(), "/data", "/data/../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn list_non_recursive_returns_direct_children() {
        let mount = mount_with_data();
        std::fs::write(mount.path().join("data/a.txt"), b"a").unwrap();
        std::fs::create_dir(mount.path().join("data/sub")).unwrap();
        std::fs::write(mount.path().join("data/sub/b.txt"), b"b").unwrap();

        let (path, entries) = list_dir(mount.path(), "/data", "", false).unwrap();
        assert_eq!(path, "/data");
        let names: Vec<_> = entries.iter().map(|e| e.container_path.clone()).collect();
        assert_eq!(names, vec!["/data/a.txt", "/data/sub"]);
        assert!(!entries[0].is_dir);
        assert!(entries[1].is_dir);
    }

    #[test]
    fn list_recursive_walks_and_excludes_root() {
        let mount = mount_with_data();
        std::fs::write(mount.path().join("data/a.txt"), b"a").unwrap();
        std::fs::create_dir(mount.path().join("data/sub")).unwrap();
        std::fs::write(mount.path().join("data/sub/b.txt"), b"b").unwrap();

        let (_, entries) = list_dir(mount.path(), "/data", "", true).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.container_path.clone()).collect();
        assert_eq!(names, vec!["/data/a.txt", "/data/sub", "/data/sub/b.txt"]);
    }

    #[test]
    fn list_rejects_file_path() {
        let mount = mount_with_data();
        std::fs::write(mount.path().join("data/a.txt"), b"a").unwrap();
        assert!(matches!(
            list_dir(mount.path(), "/data", "a.txt", false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn patch_updates_file_preserving_mode() {
        let mount = mount_with_data();
        write_atomic(
            mount.path(),
            "/data",
            "a.txt",
            b"one\ntwo\nthree\n",
            &WriteOptions {
                mode: Some(0o600),
                mtime: None,
            },
        )
        .unwrap();

        apply_patch_file(
            mount.path(),
            "/data",
            "a.txt",
            "@@ -2,1 +2,1 @@\n-two\n+TWO\n",
        )
        .unwrap();

        let file = read_file(mount.path(), "/data", "a.txt").unwrap();
        assert_eq!(file.data, b"one\nTWO\nthree\n");
        assert_eq!(file.mode, 0o600);
    }

    #[test]
    fn failed_patch_leaves_file_untouched() {
        let mount = mount_with_data();
        write_atomic(
            mount.path(),
            "/data",
            "a.txt",
            b"one\ntwo\nthree\n",
            &WriteOptions::default(),
        )
        .unwrap();

        let err = apply_patch_file(
            mount.path(),
            "/data",
            "a.txt",
            "@@ -2,1 +2,1 @@\n-TWO\n+two\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::PatchMismatch(_)));

        let file = read_file(mount.path(), "/data", "a.txt").unwrap();
        assert_eq!(file.data, b"one\ntwo\nthree\n");
    }

    #[test]
    fn patch_on_missing_file_is_not_found() {
        let mount = mount_with_data();
        let err =
            apply_patch_file(mount.path(), "/data", "absent.txt", "@@ -1 +1 @@\n-x\n+y\n")
                .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn diff_between_roots() {
        let current = mount_with_data();
        let version = mount_with_data();
        std::fs::write(current.path().join("data/a.txt"), "changed\n").unwrap();
        std::fs::write(version.path().join("data/a.txt"), "one\nTWO\nthree\n").unwrap();

        let (path, diff) =
            diff_against(current.path(), version.path(), "/data", "a.txt").unwrap();
        assert_eq!(path, "/data/a.txt");
        assert!(diff.contains("--- a/data/a.txt"));
        assert!(diff.contains("+++ b/data/a.txt"));
        assert!(diff.contains("-one"));
        assert!(diff.contains("+changed"));
    }

    #[test]
    fn diff_missing_version_file_reads_empty() {
        let current = mount_with_data();
        let version = mount_with_data();
        std::fs::write(current.path().join("data/new.txt"), "fresh\n").unwrap();

        let (_, diff) =
            diff_against(current.path(), version.path(), "/data", "new.txt").unwrap();
        assert!(diff.contains("+fresh"));
        assert!(!diff.contains("-fresh"));
    }
}
