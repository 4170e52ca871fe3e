//! Path-scoped filesystem operations against a mounted snapshot.

pub mod ops;
pub mod patch;
pub mod path;

pub use ops::{
    apply_patch_file, decode_content, diff_against, list_dir, read_file, write_atomic, FileContent,
    FileEntry, WriteOptions,
};
pub use patch::{apply_unified_patch, unified_diff};
pub use path::{container_path_for_host, resolve_container_path, resolve_host_path};
