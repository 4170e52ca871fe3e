//! Core types shared across the memoh workspace.
//!
//! This crate carries the global error hierarchy, the configuration file
//! model, and the user-id validation that every public entry point applies
//! before touching the container runtime or the database.

pub mod config;
pub mod error;
pub mod identity;

pub use config::Config;
pub use error::{Error, Result};
pub use identity::validate_user_id;

/// Prefix for per-user container ids. The writable snapshot shares the
/// container id; version snapshots append `:v<N>`.
pub const CONTAINER_PREFIX: &str = "memoh-user-";

/// Label key binding a container to its owning user.
pub const USER_LABEL_KEY: &str = "user";

/// Container id for a user.
pub fn container_id_for_user(user_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{user_id}")
}

/// Snapshot name for an immutable version of a container.
pub fn version_snapshot_name(container_id: &str, version: i32) -> String {
    format!("{container_id}:v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_uses_prefix() {
        assert_eq!(container_id_for_user("alice"), "memoh-user-alice");
    }

    #[test]
    fn version_snapshot_name_format() {
        assert_eq!(
            version_snapshot_name("memoh-user-alice", 3),
            "memoh-user-alice:v3"
        );
    }
}
