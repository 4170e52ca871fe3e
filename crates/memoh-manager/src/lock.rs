//! Per-user lock table.
//!
//! Manager operations for one user run strictly serially; operations on
//! different users proceed in parallel. Locks are created lazily and kept
//! for the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Map from user id to an exclusive async lock.
#[derive(Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `user_id`, creating it on first use.
    pub fn for_user(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.inner.lock().expect("user lock table poisoned");
        table
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
