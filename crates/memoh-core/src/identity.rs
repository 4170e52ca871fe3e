//! User-id validation.
//!
//! User ids flow into container ids, snapshot keys and runtime labels, so
//! the accepted charset is deliberately conservative.

use crate::error::{Error, Result};

/// Validate an external user id: non-empty, `[A-Za-z0-9_-]+` only.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::invalid("user id required"));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid("invalid user id"));
    }
    Ok(())
}
