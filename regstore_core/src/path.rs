//! Logical path syntax.
//!
//! A valid path is one or more `/component` segments where each component
//! is made of ASCII alphanumerics, `.`, `_` and `-`. The root `/` is only
//! accepted where an operation explicitly allows it (listing).

use crate::error::{DriverError, DriverResult};

pub const ROOT: &str = "/";

pub fn is_valid(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    !rest.is_empty() && rest.split('/').all(is_valid_component)
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && component != ".."
        && component
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub fn validate(path: &str) -> DriverResult<()> {
    if is_valid(path) {
        Ok(())
    } else {
        Err(DriverError::InvalidPath(path.to_string()))
    }
}

/// Like `validate`, but also accepts the root path.
pub fn validate_dir(path: &str) -> DriverResult<()> {
    if path == ROOT {
        return Ok(());
    }
    validate(path)
}
