//! File path validation.
//!
//! Valid paths:
//! - Must start with `/`
//! - Must not end with `/` (except the root itself, which is not a file)
//! - Must not contain whitespace or `!` (the chain separator on the wire)
//! - Components between slashes must be non-empty and not `.` or `..`

use crate::error::{DirectoryError, DirectoryResult};

/// Characters that are forbidden anywhere in a path.
const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '\n', '\r', '!'];

fn invalid(path: &str, reason: impl Into<String>) -> DirectoryError {
    DirectoryError::InvalidPath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Validate a file path, returning `Ok(())` if valid.
///
/// ```
/// use slotkv_directory::names::validate_path;
///
/// assert!(validate_path("/data").is_ok());
/// assert!(validate_path("/a/b/c").is_ok());
/// assert!(validate_path("relative").is_err());
/// assert!(validate_path("/a/../b").is_err());
/// ```
pub fn validate_path(path: &str) -> DirectoryResult<()> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid(path, "must start with '/'"));
    };
    if rest.is_empty() {
        return Err(invalid(path, "the root is not a file"));
    }
    if let Some(ch) = FORBIDDEN_CHARS.iter().find(|c| path.contains(**c)) {
        return Err(invalid(path, format!("contains forbidden character: {ch:?}")));
    }
    for component in rest.split('/') {
        match component {
            "" => return Err(invalid(path, "path components must not be empty")),
            "." | ".." => return Err(invalid(path, format!("component not allowed: {component:?}"))),
            _ => {}
        }
    }
    Ok(())
}

/// Object path of one chain's snapshot under a file's backing path.
pub fn block_backing_path(backing_path: &str, component: &str) -> String {
    format!("{}/{}", backing_path.trim_end_matches('/'), component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_paths() {
        for p in ["/a", "/a/b", "/data-1/x_y.z"] {
            assert!(validate_path(p).is_ok(), "{p} should be valid");
        }
    }

    #[test]
    fn invalid_paths() {
        for p in ["", "a", "/", "/a/", "//a", "/a//b", "/a/./b", "/a/..", "/a b", "/a!b"] {
            assert!(validate_path(p).is_err(), "{p} should be invalid");
        }
    }

    #[test]
    fn backing_paths_join_cleanly() {
        assert_eq!(block_backing_path("local://tmp", "0_65536"), "local://tmp/0_65536");
        assert_eq!(block_backing_path("local://tmp/", "0_10"), "local://tmp/0_10");
    }
}
