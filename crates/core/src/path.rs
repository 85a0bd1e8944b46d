//! Path safety for staged files.
//!
//! Every path a scraper hands to a session is resolved against a virtual
//! logical root before it is staged. Resolution unifies separators, drops
//! `.` and empty segments, and rejects anything that would leave the root
//! (absolute paths, drive prefixes, `..`). The result is a canonical
//! `/`-separated key that every backend can map onto its own layout.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

/// A validated relative path inside a backend's logical root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason| StorageError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(invalid("empty path not allowed"));
        }
        if raw.contains('\0') {
            return Err(invalid("path contains a NUL byte"));
        }

        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(invalid("absolute paths not allowed"));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(invalid("path traversal not allowed")),
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(invalid("path resolves to the storage root"));
        }

        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Key of this path inside a `/`-separated namespace, e.g. `Councillors/json/x.json`.
    pub fn under(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            self.0.clone()
        } else {
            format!("{prefix}/{}", self.0)
        }
    }

    /// Native filesystem path of this key below `root`.
    pub fn to_path_under(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, s| acc.join(s))
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RelativePath {
    type Error = StorageError;

    fn try_from(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

/// `C:` alone or followed by a separator; `a:b.json` is an ordinary name.
/// Expects separators already unified to `/`.
fn has_drive_prefix(path: &str) -> bool {
    match path.as_bytes() {
        [drive, b':'] | [drive, b':', b'/', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

/// Reduce a council code to a single safe path segment (`[A-Za-z0-9_-]`).
///
/// The result also names repositories and branches, so it may not start
/// with `-`.
pub fn sanitize_council_code(council_code: &str) -> Result<String> {
    let safe: String = council_code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "invalid council_code: {council_code:?}"
        )));
    }
    if safe.starts_with('-') {
        return Err(StorageError::InvalidArgument(format!(
            "council_code must not start with '-': {council_code:?}"
        )));
    }
    Ok(safe)
}

/// Trim a council code, rejecting empty ones.
pub fn validate_council_code(council_code: &str) -> Result<String> {
    let trimmed = council_code.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidArgument(
            "council_code cannot be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
