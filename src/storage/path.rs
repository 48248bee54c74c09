//! Remote path normalization and prefix handling.
//!
//! Remote paths always use `/` separators, never start or end with one, and
//! never contain empty or `.` segments. A backend's configured prefix is
//! joined in front of every logical path the caller passes and stripped again
//! from listings, so callers only ever see logical paths.

use std::path::{Component, Path};

/// Normalizes a remote path: `\` becomes `/`, empty and `.` segments are dropped.
///
/// ```
/// use transfer_core::storage::normalize_remote_path;
///
/// assert_eq!(normalize_remote_path("/exports//vm1\\disk.vmdk/"), "exports/vm1/disk.vmdk");
/// assert_eq!(normalize_remote_path(""), "");
/// ```
#[must_use]
pub fn normalize_remote_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins two remote paths; an empty side is a no-op.
#[must_use]
pub fn join_remote(prefix: &str, path: &str) -> String {
    let prefix = normalize_remote_path(prefix);
    let path = normalize_remote_path(path);
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path,
        (false, true) => prefix,
        (false, false) => format!("{prefix}/{path}"),
    }
}

/// Path of `file` relative to `root`, using `/` separators.
///
/// Returns `None` when `file` is not under `root` or the relative path
/// contains `..` or a root component.
#[must_use]
pub fn relative_remote_path(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Strips `prefix` (a whole-segment prefix) from `path`.
///
/// Returns `None` when `path` does not live under `prefix`. A path equal to
/// the prefix yields an empty string.
#[must_use]
pub fn strip_remote_prefix(prefix: &str, path: &str) -> Option<String> {
    let prefix = normalize_remote_path(prefix);
    let path = normalize_remote_path(path);
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some(String::new());
    }
    path.strip_prefix(&prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

/// A backend's configured logical prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotePrefix(String);

impl RemotePrefix {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(normalize_remote_path(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Full remote key for a logical path.
    #[must_use]
    pub fn join(&self, logical: &str) -> String {
        join_remote(&self.0, logical)
    }

    /// Logical path for a full remote key; keys outside the prefix are returned as-is.
    #[must_use]
    pub fn strip(&self, full: &str) -> String {
        strip_remote_prefix(&self.0, full).unwrap_or_else(|| normalize_remote_path(full))
    }
}
