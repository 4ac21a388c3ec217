//! Canonical repository paths.
//!
//! Every path the engine exchanges between repositories is a forward-slash
//! relative path rooted at the drive root folder name (`My Drive/...`). Local
//! OS paths are converted at the repository boundary only.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A validated, forward-slash-delimited relative path.
///
/// Construction rejects `..` segments, backslashes, empty segments, leading
/// or trailing slashes, and embedded newlines. The newline rejection keeps
/// every path representable in the line-oriented manifest and queue formats.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncPath(String);

impl SyncPath {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SyncError::Policy("empty path".into()));
        }
        if raw.contains('\\') {
            return Err(SyncError::Policy(format!("backslash in path: {raw}")));
        }
        if raw.contains('\n') || raw.contains('\r') {
            return Err(SyncError::Policy("newline in path".into()));
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(SyncError::Policy(format!("path is not relative: {raw}")));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(SyncError::Policy(format!("empty path segment: {raw}")));
            }
            if segment == ".." || segment == "." {
                return Err(SyncError::Policy(format!("forbidden path segment: {raw}")));
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Everything before the final segment, or `None` at the top level.
    pub fn parent(&self) -> Option<SyncPath> {
        self.0.rfind('/').map(|idx| SyncPath(self.0[..idx].to_string()))
    }

    pub fn join(&self, name: &str) -> Result<SyncPath> {
        SyncPath::new(format!("{}/{}", self.0, name))
    }

    /// Component-wise prefix test: `a/b` is under `a`, but `a/bc` is not.
    pub fn starts_with(&self, prefix: &SyncPath) -> bool {
        self.0 == prefix.0
            || (self.0.len() > prefix.0.len()
                && self.0.starts_with(&prefix.0)
                && self.0.as_bytes()[prefix.0.len()] == b'/')
    }

    /// Re-root a path from one prefix to another. Returns `None` when the
    /// path is not under `from`.
    pub fn rebase(&self, from: &SyncPath, to: &SyncPath) -> Option<SyncPath> {
        if self.0 == from.0 {
            return Some(to.clone());
        }
        if !self.starts_with(from) {
            return None;
        }
        Some(SyncPath(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }

    /// Map a canonical path into an OS path under `root`, dropping the
    /// canonical `root_name` prefix. `My Drive/a/b` with root `/data`
    /// becomes `/data/a/b`.
    pub fn to_os_path(&self, root: &Path, root_name: &str) -> Result<PathBuf> {
        let rest = if self.0 == root_name {
            ""
        } else if self.0.len() > root_name.len()
            && self.0.starts_with(root_name)
            && self.0.as_bytes()[root_name.len()] == b'/'
        {
            &self.0[root_name.len() + 1..]
        } else {
            return Err(SyncError::Policy(format!(
                "path outside the synchronized root: {}",
                self.0
            )));
        };
        let mut out = root.to_path_buf();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            out.push(segment);
        }
        Ok(out)
    }

    /// Map an absolute OS path under `root` back into the canonical space.
    pub fn from_os_path(path: &Path, root: &Path, root_name: &str) -> Result<SyncPath> {
        let rel = path.strip_prefix(root).map_err(|_| {
            SyncError::Policy(format!(
                "path outside the synchronized root: {}",
                path.display()
            ))
        })?;
        let mut canonical = root_name.to_string();
        for component in rel.components() {
            match component {
                Component::Normal(seg) => {
                    let seg = seg.to_str().ok_or_else(|| {
                        SyncError::Policy(format!("non-UTF-8 path: {}", path.display()))
                    })?;
                    canonical.push('/');
                    canonical.push_str(seg);
                }
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::Policy(format!(
                        "forbidden component in path: {}",
                        path.display()
                    )));
                }
            }
        }
        SyncPath::new(canonical)
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SyncPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        SyncPath::new(value)
    }
}

impl From<SyncPath> for String {
    fn from(value: SyncPath) -> Self {
        value.0
    }
}
