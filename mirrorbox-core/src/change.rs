//! The canonical change record exchanged between repositories.
//!
//! A [`ChangeInfo`] is the source-agnostic description of one observed
//! mutation. Equality deliberately ignores the originating repository (and
//! the old path/checksum carried for moves) so that the same logical event
//! surfaced by either side deduplicates in the processor's recent-changes
//! window.

use std::hash::{Hash, Hasher};

use crate::checksum::CHECKSUM_UNKNOWN;
use crate::error::{Result, SyncError};
use crate::path::SyncPath;

/// Stable identity of a repository, used as the serialized source tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepoTag {
    GoogleDrive,
    LocalDrive,
}

impl RepoTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoTag::GoogleDrive => "google_drive",
            RepoTag::LocalDrive => "local_drive",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "google_drive" => Ok(RepoTag::GoogleDrive),
            "local_drive" => Ok(RepoTag::LocalDrive),
            other => Err(SyncError::Parse(format!("unknown repository tag: {other}"))),
        }
    }
}

impl std::fmt::Display for RepoTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Moved,
    Renamed,
    Removed,
    MovedAndModified,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "Created",
            ChangeKind::Modified => "Modified",
            ChangeKind::Moved => "Moved",
            ChangeKind::Renamed => "Renamed",
            ChangeKind::Removed => "Removed",
            ChangeKind::MovedAndModified => "MovedAndModified",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Created" => Ok(ChangeKind::Created),
            "Modified" => Ok(ChangeKind::Modified),
            "Moved" => Ok(ChangeKind::Moved),
            "Renamed" => Ok(ChangeKind::Renamed),
            "Removed" => Ok(ChangeKind::Removed),
            "MovedAndModified" => Ok(ChangeKind::MovedAndModified),
            other => Err(SyncError::Parse(format!("unknown change kind: {other}"))),
        }
    }
}

/// One canonical change. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct ChangeInfo {
    pub source: RepoTag,
    pub kind: ChangeKind,
    /// Path after the change.
    pub path: SyncPath,
    /// Path before the change; present for Moved/Renamed/MovedAndModified.
    pub old_path: Option<SyncPath>,
    pub is_folder: bool,
    /// Content checksum after the change; `-` for folders and unknowns.
    pub checksum: String,
    /// Content checksum before the change, when known.
    pub old_checksum: Option<String>,
}

impl ChangeInfo {
    pub fn new(
        source: RepoTag,
        kind: ChangeKind,
        path: SyncPath,
        is_folder: bool,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            source,
            kind,
            path,
            old_path: None,
            is_folder,
            checksum: checksum.into(),
            old_checksum: None,
        }
    }

    pub fn with_old_path(mut self, old_path: SyncPath) -> Self {
        self.old_path = Some(old_path);
        self
    }

    pub fn with_old_checksum(mut self, old_checksum: impl Into<String>) -> Self {
        self.old_checksum = Some(old_checksum.into());
        self
    }

    /// Split a MovedAndModified into the Created/Removed pair the processor
    /// replays. Returns `None` for every other kind.
    pub fn split_moved_and_modified(&self) -> Option<(ChangeInfo, ChangeInfo)> {
        if self.kind != ChangeKind::MovedAndModified {
            return None;
        }
        let old_path = self.old_path.clone()?;
        let created = ChangeInfo::new(
            self.source,
            ChangeKind::Created,
            self.path.clone(),
            self.is_folder,
            self.checksum.clone(),
        );
        let removed = ChangeInfo::new(
            self.source,
            ChangeKind::Removed,
            old_path,
            self.is_folder,
            self.old_checksum
                .clone()
                .unwrap_or_else(|| CHECKSUM_UNKNOWN.to_string()),
        );
        Some((created, removed))
    }

    /// Serialize to the single-line queue format:
    /// `<repo tag> <kind> <checksum> <is-folder> "<new path>" ["<old path>"]`
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} \"{}\"",
            self.source.as_str(),
            self.kind.as_str(),
            self.checksum,
            self.is_folder,
            self.path
        );
        if let Some(old) = &self.old_path {
            line.push_str(&format!(" \"{old}\""));
        }
        line
    }

    pub fn parse_line(line: &str) -> Result<ChangeInfo> {
        let mut fields = line.splitn(5, ' ');
        let tag = fields
            .next()
            .ok_or_else(|| SyncError::Parse(format!("truncated change line: {line}")))?;
        let kind = fields
            .next()
            .ok_or_else(|| SyncError::Parse(format!("truncated change line: {line}")))?;
        let checksum = fields
            .next()
            .ok_or_else(|| SyncError::Parse(format!("truncated change line: {line}")))?;
        let is_folder = fields
            .next()
            .ok_or_else(|| SyncError::Parse(format!("truncated change line: {line}")))?;
        let paths = fields
            .next()
            .ok_or_else(|| SyncError::Parse(format!("change line has no path: {line}")))?;

        let source = RepoTag::parse(tag)?;
        let kind = ChangeKind::parse(kind)?;
        let is_folder = match is_folder {
            "true" => true,
            "false" => false,
            other => {
                return Err(SyncError::Parse(format!("bad is-folder flag: {other}")));
            }
        };

        let (path, rest) = take_quoted(paths)
            .ok_or_else(|| SyncError::Parse(format!("unquoted path in change line: {line}")))?;
        let old_path = match rest.trim_start() {
            "" => None,
            more => {
                let (old, tail) = take_quoted(more).ok_or_else(|| {
                    SyncError::Parse(format!("unquoted old path in change line: {line}"))
                })?;
                if !tail.trim().is_empty() {
                    return Err(SyncError::Parse(format!(
                        "trailing garbage in change line: {line}"
                    )));
                }
                Some(SyncPath::new(old)?)
            }
        };

        let mut change = ChangeInfo::new(source, kind, SyncPath::new(path)?, is_folder, checksum);
        change.old_path = old_path;
        Ok(change)
    }
}

/// Strip one double-quoted token off the front of `s`. Quotes inside paths
/// are not supported by the format.
fn take_quoted(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((&rest[..end], &rest[end + 1..]))
}

impl PartialEq for ChangeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.path == other.path
            && self.checksum == other.checksum
            && self.is_folder == other.is_folder
    }
}

impl Eq for ChangeInfo {}

impl Hash for ChangeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.path.hash(state);
        self.checksum.hash(state);
        self.is_folder.hash(state);
    }
}
