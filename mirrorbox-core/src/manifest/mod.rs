//! The per-repository shadow model.
//!
//! A [`Manifest`] tracks every file and folder the engine knows about in one
//! repository, indexed both by stable identity (the cloud-assigned opaque id,
//! or the path itself for the local tree) and by path. Incoming raw events
//! are diffed against the shadow to produce canonical [`ChangeInfo`] records;
//! events that change nothing produce nothing, which is what keeps the
//! engine's own writes from echoing back through the pipeline.

pub mod cloud_scan;
pub mod codec;
pub mod local_scan;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::change::{ChangeInfo, ChangeKind, RepoTag};
use crate::checksum::CHECKSUM_UNKNOWN;
use crate::drive::types::DriveFile;
use crate::error::{Result, SyncError};
use crate::path::SyncPath;

/// One tracked file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub path: SyncPath,
    /// Size in bytes; -1 when unknown.
    pub size: i64,
    pub modified: DateTime<Utc>,
    /// Hex content checksum; `-` when unknown, `<unknown>` when unreadable.
    pub checksum: String,
}

impl FileRecord {
    /// Content comparison used by change classification: a file's content
    /// "differs" when its size or checksum does.
    fn content_differs(&self, other: &FileRecord) -> bool {
        self.size != other.size || self.checksum != other.checksum
    }
}

/// Path-indexed shadow of one repository.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Which repository this shadow models; stamped on emitted changes.
    source: RepoTag,
    /// Continuation cursor for the cloud incremental feed; empty locally.
    cursor: String,
    folders: BTreeMap<String, SyncPath>,
    files: BTreeMap<String, FileRecord>,
    /// Reverse index over the union of files and folders.
    by_path: BTreeMap<SyncPath, String>,
    dirty: bool,
}

impl Manifest {
    pub fn new(source: RepoTag) -> Self {
        Self {
            source,
            cursor: String::new(),
            folders: BTreeMap::new(),
            files: BTreeMap::new(),
            by_path: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn source(&self) -> RepoTag {
        self.source
    }

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Advance the continuation cursor. Only called after a feed page has
    /// been fully drained, which keeps the cursor monotone.
    pub fn set_cursor(&mut self, cursor: impl Into<String>) {
        self.cursor = cursor.into();
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn folder_path(&self, id: &str) -> Option<&SyncPath> {
        self.folders.get(id)
    }

    pub fn file(&self, id: &str) -> Option<&FileRecord> {
        self.files.get(id)
    }

    pub fn id_at(&self, path: &SyncPath) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    pub fn file_at(&self, path: &SyncPath) -> Option<&FileRecord> {
        self.by_path.get(path).and_then(|id| self.files.get(id))
    }

    pub fn is_folder_path(&self, path: &SyncPath) -> bool {
        self.by_path
            .get(path)
            .is_some_and(|id| self.folders.contains_key(id))
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.files.iter().map(|(id, rec)| (id.as_str(), rec))
    }

    pub fn folders(&self) -> impl Iterator<Item = (&str, &SyncPath)> {
        self.folders.iter().map(|(id, path)| (id.as_str(), path))
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.folders.is_empty()
    }

    /// Insert or re-point a folder entry. Whatever previously owned the
    /// target path is evicted: last event wins.
    pub fn insert_folder(&mut self, id: impl Into<String>, path: SyncPath) {
        let id = id.into();
        self.evict_path_owner(&path, &id);
        if let Some(old_path) = self.folders.insert(id.clone(), path.clone()) {
            if self.by_path.get(&old_path).is_some_and(|owner| *owner == id) {
                self.by_path.remove(&old_path);
            }
        }
        self.by_path.insert(path, id);
        self.dirty = true;
    }

    /// Insert or update a file entry, same eviction rules as folders.
    pub fn insert_file(&mut self, id: impl Into<String>, record: FileRecord) {
        let id = id.into();
        self.evict_path_owner(&record.path, &id);
        if let Some(old) = self.files.insert(id.clone(), record.clone()) {
            if self.by_path.get(&old.path).is_some_and(|owner| *owner == id) {
                self.by_path.remove(&old.path);
            }
        }
        self.by_path.insert(record.path, id);
        self.dirty = true;
    }

    fn evict_path_owner(&mut self, path: &SyncPath, keep_id: &str) {
        if let Some(owner) = self.by_path.get(path) {
            if owner != keep_id {
                let owner = owner.clone();
                self.files.remove(&owner);
                self.folders.remove(&owner);
                self.by_path.remove(path);
            }
        }
    }

    /// Drop an entry by id. Removing a folder purges every descendant entry
    /// as well; replay only needs the single folder-level change.
    pub fn remove_entry(&mut self, id: &str) -> Option<RemovedEntry> {
        if let Some(record) = self.files.remove(id) {
            if self.by_path.get(&record.path).is_some_and(|o| o == id) {
                self.by_path.remove(&record.path);
            }
            self.dirty = true;
            return Some(RemovedEntry::File(record));
        }
        if let Some(path) = self.folders.remove(id) {
            if self.by_path.get(&path).is_some_and(|o| o == id) {
                self.by_path.remove(&path);
            }
            self.purge_descendants(&path);
            self.dirty = true;
            return Some(RemovedEntry::Folder(path));
        }
        None
    }

    fn purge_descendants(&mut self, path: &SyncPath) {
        let doomed_files: Vec<String> = self
            .files
            .iter()
            .filter(|(_, rec)| rec.path.starts_with(path))
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed_files {
            if let Some(rec) = self.files.remove(&id) {
                self.by_path.remove(&rec.path);
            }
        }
        let doomed_folders: Vec<String> = self
            .folders
            .iter()
            .filter(|(_, p)| p.starts_with(path))
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed_folders {
            if let Some(p) = self.folders.remove(&id) {
                self.by_path.remove(&p);
            }
        }
    }

    /// Diff one cloud file metadata record against the shadow and apply it.
    ///
    /// Returns the canonical change this event represents, or `None` when
    /// the event changes nothing (including files whose parent folder is not
    /// tracked, which are outside the synchronized scope).
    pub fn register_cloud_file(&mut self, file: &DriveFile) -> Result<Option<ChangeInfo>> {
        let Some(parent_id) = file.parents.first() else {
            return Ok(None);
        };
        let Some(parent_path) = self.folders.get(parent_id).cloned() else {
            return Ok(None);
        };
        let new_path = parent_path.join(&file.name)?;

        if file.is_folder() {
            return Ok(self.register_folder_at(file.id.clone(), new_path));
        }

        let record = FileRecord {
            path: new_path,
            size: file.size_bytes(),
            modified: file.modified_or_epoch(),
            checksum: file.content_checksum().to_string(),
        };
        Ok(self.register_file_record(file.id.clone(), record))
    }

    /// Diff one local observation (a stat of the file as it exists now)
    /// against the shadow and apply it. Local identity is the path itself,
    /// so a path change can never be seen here; moves are injected through
    /// [`Manifest::register_move`].
    pub fn register_local(
        &mut self,
        path: SyncPath,
        is_folder: bool,
        size: i64,
        modified: DateTime<Utc>,
        checksum: impl Into<String>,
    ) -> Option<ChangeInfo> {
        let id = path.as_str().to_string();
        if is_folder {
            self.register_folder_at(id, path)
        } else {
            let record = FileRecord {
                path,
                size,
                modified,
                checksum: checksum.into(),
            };
            self.register_file_record(id, record)
        }
    }

    fn register_folder_at(&mut self, id: String, new_path: SyncPath) -> Option<ChangeInfo> {
        match self.folders.get(&id).cloned() {
            Some(old_path) if old_path == new_path => None,
            Some(old_path) => {
                self.apply_move_by_id(&id, &old_path, &new_path);
                Some(
                    ChangeInfo::new(self.source, ChangeKind::Moved, new_path, true, CHECKSUM_UNKNOWN)
                        .with_old_path(old_path),
                )
            }
            None => {
                self.insert_folder(id, new_path.clone());
                Some(ChangeInfo::new(
                    self.source,
                    ChangeKind::Created,
                    new_path,
                    true,
                    CHECKSUM_UNKNOWN,
                ))
            }
        }
    }

    fn register_file_record(&mut self, id: String, record: FileRecord) -> Option<ChangeInfo> {
        let Some(old) = self.files.get(&id).cloned() else {
            let change = ChangeInfo::new(
                self.source,
                ChangeKind::Created,
                record.path.clone(),
                false,
                record.checksum.clone(),
            );
            self.insert_file(id, record);
            return Some(change);
        };

        let path_changed = old.path != record.path;
        let content_differs = old.content_differs(&record);
        match (path_changed, content_differs) {
            (false, false) => None,
            (false, true) => {
                let change = ChangeInfo::new(
                    self.source,
                    ChangeKind::Modified,
                    record.path.clone(),
                    false,
                    record.checksum.clone(),
                )
                .with_old_checksum(old.checksum);
                self.insert_file(id, record);
                Some(change)
            }
            (true, false) => {
                let kind = if same_directory_rename(&old.path, &record.path) {
                    ChangeKind::Renamed
                } else {
                    ChangeKind::Moved
                };
                let change = ChangeInfo::new(
                    self.source,
                    kind,
                    record.path.clone(),
                    false,
                    record.checksum.clone(),
                )
                .with_old_path(old.path);
                self.insert_file(id, record);
                Some(change)
            }
            (true, true) => {
                let change = ChangeInfo::new(
                    self.source,
                    ChangeKind::MovedAndModified,
                    record.path.clone(),
                    false,
                    record.checksum.clone(),
                )
                .with_old_path(old.path)
                .with_old_checksum(old.checksum);
                self.insert_file(id, record);
                Some(change)
            }
        }
    }

    /// Removal or trashing of a known id.
    pub fn register_removal(&mut self, id: &str) -> Option<ChangeInfo> {
        match self.remove_entry(id)? {
            RemovedEntry::File(record) => Some(
                ChangeInfo::new(
                    self.source,
                    ChangeKind::Removed,
                    record.path,
                    false,
                    record.checksum,
                ),
            ),
            RemovedEntry::Folder(path) => Some(ChangeInfo::new(
                self.source,
                ChangeKind::Removed,
                path,
                true,
                CHECKSUM_UNKNOWN,
            )),
        }
    }

    pub fn register_local_removal(&mut self, path: &SyncPath) -> Option<ChangeInfo> {
        let id = self.by_path.get(path)?.clone();
        self.register_removal(&id)
    }

    /// Inject a synthetic move into the shadow, updating the path indices.
    /// Returns the canonical Moved/Renamed change, or `None` when `from` is
    /// not tracked.
    pub fn register_move(&mut self, from: &SyncPath, to: &SyncPath) -> Result<Option<ChangeInfo>> {
        let Some(id) = self.by_path.get(from).cloned() else {
            return Ok(None);
        };
        if self.by_path.contains_key(to) {
            return Err(SyncError::Policy(format!(
                "move destination already tracked: {to}"
            )));
        }

        let is_folder = self.folders.contains_key(&id);
        let checksum = if is_folder {
            CHECKSUM_UNKNOWN.to_string()
        } else {
            self.files
                .get(&id)
                .map(|r| r.checksum.clone())
                .unwrap_or_else(|| CHECKSUM_UNKNOWN.to_string())
        };
        self.apply_move_by_id(&id, from, to);

        let kind = if !is_folder && same_directory_rename(from, to) {
            ChangeKind::Renamed
        } else {
            ChangeKind::Moved
        };
        Ok(Some(
            ChangeInfo::new(self.source, kind, to.clone(), is_folder, checksum)
                .with_old_path(from.clone()),
        ))
    }

    /// Re-path one entry and, for folders, every descendant. Entries keyed
    /// by their own path (the local tree) are re-keyed as well so identity
    /// tracking survives the move.
    fn apply_move_by_id(&mut self, id: &str, from: &SyncPath, to: &SyncPath) {
        let mut moves: Vec<(String, SyncPath, SyncPath)> = Vec::new();
        if self.folders.contains_key(id) {
            moves.push((id.to_string(), from.clone(), to.clone()));
            for (child_id, path) in &self.folders {
                if child_id != id && path.starts_with(from) {
                    if let Some(new_path) = path.rebase(from, to) {
                        moves.push((child_id.clone(), path.clone(), new_path));
                    }
                }
            }
            for (child_id, rec) in &self.files {
                if rec.path.starts_with(from) {
                    if let Some(new_path) = rec.path.rebase(from, to) {
                        moves.push((child_id.clone(), rec.path.clone(), new_path));
                    }
                }
            }
        } else {
            moves.push((id.to_string(), from.clone(), to.clone()));
        }

        for (entry_id, old_path, new_path) in moves {
            let path_keyed = entry_id == *old_path.as_str();
            let new_id = if path_keyed {
                new_path.as_str().to_string()
            } else {
                entry_id.clone()
            };
            if let Some(folder_path) = self.folders.remove(&entry_id) {
                debug_assert_eq!(folder_path, old_path);
                self.by_path.remove(&old_path);
                self.evict_path_owner(&new_path, &new_id);
                self.folders.insert(new_id.clone(), new_path.clone());
                self.by_path.insert(new_path, new_id);
            } else if let Some(mut record) = self.files.remove(&entry_id) {
                self.by_path.remove(&old_path);
                self.evict_path_owner(&new_path, &new_id);
                record.path = new_path.clone();
                self.files.insert(new_id.clone(), record);
                self.by_path.insert(new_path, new_id);
            }
        }
        self.dirty = true;
    }

    /// Structural invariants: every id's path maps back to the id, the
    /// reverse index covers exactly the union of both maps, and no path is
    /// both a file and a folder.
    pub fn check_invariants(&self) -> Result<()> {
        for (id, record) in &self.files {
            if self.by_path.get(&record.path).map(String::as_str) != Some(id) {
                return Err(SyncError::Invariant(format!(
                    "file {id} at {} not in reverse index",
                    record.path
                )));
            }
            if self.folders.contains_key(id) {
                return Err(SyncError::Invariant(format!(
                    "id {id} is both a file and a folder"
                )));
            }
        }
        for (id, path) in &self.folders {
            if self.by_path.get(path).map(String::as_str) != Some(id) {
                return Err(SyncError::Invariant(format!(
                    "folder {id} at {path} not in reverse index"
                )));
            }
        }
        if self.by_path.len() != self.files.len() + self.folders.len() {
            return Err(SyncError::Invariant(format!(
                "reverse index has {} entries for {} files + {} folders",
                self.by_path.len(),
                self.files.len(),
                self.folders.len()
            )));
        }
        for (path, id) in &self.by_path {
            let file_path = self.files.get(id).map(|r| &r.path);
            let folder_path = self.folders.get(id);
            if file_path != Some(path) && folder_path != Some(path) {
                return Err(SyncError::Invariant(format!(
                    "reverse index entry {path} -> {id} points at nothing"
                )));
            }
        }
        Ok(())
    }
}

/// What a removal dropped from the shadow.
#[derive(Clone, Debug)]
pub enum RemovedEntry {
    File(FileRecord),
    Folder(SyncPath),
}

/// The rename-vs-move rule: a content-identical path change counts as a
/// rename when the new parent path is a prefix of the old path.
fn same_directory_rename(old: &SyncPath, new: &SyncPath) -> bool {
    match new.parent() {
        Some(parent) => old.starts_with(&parent),
        None => old.parent().is_none(),
    }
}
