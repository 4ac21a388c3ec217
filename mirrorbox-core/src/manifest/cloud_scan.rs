//! Full enumeration of the owned cloud hierarchy.
//!
//! Three passes, because the Drive query language cannot express "shortcut
//! whose target is a folder" server-side:
//!
//! 1. every folder and every shortcut; folder paths resolved by walking
//!    parent links, folder-shortcuts recorded under their apparent path and
//!    queued for traversal
//! 2. every non-folder item, resolving file-shortcut targets to the
//!    target's content metadata
//! 3. children of each folder-shortcut target, recursively, with freshly
//!    discovered folder-shortcuts appended to the worklist
//!
//! A visited set over target ids keeps shortcut cycles from looping the
//! worklist forever.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::change::RepoTag;
use crate::drive::types::{DriveFile, FOLDER_MIME, SHORTCUT_MIME};
use crate::drive::{DriveService, DRIVE_ROOT_NAME};
use crate::error::Result;
use crate::manifest::codec::clamp_to_ticks;
use crate::manifest::{FileRecord, Manifest};
use crate::path::SyncPath;

pub async fn build_from_cloud(service: &dyn DriveService) -> Result<Manifest> {
    let mut manifest = Manifest::new(RepoTag::GoogleDrive);

    let root = service.get_file("root").await?;
    let root_path = SyncPath::new(DRIVE_ROOT_NAME)?;
    manifest.insert_folder(root.id.clone(), root_path);

    // Pass 1: folders and shortcuts in one listing.
    let query = format!("(mimeType = '{FOLDER_MIME}' or mimeType = '{SHORTCUT_MIME}') and trashed = false");
    let listed = service.list_files(&query).await?;

    let mut folders: Vec<&DriveFile> = Vec::new();
    let mut shortcuts: Vec<&DriveFile> = Vec::new();
    for item in &listed {
        if item.is_folder() {
            folders.push(item);
        } else if item.is_folder_shortcut() {
            // Target mime-type filter applied client-side.
            shortcuts.push(item);
        }
    }

    resolve_folder_paths(&mut manifest, &folders);

    let mut visited: HashSet<String> = HashSet::new();
    let mut worklist: VecDeque<(String, SyncPath)> = VecDeque::new();
    for shortcut in shortcuts {
        queue_folder_shortcut(&mut manifest, shortcut, &mut visited, &mut worklist);
    }

    // Pass 2: regular files and file-shortcuts.
    let query = format!("mimeType != '{FOLDER_MIME}' and trashed = false");
    for item in service.list_files(&query).await? {
        if item.is_folder_shortcut() {
            continue;
        }
        if item.is_shortcut() {
            record_file_shortcut(&mut manifest, service, &item).await;
        } else if let Err(err) = manifest.register_cloud_file(&item) {
            warn!(id = %item.id, name = %item.name, %err, "skipping unrepresentable cloud file");
        }
    }

    // Pass 3: traverse folder-shortcut targets under their apparent paths.
    while let Some((folder_id, folder_path)) = worklist.pop_front() {
        let query = format!("'{folder_id}' in parents and trashed = false");
        let children = service.list_files(&query).await?;
        debug!(folder = %folder_path, count = children.len(), "shortcut target listing");
        for child in children {
            let child_path = match folder_path.join(&child.name) {
                Ok(path) => path,
                Err(err) => {
                    warn!(id = %child.id, %err, "skipping unrepresentable shortcut child");
                    continue;
                }
            };
            if child.is_folder() {
                if visited.insert(child.id.clone()) {
                    manifest.insert_folder(child.id.clone(), child_path.clone());
                    worklist.push_back((child.id.clone(), child_path));
                }
            } else if child.is_folder_shortcut() {
                queue_folder_shortcut_at(&mut manifest, &child, child_path, &mut visited, &mut worklist);
            } else if child.is_shortcut() {
                record_file_shortcut_at(&mut manifest, service, &child, child_path).await;
            } else {
                manifest.insert_file(child.id.clone(), record_for(&child, child_path));
            }
        }
    }

    let cursor = service.get_start_page_token().await?;
    manifest.set_cursor(cursor);
    manifest.mark_clean();
    Ok(manifest)
}

/// Compute each folder's absolute path by walking parent links until every
/// chain that reaches a known anchor is resolved. Folders whose chain never
/// reaches the root (shared items without a path) are left out.
fn resolve_folder_paths(manifest: &mut Manifest, folders: &[&DriveFile]) {
    let by_id: HashMap<&str, &DriveFile> = folders.iter().map(|f| (f.id.as_str(), *f)).collect();
    let mut progress = true;
    while progress {
        progress = false;
        for folder in by_id.values() {
            if manifest.folder_path(&folder.id).is_some() {
                continue;
            }
            let Some(parent_id) = folder.parents.first() else {
                continue;
            };
            let Some(parent_path) = manifest.folder_path(parent_id).cloned() else {
                continue;
            };
            match parent_path.join(&folder.name) {
                Ok(path) => {
                    manifest.insert_folder(folder.id.clone(), path);
                    progress = true;
                }
                Err(err) => {
                    warn!(id = %folder.id, name = %folder.name, %err, "skipping unrepresentable folder");
                }
            }
        }
    }
}

fn queue_folder_shortcut(
    manifest: &mut Manifest,
    shortcut: &DriveFile,
    visited: &mut HashSet<String>,
    worklist: &mut VecDeque<(String, SyncPath)>,
) {
    let Some(parent_id) = shortcut.parents.first() else {
        return;
    };
    let Some(parent_path) = manifest.folder_path(parent_id).cloned() else {
        return;
    };
    let apparent = match parent_path.join(&shortcut.name) {
        Ok(path) => path,
        Err(err) => {
            warn!(id = %shortcut.id, %err, "skipping unrepresentable shortcut");
            return;
        }
    };
    queue_folder_shortcut_at(manifest, shortcut, apparent, visited, worklist);
}

fn queue_folder_shortcut_at(
    manifest: &mut Manifest,
    shortcut: &DriveFile,
    apparent: SyncPath,
    visited: &mut HashSet<String>,
    worklist: &mut VecDeque<(String, SyncPath)>,
) {
    let Some(details) = &shortcut.shortcut_details else {
        return;
    };
    if !visited.insert(details.target_id.clone()) {
        return;
    }
    manifest.insert_folder(details.target_id.clone(), apparent.clone());
    worklist.push_back((details.target_id.clone(), apparent));
}

async fn record_file_shortcut(manifest: &mut Manifest, service: &dyn DriveService, item: &DriveFile) {
    let Some(parent_id) = item.parents.first() else {
        return;
    };
    let Some(parent_path) = manifest.folder_path(parent_id).cloned() else {
        return;
    };
    let apparent = match parent_path.join(&item.name) {
        Ok(path) => path,
        Err(err) => {
            warn!(id = %item.id, %err, "skipping unrepresentable shortcut");
            return;
        }
    };
    record_file_shortcut_at(manifest, service, item, apparent).await;
}

/// Record a file-shortcut under its own parent and name but with the
/// target's content metadata.
async fn record_file_shortcut_at(
    manifest: &mut Manifest,
    service: &dyn DriveService,
    item: &DriveFile,
    apparent: SyncPath,
) {
    let Some(details) = &item.shortcut_details else {
        return;
    };
    match service.get_file(&details.target_id).await {
        Ok(target) => {
            manifest.insert_file(item.id.clone(), record_for(&target, apparent));
        }
        Err(err) => {
            warn!(id = %item.id, target = %details.target_id, %err, "shortcut target unavailable");
        }
    }
}

fn record_for(file: &DriveFile, path: SyncPath) -> FileRecord {
    FileRecord {
        path,
        size: file.size_bytes(),
        modified: clamp_to_ticks(file.modified_or_epoch()),
        checksum: file.content_checksum().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::types::ShortcutDetails;
    use crate::drive::MockDriveService;

    fn p(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    fn folder(id: &str, name: &str, parent: &str) -> DriveFile {
        DriveFile {
            id: id.into(),
            name: name.into(),
            mime_type: FOLDER_MIME.into(),
            parents: vec![parent.into()],
            ..DriveFile::default()
        }
    }

    fn file(id: &str, name: &str, parent: &str, size: i64, sum: &str) -> DriveFile {
        DriveFile {
            id: id.into(),
            name: name.into(),
            mime_type: "application/octet-stream".into(),
            parents: vec![parent.into()],
            size: Some(size),
            md5_checksum: Some(sum.into()),
            ..DriveFile::default()
        }
    }

    fn shortcut(id: &str, name: &str, parent: &str, target: &str, target_mime: &str) -> DriveFile {
        DriveFile {
            id: id.into(),
            name: name.into(),
            mime_type: SHORTCUT_MIME.into(),
            parents: vec![parent.into()],
            shortcut_details: Some(ShortcutDetails {
                target_id: target.into(),
                target_mime_type: target_mime.into(),
            }),
            ..DriveFile::default()
        }
    }

    fn root() -> DriveFile {
        DriveFile {
            id: "root-id".into(),
            name: "My Drive".into(),
            mime_type: FOLDER_MIME.into(),
            ..DriveFile::default()
        }
    }

    #[tokio::test]
    async fn builds_nested_hierarchy_with_shortcuts() {
        let mut service = MockDriveService::new();
        service
            .expect_get_file()
            .withf(|id| id == "root")
            .returning(|_| Ok(root()));
        // The file-shortcut target.
        service
            .expect_get_file()
            .withf(|id| id == "song-target")
            .returning(|_| Ok(file("song-target", "ignored.mp3", "elsewhere", 9, "beef")));

        service.expect_list_files().returning(|query| {
            if query.contains("or mimeType") {
                // Pass 1: folders + shortcuts.
                Ok(vec![
                    folder("d-docs", "docs", "root-id"),
                    folder("d-sub", "sub", "d-docs"),
                    shortcut("sc-shared", "shared", "root-id", "t-shared", FOLDER_MIME),
                ])
            } else if query.contains("mimeType !=") {
                // Pass 2: non-folders.
                Ok(vec![
                    file("f-a", "a.txt", "root-id", 12, "d41d"),
                    shortcut("sc-song", "song.mp3", "d-docs", "song-target", "audio/mpeg"),
                ])
            } else if query.contains("'t-shared' in parents") {
                Ok(vec![
                    folder("t-inner", "inner", "t-shared"),
                    file("t-file", "remote.bin", "t-shared", 3, "feed"),
                ])
            } else if query.contains("'t-inner' in parents") {
                Ok(vec![])
            } else {
                panic!("unexpected query: {query}");
            }
        });
        service
            .expect_get_start_page_token()
            .returning(|| Ok("start-7".to_string()));

        let manifest = build_from_cloud(&service).await.unwrap();
        manifest.check_invariants().unwrap();
        assert!(!manifest.is_dirty());
        assert_eq!(manifest.cursor(), "start-7");

        assert_eq!(manifest.folder_path("d-sub"), Some(&p("My Drive/docs/sub")));
        assert_eq!(manifest.folder_path("t-shared"), Some(&p("My Drive/shared")));
        assert_eq!(
            manifest.folder_path("t-inner"),
            Some(&p("My Drive/shared/inner"))
        );

        let a = manifest.file_at(&p("My Drive/a.txt")).unwrap();
        assert_eq!(a.size, 12);

        // File-shortcut: shortcut's parent and name, target's content.
        let song = manifest.file_at(&p("My Drive/docs/song.mp3")).unwrap();
        assert_eq!(song.size, 9);
        assert_eq!(song.checksum, "beef");
        assert_eq!(manifest.id_at(&p("My Drive/docs/song.mp3")), Some("sc-song"));

        let remote = manifest.file_at(&p("My Drive/shared/remote.bin")).unwrap();
        assert_eq!(remote.checksum, "feed");
    }

    #[tokio::test]
    async fn shortcut_cycles_terminate() {
        let mut service = MockDriveService::new();
        service
            .expect_get_file()
            .withf(|id| id == "root")
            .returning(|_| Ok(root()));
        service.expect_list_files().returning(|query| {
            if query.contains("or mimeType") {
                Ok(vec![shortcut("sc-a", "loop", "root-id", "t-a", FOLDER_MIME)])
            } else if query.contains("mimeType !=") {
                Ok(vec![])
            } else if query.contains("'t-a' in parents") {
                // The target contains a shortcut back to itself.
                Ok(vec![shortcut("sc-b", "again", "t-a", "t-a", FOLDER_MIME)])
            } else {
                panic!("unexpected query: {query}");
            }
        });
        service
            .expect_get_start_page_token()
            .returning(|| Ok("start".to_string()));

        let manifest = build_from_cloud(&service).await.unwrap();
        manifest.check_invariants().unwrap();
        assert_eq!(manifest.folder_path("t-a"), Some(&p("My Drive/loop")));
    }
}
