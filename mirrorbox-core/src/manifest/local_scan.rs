//! Full scan of the local tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::change::RepoTag;
use crate::checksum::{HashAlgorithm, CHECKSUM_UNREADABLE};
use crate::drive::DRIVE_ROOT_NAME;
use crate::error::Result;
use crate::manifest::codec::clamp_to_ticks;
use crate::manifest::{FileRecord, Manifest};
use crate::path::SyncPath;

/// Walk the whole tree under `root` and build a fresh manifest. Folder
/// identity is the canonical path itself; files get a freshly computed
/// checksum. Symlinks are not followed.
pub async fn build_from_local(root: &Path, algo: HashAlgorithm) -> Result<Manifest> {
    let mut manifest = Manifest::new(RepoTag::LocalDrive);
    let root_path = SyncPath::new(DRIVE_ROOT_NAME)?;
    manifest.insert_folder(root_path.as_str(), root_path.clone());

    let mut stack: Vec<(PathBuf, SyncPath)> = vec![(root.to_path_buf(), root_path)];
    while let Some((dir, canonical)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            };
            let child = match canonical.join(name) {
                Ok(child) => child,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "skipping unrepresentable path");
                    continue;
                }
            };
            if file_type.is_dir() {
                manifest.insert_folder(child.as_str(), child.clone());
                stack.push((entry.path(), child));
            } else {
                let metadata = entry.metadata().await?;
                let modified = metadata
                    .modified()
                    .map(|t| clamp_to_ticks(DateTime::<Utc>::from(t)))
                    .unwrap_or_default();
                let checksum = match algo.hash_file(&entry.path()).await {
                    Ok(sum) => sum,
                    Err(err) => {
                        warn!(path = %entry.path().display(), %err, "file unreadable during scan");
                        CHECKSUM_UNREADABLE.to_string()
                    }
                };
                manifest.insert_file(
                    child.clone().as_str(),
                    FileRecord {
                        path: child,
                        size: metadata.len() as i64,
                        modified,
                        checksum,
                    },
                );
            }
        }
    }

    manifest.mark_clean();
    Ok(manifest)
}
