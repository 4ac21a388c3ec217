//! Fixed state files in the working directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::change::RepoTag;
use crate::error::{Result, SyncError};
use crate::manifest::Manifest;

pub const GOOGLE_DRIVE_MANIFEST: &str = "google_drive_manifest";
pub const LOCAL_DRIVE_MANIFEST: &str = "local_drive_manifest";
pub const CHANGE_QUEUE_FILE: &str = "changes";
pub const PROCESSOR_CRASH_PREFIX: &str = "change_processor_thread_crash";

pub fn manifest_file_name(tag: RepoTag) -> &'static str {
    match tag {
        RepoTag::GoogleDrive => GOOGLE_DRIVE_MANIFEST,
        RepoTag::LocalDrive => LOCAL_DRIVE_MANIFEST,
    }
}

/// Write a state file via a temp file in the same directory plus rename, so
/// a crash mid-write never leaves a half-written file behind.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SyncError::Internal(format!("state file has no parent: {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| SyncError::Io(err.error))?;
    Ok(())
}

/// Persist a manifest to its fixed file; clears the dirty flag.
pub fn save_manifest(state_dir: &Path, manifest: &mut Manifest) -> Result<()> {
    let mut buf = Vec::new();
    manifest.save(&mut buf)?;
    write_atomic(&state_dir.join(manifest_file_name(manifest.source())), &buf)
}

/// Load a manifest from its fixed file. `Ok(None)` when the file does not
/// exist; a corrupt file is a parse error and the caller rebuilds.
pub fn load_manifest(state_dir: &Path, tag: RepoTag) -> Result<Option<Manifest>> {
    let path = state_dir.join(manifest_file_name(tag));
    let file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Manifest::load(tag, std::io::BufReader::new(file)).map(Some)
}

/// Timestamped crash file the processor supervisor writes before a restart.
pub fn write_crash_file(state_dir: &Path, detail: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = state_dir.join(format!("{PROCESSOR_CRASH_PREFIX}.{stamp}"));
    if let Err(err) = std::fs::write(&path, detail) {
        tracing::error!(%err, path = %path.display(), "failed to write crash file");
    }
    path
}
