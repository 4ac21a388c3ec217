//! The drive-backed repository.
//!
//! Observation is a long-poll of the incremental change feed from the
//! persisted continuation cursor. The feed is at-least-once from the cursor
//! forward, so the cursor only advances after a page's entries have been
//! diffed into the shadow, and transport failures retry without advancing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::change::{ChangeInfo, RepoTag};
use crate::checksum::CHECKSUM_UNKNOWN;
use crate::drive::DriveService;
use crate::error::{Result, SyncError};
use crate::manifest::Manifest;
use crate::path::SyncPath;
use crate::processor::ChangeSink;
use crate::repository::Repository;
use crate::state::save_manifest;

/// Pause between drained feed batches.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Back-off after a transport failure before the same page is retried.
pub const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(10);

struct RepoState {
    manifest: Manifest,
    echo: HashMap<SyncPath, DateTime<Utc>>,
}

pub struct CloudRepository {
    service: Arc<dyn DriveService>,
    state_dir: PathBuf,
    state: Mutex<RepoState>,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
    monitor: Mutex<Option<MonitorHandle>>,
    cancel: CancellationToken,
    me: std::sync::Weak<CloudRepository>,
}

struct MonitorHandle {
    poller: JoinHandle<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CloudRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRepository")
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl CloudRepository {
    pub fn new(
        service: Arc<dyn DriveService>,
        state_dir: impl Into<PathBuf>,
        manifest: Manifest,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (idle_tx, idle_rx) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            service,
            state_dir: state_dir.into(),
            state: Mutex::new(RepoState {
                manifest,
                echo: HashMap::new(),
            }),
            idle_tx,
            idle_rx,
            monitor: Mutex::new(None),
            cancel,
            me: me.clone(),
        })
    }

    pub async fn manifest_snapshot(&self) -> Manifest {
        self.state.lock().await.manifest.clone()
    }

    pub async fn save_manifest_if_dirty(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.manifest.is_dirty() {
            save_manifest(&self.state_dir, &mut st.manifest)?;
        }
        Ok(())
    }

    /// Wait until the poller reports the feed drained with nothing new.
    pub async fn wait_feed_idle(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Long-poll loop: drain the feed, checkpoint the manifest, publish
    /// idle state, sleep, repeat.
    async fn poll_loop(
        self: Arc<Self>,
        sink: Arc<dyn ChangeSink>,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let drained = self.drain_feed(sink.as_ref(), &cancel).await;

            if let Err(err) = self.save_manifest_if_dirty().await {
                warn!(repo = %RepoTag::GoogleDrive, %err, "manifest checkpoint failed");
            }
            // A batch that ended in failure leaves the idle state as-is;
            // only a drained feed counts.
            if let Some(last_page_changes) = drained {
                let _ = self.idle_tx.send(last_page_changes == 0);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        debug!(repo = %RepoTag::GoogleDrive, "change poller stopped");
    }

    /// Page through the feed from the stored cursor until a new-start token
    /// arrives. Returns the number of entries on the final page, or `None`
    /// when the batch ended in failure.
    async fn drain_feed(&self, sink: &dyn ChangeSink, cancel: &CancellationToken) -> Option<usize> {
        let mut last_page_changes;
        loop {
            let cursor = {
                let st = self.state.lock().await;
                st.manifest.cursor().to_string()
            };
            let page = match self.service.list_changes(&cursor).await {
                Ok(page) => page,
                Err(err) if err.is_transient() => {
                    warn!(repo = %RepoTag::GoogleDrive, %err, "change feed transport failure, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(TRANSPORT_RETRY_DELAY) => {}
                    }
                    // Retry without advancing the cursor.
                    continue;
                }
                Err(err) => {
                    error!(repo = %RepoTag::GoogleDrive, %err, "change feed failed");
                    return None;
                }
            };

            last_page_changes = page.changes.len();

            // The repository lock is held across both the manifest diff and
            // the emission, so the processor cannot interleave a write with
            // a half-registered observation.
            let mut st = self.state.lock().await;
            for entry in &page.changes {
                let info = if entry.is_removal() {
                    entry
                        .file_id
                        .as_deref()
                        .and_then(|id| st.manifest.register_removal(id))
                } else if let Some(file) = &entry.file {
                    match st.manifest.register_cloud_file(file) {
                        Ok(info) => info,
                        Err(err) => {
                            warn!(id = %file.id, %err, "skipping unrepresentable change");
                            None
                        }
                    }
                } else {
                    None
                };
                if let Some(info) = info {
                    debug!(repo = %RepoTag::GoogleDrive, change = %info.to_line(), "observed");
                    sink.queue_change(info).await;
                }
            }

            if let Some(next) = page.next_page_token {
                st.manifest.set_cursor(next);
                continue;
            }
            if let Some(start) = page.new_start_page_token {
                st.manifest.set_cursor(start);
                return Some(last_page_changes);
            }
            error!(repo = %RepoTag::GoogleDrive, "change page carried neither token");
            return Some(last_page_changes);
        }
    }

    /// Resolve the id of a tracked parent folder.
    fn parent_id_of(manifest: &Manifest, path: &SyncPath) -> Result<String> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Policy(format!("no parent folder: {path}")))?;
        manifest
            .id_at(&parent)
            .map(str::to_string)
            .ok_or_else(|| SyncError::NotFound(format!("parent folder not tracked: {parent}")))
    }
}

#[async_trait]
impl Repository for CloudRepository {
    fn tag(&self) -> RepoTag {
        RepoTag::GoogleDrive
    }

    async fn exists(&self, change: &ChangeInfo) -> Result<bool> {
        let st = self.state.lock().await;
        if change.is_folder {
            return Ok(st.manifest.is_folder_path(&change.path));
        }
        Ok(st.manifest.file_at(&change.path).is_some_and(|record| {
            change.checksum == CHECKSUM_UNKNOWN || record.checksum == change.checksum
        }))
    }

    async fn get_content(&self, path: &SyncPath) -> Result<Vec<u8>> {
        let id = {
            let st = self.state.lock().await;
            st.manifest
                .id_at(path)
                .map(str::to_string)
                .ok_or_else(|| SyncError::NotFound(path.to_string()))?
        };
        self.service.download(&id).await
    }

    async fn create_or_update_file(
        &self,
        path: &SyncPath,
        content: &[u8],
        _checksum: &str,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        st.echo.insert(path.clone(), Utc::now());

        let updated = match st.manifest.id_at(path) {
            Some(id) => {
                let id = id.to_string();
                self.service.update_content(&id, content.to_vec()).await?
            }
            None => {
                let parent_id = Self::parent_id_of(&st.manifest, path)?;
                self.service
                    .upload(&parent_id, path.file_name(), content.to_vec())
                    .await?
            }
        };
        let _ = st.manifest.register_cloud_file(&updated)?;
        Ok(())
    }

    async fn create_folder(&self, path: &SyncPath) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.manifest.is_folder_path(path) {
            return Ok(());
        }
        st.echo.insert(path.clone(), Utc::now());
        let parent_id = Self::parent_id_of(&st.manifest, path)?;
        let created = self
            .service
            .create_folder(&parent_id, path.file_name())
            .await?;
        let _ = st.manifest.register_cloud_file(&created)?;
        Ok(())
    }

    async fn move_file(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        self.relocate_entry(from, to).await
    }

    async fn move_folder(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        self.relocate_entry(from, to).await
    }

    async fn remove_file(&self, path: &SyncPath) -> Result<()> {
        self.remove_entry(path).await
    }

    async fn remove_folder(&self, path: &SyncPath) -> Result<()> {
        self.remove_entry(path).await
    }

    async fn start_monitor(&self, sink: Arc<dyn ChangeSink>) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Ok(());
        }
        let repo = self
            .me
            .upgrade()
            .ok_or_else(|| SyncError::Internal("repository dropped during start".into()))?;
        let cancel = self.cancel.child_token();
        let poller = tokio::spawn(repo.poll_loop(sink, cancel.clone()));
        *monitor = Some(MonitorHandle { poller, cancel });
        Ok(())
    }

    async fn stop_monitor(&self) -> Result<()> {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.cancel.cancel();
            let _ = handle.poller.await;
        }
        Ok(())
    }
}

impl CloudRepository {
    async fn relocate_entry(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        let mut st = self.state.lock().await;
        let id = st
            .manifest
            .id_at(from)
            .map(str::to_string)
            .ok_or_else(|| SyncError::NotFound(from.to_string()))?;
        if st.manifest.id_at(to).is_some() {
            return Err(SyncError::Policy(format!("move destination exists: {to}")));
        }
        let old_parent = Self::parent_id_of(&st.manifest, from)?;
        let new_parent = Self::parent_id_of(&st.manifest, to)?;

        st.echo.insert(from.clone(), Utc::now());
        st.echo.insert(to.clone(), Utc::now());

        let moved = self
            .service
            .relocate(&id, &old_parent, &new_parent, to.file_name())
            .await?;
        let _ = st.manifest.register_cloud_file(&moved)?;
        Ok(())
    }

    async fn remove_entry(&self, path: &SyncPath) -> Result<()> {
        let mut st = self.state.lock().await;
        let Some(id) = st.manifest.id_at(path).map(str::to_string) else {
            // Nothing tracked there; removal is already complete.
            return Ok(());
        };
        st.echo.insert(path.clone(), Utc::now());
        match self.service.delete(&id).await {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let _ = st.manifest.register_removal(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::drive::types::{ChangePage, DriveChange, DriveFile, FOLDER_MIME};
    use crate::drive::MockDriveService;
    use crate::manifest::FileRecord;
    use tokio::sync::Notify;

    fn p(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    #[derive(Default)]
    struct CollectSink {
        changes: std::sync::Mutex<Vec<ChangeInfo>>,
        wake: Notify,
    }

    #[async_trait]
    impl ChangeSink for CollectSink {
        async fn queue_change(&self, change: ChangeInfo) {
            self.changes.lock().unwrap().push(change);
            self.wake.notify_waiters();
        }
    }

    fn seeded_manifest() -> Manifest {
        let mut m = Manifest::new(RepoTag::GoogleDrive);
        m.set_cursor("cursor-1");
        m.insert_folder("root-id", p("My Drive"));
        m.insert_folder("docs-id", p("My Drive/docs"));
        m.insert_file(
            "f1",
            FileRecord {
                path: p("My Drive/docs/x.txt"),
                size: 12,
                modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                checksum: "aaa".into(),
            },
        );
        m.mark_clean();
        m
    }

    fn renamed_file() -> DriveFile {
        DriveFile {
            id: "f1".into(),
            name: "y.txt".into(),
            mime_type: "text/plain".into(),
            parents: vec!["docs-id".into()],
            size: Some(12),
            modified_time: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
            md5_checksum: Some("aaa".into()),
            trashed: false,
            shortcut_details: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_emits_rename_and_advances_cursor() {
        let mut service = MockDriveService::new();
        service.expect_list_changes().returning(|cursor| {
            if cursor == "cursor-1" {
                Ok(ChangePage {
                    changes: vec![DriveChange {
                        file_id: Some("f1".into()),
                        removed: false,
                        file: Some(renamed_file()),
                    }],
                    next_page_token: Some("cursor-2".into()),
                    new_start_page_token: None,
                })
            } else {
                Ok(ChangePage {
                    changes: vec![],
                    next_page_token: None,
                    new_start_page_token: Some("cursor-2".into()),
                })
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        repo.start_monitor(sink.clone()).await.unwrap();
        repo.wait_feed_idle().await;
        repo.stop_monitor().await.unwrap();

        let changes = sink.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Renamed);
        assert_eq!(changes[0].path, p("My Drive/docs/y.txt"));
        assert_eq!(changes[0].old_path, Some(p("My Drive/docs/x.txt")));

        let snapshot = repo.manifest_snapshot().await;
        assert_eq!(snapshot.cursor(), "cursor-2");
        // The drained batch checkpointed the manifest.
        assert!(!snapshot.is_dirty());
        assert!(dir.path().join(crate::state::GOOGLE_DRIVE_MANIFEST).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_entries_unregister_by_id() {
        let mut service = MockDriveService::new();
        service.expect_list_changes().returning(|cursor| {
            if cursor == "cursor-1" {
                Ok(ChangePage {
                    changes: vec![DriveChange {
                        file_id: Some("f1".into()),
                        removed: true,
                        file: None,
                    }],
                    next_page_token: None,
                    new_start_page_token: Some("cursor-2".into()),
                })
            } else {
                Ok(ChangePage {
                    changes: vec![],
                    next_page_token: None,
                    new_start_page_token: Some(cursor.to_string()),
                })
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        repo.start_monitor(sink.clone()).await.unwrap();
        repo.wait_feed_idle().await;
        repo.stop_monitor().await.unwrap();

        let changes = sink.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].path, p("My Drive/docs/x.txt"));
        assert_eq!(changes[0].checksum, "aaa");

        let snapshot = repo.manifest_snapshot().await;
        assert!(snapshot.file_at(&p("My Drive/docs/x.txt")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn feed_failure_never_advances_the_cursor() {
        let mut service = MockDriveService::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        service.expect_list_changes().returning(move |cursor| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            // Every retry must still carry the original cursor.
            assert_eq!(cursor, "cursor-1");
            Err(SyncError::Internal("feed unavailable".into()))
        });

        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        repo.start_monitor(sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        repo.stop_monitor().await.unwrap();

        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert_eq!(repo.manifest_snapshot().await.cursor(), "cursor-1");
    }

    #[tokio::test]
    async fn upload_registers_the_result_in_the_shadow() {
        let mut service = MockDriveService::new();
        service
            .expect_upload()
            .withf(|parent, name, content| parent == "docs-id" && name == "new.txt" && content == b"abcd")
            .returning(|_, name, _| {
                Ok(DriveFile {
                    id: "f-new".into(),
                    name: name.to_string(),
                    mime_type: "text/plain".into(),
                    parents: vec!["docs-id".into()],
                    size: Some(4),
                    modified_time: Some(DateTime::from_timestamp(1_700_000_100, 0).unwrap()),
                    md5_checksum: Some("e2fc714c4727ee9395f324cd2e7f331f".into()),
                    trashed: false,
                    shortcut_details: None,
                })
            });

        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        repo.create_or_update_file(&p("My Drive/docs/new.txt"), b"abcd", "e2fc714c4727ee9395f324cd2e7f331f")
            .await
            .unwrap();

        let snapshot = repo.manifest_snapshot().await;
        let record = snapshot.file_at(&p("My Drive/docs/new.txt")).unwrap();
        assert_eq!(record.size, 4);
        assert_eq!(snapshot.id_at(&p("My Drive/docs/new.txt")), Some("f-new"));
    }

    #[tokio::test]
    async fn removing_an_untracked_path_is_success() {
        let service = MockDriveService::new();
        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        repo.remove_file(&p("My Drive/docs/ghost.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn relocate_rejects_occupied_destination() {
        let service = MockDriveService::new();
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = seeded_manifest();
        manifest.insert_file(
            "f2",
            FileRecord {
                path: p("My Drive/docs/y.txt"),
                size: 1,
                modified: DateTime::from_timestamp(0, 0).unwrap(),
                checksum: "bbb".into(),
            },
        );
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            manifest,
            CancellationToken::new(),
        );
        let err = repo
            .move_file(&p("My Drive/docs/x.txt"), &p("My Drive/docs/y.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Policy(_)));
    }

    #[tokio::test]
    async fn folder_creation_is_idempotent_in_the_shadow() {
        let mut service = MockDriveService::new();
        service.expect_create_folder().times(1).returning(|_, name| {
            Ok(DriveFile {
                id: "d-new".into(),
                name: name.to_string(),
                mime_type: FOLDER_MIME.into(),
                parents: vec!["root-id".into()],
                ..DriveFile::default()
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let repo = CloudRepository::new(
            Arc::new(service),
            dir.path(),
            seeded_manifest(),
            CancellationToken::new(),
        );
        repo.create_folder(&p("My Drive/new-folder")).await.unwrap();
        // Second call is satisfied from the shadow; the mock allows one call.
        repo.create_folder(&p("My Drive/new-folder")).await.unwrap();
    }
}
