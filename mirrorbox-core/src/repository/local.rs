//! The local filesystem repository.
//!
//! Raw `notify` events are bridged onto a channel and held in a queue for a
//! short coalesce window before being raised as canonical changes. The
//! window is what lets the pump compensate for watcher granularity:
//! redundant modify bursts collapse, create-then-delete flickers vanish,
//! and delete/create pairs whose content matches the shadow re-synthesize
//! into a single move.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::change::{ChangeInfo, RepoTag};
use crate::checksum::{HashAlgorithm, CHECKSUM_UNKNOWN};
use crate::drive::DRIVE_ROOT_NAME;
use crate::error::{Result, SyncError};
use crate::manifest::codec::clamp_to_ticks;
use crate::manifest::Manifest;
use crate::path::SyncPath;
use crate::processor::ChangeSink;
use crate::repository::Repository;
use crate::state::save_manifest;

/// How long a raw watcher event rests in the queue before the pump acts on
/// it.
pub const COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Raw watcher event, already reduced to the granularity the pump works at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RawEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl RawEvent {
    fn path(&self) -> &Path {
        match self {
            RawEvent::Created(p) | RawEvent::Changed(p) | RawEvent::Deleted(p) => p,
            RawEvent::Renamed { new, .. } => new,
        }
    }

    fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path().file_name()
    }
}

struct QueuedEvent {
    event: RawEvent,
    due: Instant,
}

/// Manifest plus the self-echo ledger, guarded together so a write and its
/// manifest registration are atomic with respect to the observer.
struct RepoState {
    manifest: Manifest,
    echo: HashMap<SyncPath, DateTime<Utc>>,
}

pub struct LocalRepository {
    root: PathBuf,
    state_dir: PathBuf,
    algo: HashAlgorithm,
    state: Mutex<RepoState>,
    monitor: Mutex<Option<MonitorHandle>>,
    cancel: CancellationToken,
    /// Back-reference so the monitor can hand the pump an owned handle.
    me: std::sync::Weak<LocalRepository>,
}

struct MonitorHandle {
    // Dropping the watcher stops the notify stream.
    watcher: Option<RecommendedWatcher>,
    pump: JoinHandle<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LocalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRepository")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LocalRepository {
    pub fn new(
        root: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        algo: HashAlgorithm,
        manifest: Manifest,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let root = root.into();
        let state_dir = state_dir.into();
        Arc::new_cyclic(|me| Self {
            root,
            state_dir,
            algo,
            state: Mutex::new(RepoState {
                manifest,
                echo: HashMap::new(),
            }),
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

    fn canonical(&self, os_path: &Path) -> Result<SyncPath> {
        SyncPath::from_os_path(os_path, &self.root, DRIVE_ROOT_NAME)
    }

    fn os_path(&self, path: &SyncPath) -> Result<PathBuf> {
        path.to_os_path(&self.root, DRIVE_ROOT_NAME)
    }

    /// Pump loop: consume queued events in FIFO order, each no earlier than
    /// its due time.
    async fn pump(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RawEvent>,
        sink: Arc<dyn ChangeSink>,
        cancel: CancellationToken,
    ) {
        let mut queue: VecDeque<QueuedEvent> = VecDeque::new();
        loop {
            if queue.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(event) => queue.push_back(QueuedEvent {
                            event,
                            due: Instant::now() + COALESCE_WINDOW,
                        }),
                        None => break,
                    },
                }
            } else {
                let due = queue.front().map(|q| q.due).unwrap_or_else(Instant::now);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(event) => queue.push_back(QueuedEvent {
                            event,
                            due: Instant::now() + COALESCE_WINDOW,
                        }),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(due) => {
                        self.process_head(&mut queue, sink.as_ref()).await;
                        if queue.is_empty() {
                            if let Err(err) = self.save_manifest_if_dirty().await {
                                warn!(repo = %RepoTag::LocalDrive, %err, "manifest checkpoint failed");
                            }
                        }
                    }
                }
            }
        }
        debug!(repo = %RepoTag::LocalDrive, "event pump stopped");
    }

    async fn process_head(&self, queue: &mut VecDeque<QueuedEvent>, sink: &dyn ChangeSink) {
        let Some(QueuedEvent { event: head, .. }) = queue.pop_front() else {
            return;
        };

        // Later events on the same path make the head redundant: a
        // subsequent Changed is folded in, a subsequent Deleted wins.
        if matches!(head, RawEvent::Created(_) | RawEvent::Changed(_)) {
            queue.retain(|q| {
                !matches!(&q.event, RawEvent::Changed(p) if p == head.path())
            });
            let deleted_later = queue
                .iter()
                .any(|q| matches!(&q.event, RawEvent::Deleted(p) if p == head.path()));
            if deleted_later {
                return;
            }
        }

        // A complementary event with the same filename may be the other half
        // of a move the watcher reported as delete + create.
        if matches!(head, RawEvent::Created(_) | RawEvent::Deleted(_)) {
            if let Some(idx) = find_move_companion(&head, queue) {
                let companion = queue.remove(idx).expect("companion index valid").event;
                let (old_os, new_os) = match &head {
                    RawEvent::Deleted(old) => (old.clone(), companion.path().to_path_buf()),
                    _ => (companion.path().to_path_buf(), head.path().to_path_buf()),
                };
                match self.try_synthesize_move(&old_os, &new_os).await {
                    Some(change) => {
                        sink.queue_change(change).await;
                        return;
                    }
                    None => {
                        // Not actually the same content; restore the
                        // companion and raise the head on its own.
                        queue.insert(
                            idx,
                            QueuedEvent {
                                event: companion,
                                due: Instant::now(),
                            },
                        );
                    }
                }
            }
        }

        self.raise(head, sink).await;
    }

    /// Check whether the file now at `new_os` is byte-identical (by size,
    /// mtime and checksum) to the shadow's record of `old_os`; if so the
    /// delete/create pair collapses into one move.
    async fn try_synthesize_move(&self, old_os: &Path, new_os: &Path) -> Option<ChangeInfo> {
        let old = self.canonical(old_os).ok()?;
        let new = self.canonical(new_os).ok()?;

        let metadata = tokio::fs::metadata(new_os).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        let modified = metadata
            .modified()
            .map(|t| clamp_to_ticks(DateTime::<Utc>::from(t)))
            .ok()?;
        let checksum = self.algo.hash_file(new_os).await.ok()?;

        let mut st = self.state.lock().await;
        let record = st.manifest.file_at(&old)?;
        if record.size != metadata.len() as i64
            || record.modified != modified
            || record.checksum != checksum
        {
            return None;
        }
        match st.manifest.register_move(&old, &new) {
            Ok(change) => change,
            Err(err) => {
                warn!(%old, %new, %err, "move synthesis rejected");
                None
            }
        }
    }

    /// Raise one raw event: map it into the canonical space, diff it
    /// against the shadow, and emit whatever change falls out.
    async fn raise(&self, event: RawEvent, sink: &dyn ChangeSink) {
        let change = match &event {
            RawEvent::Deleted(os_path) => {
                let Ok(path) = self.canonical(os_path) else {
                    debug!(path = %os_path.display(), "event outside root");
                    return;
                };
                let mut st = self.state.lock().await;
                st.manifest.register_local_removal(&path)
            }
            RawEvent::Renamed { old, new } => {
                let (Ok(old), Ok(new)) = (self.canonical(old), self.canonical(new)) else {
                    debug!("rename crossing the root boundary ignored");
                    return;
                };
                let mut st = self.state.lock().await;
                match st.manifest.register_move(&old, &new) {
                    Ok(Some(change)) => Some(change),
                    Ok(None) => {
                        // Unknown source: observe the destination fresh.
                        drop(st);
                        self.observe_path(&new).await
                    }
                    Err(err) => {
                        warn!(%old, %new, %err, "rename rejected");
                        None
                    }
                }
            }
            RawEvent::Created(os_path) | RawEvent::Changed(os_path) => {
                let Ok(path) = self.canonical(os_path) else {
                    debug!(path = %os_path.display(), "event outside root");
                    return;
                };
                self.observe_path(&path).await
            }
        };

        if let Some(change) = change {
            let st = self.state.lock().await;
            if let Some(stamp) = st.echo.get(&change.path) {
                debug!(repo = %RepoTag::LocalDrive, path = %change.path, %stamp,
                       "raising change on a recently self-written path");
            }
            drop(st);
            sink.queue_change(change).await;
        }
    }

    /// Stat-and-register the current state of one canonical path.
    async fn observe_path(&self, path: &SyncPath) -> Option<ChangeInfo> {
        let os_path = self.os_path(path).ok()?;
        let (is_folder, size, modified, checksum) = match tokio::fs::metadata(&os_path).await {
            Ok(metadata) if metadata.is_dir() => (true, -1, Utc::now(), CHECKSUM_UNKNOWN.into()),
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map(|t| clamp_to_ticks(DateTime::<Utc>::from(t)))
                    .unwrap_or_default();
                let checksum = match self.algo.hash_file(&os_path).await {
                    Ok(sum) => sum,
                    Err(_) => CHECKSUM_UNKNOWN.to_string(),
                };
                (false, metadata.len() as i64, modified, checksum)
            }
            // Already gone again; record the observation with placeholders.
            Err(_) => (false, -1, Utc::now(), CHECKSUM_UNKNOWN.to_string()),
        };
        let mut st = self.state.lock().await;
        st.manifest
            .register_local(path.clone(), is_folder, size, modified, checksum)
    }

    async fn rename_entry(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        let from_os = self.os_path(from)?;
        let to_os = self.os_path(to)?;

        let mut st = self.state.lock().await;
        st.echo.insert(from.clone(), Utc::now());
        st.echo.insert(to.clone(), Utc::now());

        if tokio::fs::try_exists(&to_os).await? {
            return Err(SyncError::Policy(format!("move destination exists: {to}")));
        }
        match tokio::fs::metadata(&from_os).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(from.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = to_os.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from_os, &to_os).await?;

        if let Err(err) = st.manifest.register_move(from, to) {
            warn!(%from, %to, %err, "manifest move registration failed");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn start_monitor_without_watcher(
        &self,
        sink: Arc<dyn ChangeSink>,
    ) -> mpsc::Sender<RawEvent> {
        let (tx, rx) = mpsc::channel(1024);
        let cancel = self.cancel.child_token();
        let repo = self.me.upgrade().expect("repository alive");
        let pump = tokio::spawn(repo.pump(rx, sink, cancel.clone()));
        *self.monitor.lock().await = Some(MonitorHandle {
            watcher: None,
            pump,
            cancel,
        });
        tx
    }
}

#[async_trait]
impl Repository for LocalRepository {
    fn tag(&self) -> RepoTag {
        RepoTag::LocalDrive
    }

    async fn exists(&self, change: &ChangeInfo) -> Result<bool> {
        let os_path = self.os_path(&change.path)?;
        let Ok(metadata) = tokio::fs::metadata(&os_path).await else {
            return Ok(false);
        };
        if change.is_folder {
            return Ok(metadata.is_dir());
        }
        if !metadata.is_file() {
            return Ok(false);
        }
        if change.checksum == CHECKSUM_UNKNOWN {
            return Ok(true);
        }
        Ok(self.algo.hash_file(&os_path).await? == change.checksum)
    }

    async fn get_content(&self, path: &SyncPath) -> Result<Vec<u8>> {
        let os_path = self.os_path(path)?;
        match tokio::fs::read(&os_path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_or_update_file(
        &self,
        path: &SyncPath,
        content: &[u8],
        checksum: &str,
    ) -> Result<()> {
        let os_path = self.os_path(path)?;

        // The lock spans the write and the manifest registration so the
        // watcher cannot observe the file in between and classify our own
        // write as an external change.
        let mut st = self.state.lock().await;
        st.echo.insert(path.clone(), Utc::now());

        let parent = os_path
            .parent()
            .ok_or_else(|| SyncError::Policy(format!("no parent directory: {path}")))?;
        tokio::fs::create_dir_all(parent).await?;

        // Content lands under a temporary name first; the consumer of the
        // stream owns the temp file until the rename.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, content)?;
        std::io::Write::flush(&mut tmp)?;
        tmp.persist(&os_path).map_err(|err| SyncError::Io(err.error))?;

        let metadata = tokio::fs::metadata(&os_path).await?;
        let modified = metadata
            .modified()
            .map(|t| clamp_to_ticks(DateTime::<Utc>::from(t)))
            .unwrap_or_default();
        let checksum = if checksum == CHECKSUM_UNKNOWN {
            self.algo.hash_bytes(content)
        } else {
            checksum.to_string()
        };
        let _ = st
            .manifest
            .register_local(path.clone(), false, metadata.len() as i64, modified, checksum);
        Ok(())
    }

    async fn create_folder(&self, path: &SyncPath) -> Result<()> {
        let os_path = self.os_path(path)?;
        let mut st = self.state.lock().await;
        st.echo.insert(path.clone(), Utc::now());
        tokio::fs::create_dir_all(&os_path).await?;
        let _ = st
            .manifest
            .register_local(path.clone(), true, -1, Utc::now(), CHECKSUM_UNKNOWN);
        Ok(())
    }

    async fn move_file(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        self.rename_entry(from, to).await
    }

    async fn move_folder(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        self.rename_entry(from, to).await
    }

    async fn remove_file(&self, path: &SyncPath) -> Result<()> {
        let os_path = self.os_path(path)?;
        let mut st = self.state.lock().await;
        st.echo.insert(path.clone(), Utc::now());
        match tokio::fs::remove_file(&os_path).await {
            Ok(()) => {}
            // Already gone counts as done.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let _ = st.manifest.register_local_removal(path);
        Ok(())
    }

    async fn remove_folder(&self, path: &SyncPath) -> Result<()> {
        let os_path = self.os_path(path)?;
        let mut st = self.state.lock().await;
        st.echo.insert(path.clone(), Utc::now());
        match tokio::fs::remove_dir_all(&os_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let _ = st.manifest.register_local_removal(path);
        Ok(())
    }

    async fn start_monitor(&self, sink: Arc<dyn ChangeSink>) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<RawEvent>(1024);
        let root = self.root.clone();
        let watcher = spawn_blocking(move || init_watcher(&root, tx))
            .await
            .map_err(|err| SyncError::Internal(format!("watcher init panicked: {err}")))??;

        let repo = self
            .me
            .upgrade()
            .ok_or_else(|| SyncError::Internal("repository dropped during start".into()))?;
        let cancel = self.cancel.child_token();
        let pump = tokio::spawn(repo.pump(rx, sink, cancel.clone()));

        *monitor = Some(MonitorHandle {
            watcher: Some(watcher),
            pump,
            cancel,
        });
        Ok(())
    }

    async fn stop_monitor(&self) -> Result<()> {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.cancel.cancel();
            drop(handle.watcher);
            let _ = handle.pump.await;
        }
        Ok(())
    }
}

fn init_watcher(root: &Path, tx: mpsc::Sender<RawEvent>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                for raw in map_notify_event(event) {
                    if tx.blocking_send(raw).is_err() {
                        warn!("watcher channel closed, dropping event");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "filesystem watcher error");
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| SyncError::Internal(format!("failed to create watcher: {err}")))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| SyncError::Internal(format!("failed to watch {}: {err}", root.display())))?;
    Ok(watcher)
}

/// Reduce a notify event to the pump's granularity. Partial renames come
/// through as delete/create halves; the pump's move synthesis pairs them
/// back up.
fn map_notify_event(event: notify::Event) -> Vec<RawEvent> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) => paths.next().map(RawEvent::Created).into_iter().collect(),
        EventKind::Remove(_) => paths.next().map(RawEvent::Deleted).into_iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (paths.next(), paths.next()) {
                (Some(old), Some(new)) => vec![RawEvent::Renamed { old, new }],
                (Some(only), None) => vec![RawEvent::Changed(only)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.next().map(RawEvent::Deleted).into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.next().map(RawEvent::Created).into_iter().collect()
        }
        EventKind::Modify(_) => paths.next().map(RawEvent::Changed).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Index of a complementary (Removed <-> Created) event in the queue whose
/// filename matches the head's.
fn find_move_companion(head: &RawEvent, queue: &VecDeque<QueuedEvent>) -> Option<usize> {
    let name = head.file_name()?;
    queue.iter().position(|q| {
        let complementary = matches!(
            (head, &q.event),
            (RawEvent::Created(_), RawEvent::Deleted(_)) | (RawEvent::Deleted(_), RawEvent::Created(_))
        );
        complementary && q.event.file_name() == Some(name)
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::manifest::local_scan::build_from_local;
    use tokio::sync::Notify;

    fn p(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    /// Sink that collects emitted changes and wakes waiters.
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

    impl CollectSink {
        fn collected(&self) -> Vec<ChangeInfo> {
            self.changes.lock().unwrap().clone()
        }

        async fn wait_for(&self, count: usize) {
            loop {
                // Register before checking so a notification between the
                // check and the await is not lost.
                let notified = self.wake.notified();
                if self.changes.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        }
    }

    struct Rig {
        repo: Arc<LocalRepository>,
        sink: Arc<CollectSink>,
        tx: mpsc::Sender<RawEvent>,
        root: PathBuf,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn rig() -> Rig {
        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let manifest = build_from_local(root_dir.path(), HashAlgorithm::Md5)
            .await
            .unwrap();
        let repo = LocalRepository::new(
            root_dir.path(),
            state_dir.path(),
            HashAlgorithm::Md5,
            manifest,
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        let tx = repo.start_monitor_without_watcher(sink.clone()).await;
        Rig {
            repo,
            sink,
            tx,
            root: root_dir.path().to_path_buf(),
            _dirs: (root_dir, state_dir),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn created_file_is_raised_with_checksum() {
        let rig = rig().await;
        std::fs::write(rig.root.join("new.txt"), b"abcd").unwrap();

        rig.tx
            .send(RawEvent::Created(rig.root.join("new.txt")))
            .await
            .unwrap();
        rig.sink.wait_for(1).await;

        let changes = rig.sink.collected();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert_eq!(changes[0].source, RepoTag::LocalDrive);
        assert_eq!(changes[0].path, p("My Drive/new.txt"));
        assert_eq!(changes[0].checksum, "e2fc714c4727ee9395f324cd2e7f331f");

        // The shadow saw the observation: replaying it is a no-op.
        let snapshot = rig.repo.manifest_snapshot().await;
        assert!(snapshot.file_at(&p("My Drive/new.txt")).is_some());
        rig.repo.stop_monitor().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn later_modified_on_same_path_is_coalesced() {
        let rig = rig().await;
        std::fs::write(rig.root.join("burst.txt"), b"final").unwrap();

        let path = rig.root.join("burst.txt");
        rig.tx.send(RawEvent::Created(path.clone())).await.unwrap();
        rig.tx.send(RawEvent::Changed(path.clone())).await.unwrap();
        rig.tx.send(RawEvent::Changed(path.clone())).await.unwrap();
        rig.sink.wait_for(1).await;

        // One Created; the redundant Changed events were dropped and the
        // drained queue produced nothing further.
        rig.repo.stop_monitor().await.unwrap();
        let changes = rig.sink.collected();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_delete_flicker_produces_nothing() {
        let rig = rig().await;
        let path = rig.root.join("flicker.txt");

        rig.tx.send(RawEvent::Created(path.clone())).await.unwrap();
        rig.tx.send(RawEvent::Deleted(path.clone())).await.unwrap();

        // Let both due times elapse.
        tokio::time::sleep(COALESCE_WINDOW * 3).await;
        rig.repo.stop_monitor().await.unwrap();

        // The Created head was suppressed by the later Deleted; the Deleted
        // found nothing in the shadow to remove.
        assert!(rig.sink.collected().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_create_pair_synthesizes_a_move() {
        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root_dir.path().join("a")).unwrap();
        std::fs::create_dir_all(root_dir.path().join("b")).unwrap();
        std::fs::write(root_dir.path().join("a/p.bin"), b"same-bytes").unwrap();

        let manifest = build_from_local(root_dir.path(), HashAlgorithm::Md5)
            .await
            .unwrap();
        let repo = LocalRepository::new(
            root_dir.path(),
            state_dir.path(),
            HashAlgorithm::Md5,
            manifest,
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        let tx = repo.start_monitor_without_watcher(sink.clone()).await;

        // The OS-level move already happened; the watcher reported halves.
        std::fs::rename(
            root_dir.path().join("a/p.bin"),
            root_dir.path().join("b/p.bin"),
        )
        .unwrap();
        tx.send(RawEvent::Deleted(root_dir.path().join("a/p.bin")))
            .await
            .unwrap();
        tx.send(RawEvent::Created(root_dir.path().join("b/p.bin")))
            .await
            .unwrap();
        sink.wait_for(1).await;
        repo.stop_monitor().await.unwrap();

        let changes = sink.collected();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Moved);
        assert_eq!(changes[0].path, p("My Drive/b/p.bin"));
        assert_eq!(changes[0].old_path, Some(p("My Drive/a/p.bin")));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_event_is_classified_by_directory() {
        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root_dir.path().join("docs")).unwrap();
        std::fs::write(root_dir.path().join("docs/x.txt"), b"body").unwrap();

        let manifest = build_from_local(root_dir.path(), HashAlgorithm::Md5)
            .await
            .unwrap();
        let repo = LocalRepository::new(
            root_dir.path(),
            state_dir.path(),
            HashAlgorithm::Md5,
            manifest,
            CancellationToken::new(),
        );
        let sink = Arc::new(CollectSink::default());
        let tx = repo.start_monitor_without_watcher(sink.clone()).await;

        std::fs::rename(
            root_dir.path().join("docs/x.txt"),
            root_dir.path().join("docs/y.txt"),
        )
        .unwrap();
        tx.send(RawEvent::Renamed {
            old: root_dir.path().join("docs/x.txt"),
            new: root_dir.path().join("docs/y.txt"),
        })
        .await
        .unwrap();
        sink.wait_for(1).await;
        repo.stop_monitor().await.unwrap();

        let changes = sink.collected();
        assert_eq!(changes[0].kind, ChangeKind::Renamed);
        assert_eq!(changes[0].old_path, Some(p("My Drive/docs/x.txt")));
        assert_eq!(changes[0].path, p("My Drive/docs/y.txt"));
    }

    #[tokio::test]
    async fn write_ops_update_disk_and_shadow() {
        let rig = rig().await;

        rig.repo
            .create_or_update_file(&p("My Drive/docs/a.txt"), b"abcd", "e2fc714c4727ee9395f324cd2e7f331f")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(rig.root.join("docs/a.txt")).unwrap(),
            b"abcd"
        );
        let snapshot = rig.repo.manifest_snapshot().await;
        let record = snapshot.file_at(&p("My Drive/docs/a.txt")).unwrap();
        assert_eq!(record.size, 4);
        assert_eq!(record.checksum, "e2fc714c4727ee9395f324cd2e7f331f");

        rig.repo
            .move_file(&p("My Drive/docs/a.txt"), &p("My Drive/docs/b.txt"))
            .await
            .unwrap();
        assert!(!rig.root.join("docs/a.txt").exists());
        assert!(rig.root.join("docs/b.txt").exists());

        rig.repo.remove_file(&p("My Drive/docs/b.txt")).await.unwrap();
        assert!(!rig.root.join("docs/b.txt").exists());
        // Removing it again is success, not fault.
        rig.repo.remove_file(&p("My Drive/docs/b.txt")).await.unwrap();
        rig.repo.stop_monitor().await.unwrap();
    }

    #[tokio::test]
    async fn move_to_occupied_destination_is_a_policy_error() {
        let rig = rig().await;
        rig.repo
            .create_or_update_file(&p("My Drive/one.txt"), b"1", "-")
            .await
            .unwrap();
        rig.repo
            .create_or_update_file(&p("My Drive/two.txt"), b"2", "-")
            .await
            .unwrap();

        let err = rig
            .repo
            .move_file(&p("My Drive/one.txt"), &p("My Drive/two.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Policy(_)));

        let err = rig
            .repo
            .move_file(&p("My Drive/ghost.txt"), &p("My Drive/three.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        rig.repo.stop_monitor().await.unwrap();
    }

    #[tokio::test]
    async fn exists_checks_checksum_for_files() {
        let rig = rig().await;
        rig.repo
            .create_or_update_file(&p("My Drive/a.txt"), b"abcd", "e2fc714c4727ee9395f324cd2e7f331f")
            .await
            .unwrap();

        let hit = ChangeInfo::new(
            RepoTag::GoogleDrive,
            ChangeKind::Created,
            p("My Drive/a.txt"),
            false,
            "e2fc714c4727ee9395f324cd2e7f331f",
        );
        assert!(rig.repo.exists(&hit).await.unwrap());

        let miss = ChangeInfo::new(
            RepoTag::GoogleDrive,
            ChangeKind::Created,
            p("My Drive/a.txt"),
            false,
            "0000",
        );
        assert!(!rig.repo.exists(&miss).await.unwrap());
        rig.repo.stop_monitor().await.unwrap();
    }

    #[test]
    fn companion_search_matches_filename_across_directories() {
        let head = RawEvent::Deleted(PathBuf::from("/r/a/p.bin"));
        let mut queue = VecDeque::new();
        queue.push_back(QueuedEvent {
            event: RawEvent::Changed(PathBuf::from("/r/b/p.bin")),
            due: Instant::now(),
        });
        queue.push_back(QueuedEvent {
            event: RawEvent::Created(PathBuf::from("/r/b/p.bin")),
            due: Instant::now(),
        });
        assert_eq!(find_move_companion(&head, &queue), Some(1));

        let unrelated = RawEvent::Deleted(PathBuf::from("/r/a/other.bin"));
        assert_eq!(find_move_companion(&unrelated, &queue), None);
    }

    #[test]
    fn notify_mapping_covers_rename_modes() {
        let renamed = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/r/x"), PathBuf::from("/r/y")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(renamed),
            vec![RawEvent::Renamed {
                old: PathBuf::from("/r/x"),
                new: PathBuf::from("/r/y"),
            }]
        );

        let from_half = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            paths: vec![PathBuf::from("/r/x")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(from_half),
            vec![RawEvent::Deleted(PathBuf::from("/r/x"))]
        );

        let access = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/r/x")],
            attrs: Default::default(),
        };
        assert!(map_notify_event(access).is_empty());
    }
}
