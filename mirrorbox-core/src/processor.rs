//! The change-processing pipeline.
//!
//! A single consumer drains the shared queue and replays each canonical
//! change against every repository that did not originate it. The queue is
//! persisted after every enqueue and again after every dequeue+complete, so
//! a crash between the two leaves the in-flight change on disk for the next
//! run to reapply. A sliding window of recently processed changes absorbs
//! the echo each write produces on the destination side's own observer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::change::{ChangeInfo, ChangeKind};
use crate::error::{Result, SyncError};
use crate::path::SyncPath;
use crate::repository::Repository;
use crate::state::{write_atomic, CHANGE_QUEUE_FILE};

/// Retention horizon of the recent-changes window used for echo
/// suppression. Fixed, not configurable.
pub const RECENT_CHANGE_WINDOW: Duration = Duration::from_secs(60);

/// Delay between a Cancelled replay attempt and its retry.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where observers push canonical changes.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn queue_change(&self, change: ChangeInfo);
}

struct RecentChange {
    change: ChangeInfo,
    at: Instant,
}

#[derive(Default)]
struct ProcessorState {
    queue: VecDeque<ChangeInfo>,
    recent: VecDeque<RecentChange>,
    busy: bool,
}

impl ProcessorState {
    fn prune_recent(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(front.at) > RECENT_CHANGE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ChangeProcessor {
    state: Mutex<ProcessorState>,
    wake: Notify,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    queue_path: PathBuf,
    repositories: Vec<Arc<dyn Repository>>,
}

impl std::fmt::Debug for ChangeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeProcessor")
            .field("queue_path", &self.queue_path)
            .field("repositories", &self.repositories.len())
            .finish()
    }
}

impl ChangeProcessor {
    /// Build the processor, reloading any queue a previous run left behind.
    /// A corrupt queue file is discarded; reconciliation covers the gap.
    pub fn new(
        state_dir: &Path,
        repositories: Vec<Arc<dyn Repository>>,
        cancel: CancellationToken,
    ) -> Self {
        let queue_path = state_dir.join(CHANGE_QUEUE_FILE);
        let mut state = ProcessorState::default();
        match load_queue(&queue_path) {
            Ok(queue) => state.queue = queue,
            Err(err) => {
                warn!(%err, "discarding corrupt change queue");
            }
        }
        let (idle_tx, idle_rx) = watch::channel(state.queue.is_empty());
        Self {
            state: Mutex::new(state),
            wake: Notify::new(),
            idle_tx,
            idle_rx,
            cancel,
            queue_path,
            repositories,
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle_rx.clone()
    }

    /// Wait until the queue is empty and no change is being applied.
    pub async fn wait_idle(&self) {
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

    /// Single consumer loop. Returns `Ok` on requested stop; an invariant
    /// violation propagates so the supervisor can crash-log and restart.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let mut st = self.state.lock().await;
            st.busy = false;
            self.persist_queue(&st);
            let head = loop {
                if let Some(change) = st.queue.pop_front() {
                    break Some(change);
                }
                let _ = self.idle_tx.send(true);
                if self.cancel.is_cancelled() {
                    break None;
                }
                drop(st);
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = self.cancel.cancelled() => {}
                }
                st = self.state.lock().await;
            };
            let Some(change) = head else {
                debug!("change processor stopping");
                return Ok(());
            };

            st.busy = true;
            let now = Instant::now();
            st.prune_recent(now);
            // An out-of-order Created/Removed pair must not cancel forever:
            // clear earlier complementary ghosts for this path before the
            // head itself enters the window.
            if let Some(complement) = complement_of(change.kind) {
                st.recent.retain(|entry| {
                    !(entry.change.kind == complement && entry.change.path == change.path)
                });
            }
            st.recent.push_back(RecentChange {
                change: change.clone(),
                at: now,
            });
            drop(st);

            self.apply(&change).await?;
        }
    }

    /// Replay one change against every non-originating repository.
    async fn apply(&self, change: &ChangeInfo) -> Result<()> {
        for repo in &self.repositories {
            if repo.tag() == change.source {
                continue;
            }
            loop {
                match self.apply_to(repo.as_ref(), change).await {
                    Ok(()) => break,
                    Err(SyncError::Cancelled(msg)) if !self.cancel.is_cancelled() => {
                        warn!(repo = %repo.tag(), %msg, "transient cancellation, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                            _ = self.cancel.cancelled() => break,
                        }
                    }
                    Err(err @ SyncError::Invariant(_)) => {
                        error!(repo = %repo.tag(), change = %change.to_line(), %err, "invariant violation");
                        return Err(err);
                    }
                    Err(err) => {
                        // Dropped on the floor; the next incremental sweep
                        // or reconciliation pass re-raises the divergence.
                        warn!(repo = %repo.tag(), change = %change.to_line(), %err, "change dropped");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_to(&self, dest: &dyn Repository, change: &ChangeInfo) -> Result<()> {
        match (change.is_folder, change.kind) {
            (false, ChangeKind::Created | ChangeKind::Modified) => {
                let content = self
                    .repo_by_tag(change.source)?
                    .get_content(&change.path)
                    .await?;
                dest.create_or_update_file(&change.path, &content, &change.checksum)
                    .await
            }
            (false, ChangeKind::Moved | ChangeKind::Renamed) => {
                dest.move_file(self.old_path_of(change)?, &change.path).await
            }
            (false, ChangeKind::Removed) => dest.remove_file(&change.path).await,
            (true, ChangeKind::Created) => dest.create_folder(&change.path).await,
            (true, ChangeKind::Moved | ChangeKind::Renamed) => {
                dest.move_folder(self.old_path_of(change)?, &change.path).await
            }
            (true, ChangeKind::Removed) => dest.remove_folder(&change.path).await,
            (true, ChangeKind::Modified) => Ok(()),
            (_, ChangeKind::MovedAndModified) => Err(SyncError::Invariant(
                "unsplit MovedAndModified reached the processor".into(),
            )),
        }
    }

    fn old_path_of<'c>(&self, change: &'c ChangeInfo) -> Result<&'c SyncPath> {
        change.old_path.as_ref().ok_or_else(|| {
            SyncError::Invariant(format!("{} change without old path", change.kind.as_str()))
        })
    }

    fn repo_by_tag(&self, tag: crate::change::RepoTag) -> Result<&Arc<dyn Repository>> {
        self.repositories
            .iter()
            .find(|repo| repo.tag() == tag)
            .ok_or_else(|| SyncError::Internal(format!("no repository tagged {tag}")))
    }

    fn persist_queue(&self, state: &ProcessorState) {
        let mut text = format!("{}\n", state.queue.len());
        for change in &state.queue {
            text.push_str(&change.to_line());
            text.push('\n');
        }
        if let Err(err) = write_atomic(&self.queue_path, text.as_bytes()) {
            warn!(%err, path = %self.queue_path.display(), "failed to persist change queue");
        }
    }
}

#[async_trait]
impl ChangeSink for ChangeProcessor {
    async fn queue_change(&self, change: ChangeInfo) {
        // The split happens at the producer, before anything is enqueued.
        if let Some((created, removed)) = change.split_moved_and_modified() {
            let mut st = self.state.lock().await;
            st.queue.push_back(created);
            st.queue.push_back(removed);
            self.persist_queue(&st);
            let _ = self.idle_tx.send(false);
            drop(st);
            self.wake.notify_one();
            return;
        }

        let mut st = self.state.lock().await;
        st.prune_recent(Instant::now());
        if st.recent.iter().any(|entry| entry.change == change) {
            debug!(change = %change.to_line(), "suppressed recently processed change");
            return;
        }
        st.queue.push_back(change);
        self.persist_queue(&st);
        let _ = self.idle_tx.send(false);
        drop(st);
        self.wake.notify_one();
    }
}

fn complement_of(kind: ChangeKind) -> Option<ChangeKind> {
    match kind {
        ChangeKind::Created => Some(ChangeKind::Removed),
        ChangeKind::Removed => Some(ChangeKind::Created),
        _ => None,
    }
}

fn load_queue(path: &Path) -> Result<VecDeque<ChangeInfo>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(VecDeque::new());
        }
        Err(err) => return Err(err.into()),
    };
    let mut lines = text.lines();
    let count: usize = lines
        .next()
        .ok_or_else(|| SyncError::Parse("empty change queue file".into()))?
        .parse()
        .map_err(|err| SyncError::Parse(format!("queue length: {err}")))?;
    let mut queue = VecDeque::with_capacity(count);
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| SyncError::Parse("change queue truncated".into()))?;
        let change = ChangeInfo::parse_line(line)?;
        // Old queue files may predate the producer-side split.
        if let Some((created, removed)) = change.split_moved_and_modified() {
            queue.push_back(created);
            queue.push_back(removed);
        } else {
            queue.push_back(change);
        }
    }
    Ok(queue)
}
