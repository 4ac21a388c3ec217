//! Engine context and supervisor.
//!
//! Owns the two repositories, the processor, and the lifecycle: build or
//! resume the shadows, replay any persisted queue, drain the cloud feed to
//! idle, reconcile, then monitor steadily until stopped. The processor runs
//! under supervision: a fatal failure writes a crash file and the task is
//! restarted after a fixed delay unless stop was requested.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::change::RepoTag;
use crate::checksum::HashAlgorithm;
use crate::drive::DriveService;
use crate::error::Result;
use crate::manifest::cloud_scan::build_from_cloud;
use crate::manifest::local_scan::build_from_local;
use crate::processor::ChangeProcessor;
use crate::reconcile::reconcile;
use crate::repository::cloud::CloudRepository;
use crate::repository::local::LocalRepository;
use crate::repository::Repository;
use crate::state::{load_manifest, write_crash_file};

/// How long a crashed processor rests before the supervisor restarts it.
pub const PROCESSOR_RESTART_DELAY: Duration = Duration::from_secs(30);

/// Paths and tuning the engine needs; assembled by the configuration layer.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Local directory mirroring the drive root.
    pub local_root: PathBuf,
    /// Working directory for manifests, the queue file, and crash logs.
    pub state_dir: PathBuf,
    pub checksum: HashAlgorithm,
}

pub struct SyncEngine {
    local: Arc<LocalRepository>,
    cloud: Arc<CloudRepository>,
    processor: Arc<ChangeProcessor>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    state_dir: PathBuf,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Bring the engine up: shadows, queue, monitors, reconciliation.
    pub async fn start(
        service: Arc<dyn DriveService>,
        settings: EngineSettings,
    ) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();

        // The local shadow is always rebuilt: offline local edits are only
        // discoverable by scanning, and reconciliation needs that truth.
        info!(repo = %RepoTag::LocalDrive, root = %settings.local_root.display(), "scanning local tree");
        let local_manifest =
            build_from_local(&settings.local_root, settings.checksum).await?;

        // The cloud shadow resumes from disk when it can; the persisted
        // cursor then replays everything missed. A fresh build flips
        // reconciliation to remote precedence.
        let (cloud_manifest, remote_precedence) =
            match load_manifest(&settings.state_dir, RepoTag::GoogleDrive) {
                Ok(Some(manifest)) => (manifest, false),
                Ok(None) => {
                    info!(repo = %RepoTag::GoogleDrive, "no stored manifest, enumerating the drive");
                    (build_from_cloud(service.as_ref()).await?, true)
                }
                Err(err) => {
                    warn!(repo = %RepoTag::GoogleDrive, %err, "stored manifest unreadable, enumerating the drive");
                    (build_from_cloud(service.as_ref()).await?, true)
                }
            };

        let local = LocalRepository::new(
            &settings.local_root,
            &settings.state_dir,
            settings.checksum,
            local_manifest,
            cancel.clone(),
        );
        let cloud = CloudRepository::new(
            service,
            &settings.state_dir,
            cloud_manifest,
            cancel.clone(),
        );

        let repositories: Vec<Arc<dyn Repository>> = vec![cloud.clone(), local.clone()];
        let processor = Arc::new(ChangeProcessor::new(
            &settings.state_dir,
            repositories,
            cancel.clone(),
        ));

        let engine = Arc::new(Self {
            local,
            cloud,
            processor,
            cancel,
            supervisor: Mutex::new(None),
            state_dir: settings.state_dir,
        });
        engine.spawn_processor_supervisor().await;

        // Drain whatever accumulated in the feed while the engine was down,
        // then reconcile the rest.
        engine
            .cloud
            .start_monitor(engine.processor.clone())
            .await?;
        engine.cloud.wait_feed_idle().await;
        engine
            .local
            .start_monitor(engine.processor.clone())
            .await?;

        info!(remote_precedence, "reconciling");
        reconcile(
            &engine.cloud,
            &engine.local,
            &engine.processor,
            remote_precedence,
        )
        .await?;

        engine.cloud.save_manifest_if_dirty().await?;
        engine.local.save_manifest_if_dirty().await?;
        info!("engine started");
        Ok(engine)
    }

    async fn spawn_processor_supervisor(&self) {
        let processor = self.processor.clone();
        let cancel = self.cancel.clone();
        let state_dir = self.state_dir.clone();
        let task = tokio::spawn(async move {
            loop {
                let run = tokio::spawn(processor.clone().run());
                let detail = match run.await {
                    Ok(Ok(())) => break,
                    Ok(Err(err)) => format!("change processor failed: {err}"),
                    Err(join_err) => format!("change processor panicked: {join_err}"),
                };
                error!(%detail, "processor crashed");
                let crash_path = write_crash_file(&state_dir, &detail);
                error!(path = %crash_path.display(), "crash log written");
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PROCESSOR_RESTART_DELAY) => {}
                }
            }
        });
        *self.supervisor.lock().await = Some(task);
    }

    pub fn processor(&self) -> &Arc<ChangeProcessor> {
        &self.processor
    }

    pub fn local(&self) -> &Arc<LocalRepository> {
        &self.local
    }

    pub fn cloud(&self) -> &Arc<CloudRepository> {
        &self.cloud
    }

    /// Synchronous from the caller's perspective: returns once every task
    /// has exited and the state files are checkpointed.
    pub async fn stop(&self) {
        info!("stopping engine");
        self.cancel.cancel();
        if let Err(err) = self.local.stop_monitor().await {
            warn!(%err, "local monitor stop failed");
        }
        if let Err(err) = self.cloud.stop_monitor().await {
            warn!(%err, "cloud monitor stop failed");
        }
        if let Some(task) = self.supervisor.lock().await.take() {
            let _ = task.await;
        }
        if let Err(err) = self.local.save_manifest_if_dirty().await {
            warn!(%err, "final local manifest save failed");
        }
        if let Err(err) = self.cloud.save_manifest_if_dirty().await {
            warn!(%err, "final cloud manifest save failed");
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::types::{ChangePage, DriveFile};
    use crate::drive::MockDriveService;
    use crate::path::SyncPath;
    use crate::state::CHANGE_QUEUE_FILE;
    use chrono::DateTime;

    fn p(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    fn root() -> DriveFile {
        DriveFile {
            id: "root-id".into(),
            name: "My Drive".into(),
            mime_type: crate::drive::types::FOLDER_MIME.into(),
            ..DriveFile::default()
        }
    }

    fn cloud_a_txt() -> DriveFile {
        DriveFile {
            id: "f-a".into(),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            parents: vec!["root-id".into()],
            size: Some(12),
            modified_time: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
            md5_checksum: Some("9fc9d606912030dca86582ed62595cf7".into()),
            trashed: false,
            shortcut_details: None,
        }
    }

    /// Fresh download: one cloud file, empty local root; after startup the
    /// byte content is on disk and the queue has drained.
    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_download_materializes_the_cloud_file() {
        let mut service = MockDriveService::new();
        service
            .expect_get_file()
            .withf(|id| id == "root")
            .returning(|_| Ok(root()));
        service.expect_list_files().returning(|query| {
            if query.contains("or mimeType") {
                Ok(vec![])
            } else {
                Ok(vec![cloud_a_txt()])
            }
        });
        service
            .expect_get_start_page_token()
            .returning(|| Ok("start-1".into()));
        service.expect_list_changes().returning(|cursor| {
            Ok(ChangePage {
                changes: vec![],
                next_page_token: None,
                new_start_page_token: Some(cursor.to_string()),
            })
        });
        service
            .expect_download()
            .withf(|id| id == "f-a")
            .returning(|_| Ok(b"abcdefghijkl".to_vec()));

        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::start(
            Arc::new(service),
            EngineSettings {
                local_root: root_dir.path().to_path_buf(),
                state_dir: state_dir.path().to_path_buf(),
                checksum: HashAlgorithm::Md5,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read(root_dir.path().join("a.txt")).unwrap(),
            b"abcdefghijkl"
        );
        let local = engine.local().manifest_snapshot().await;
        let record = local.file_at(&p("My Drive/a.txt")).unwrap();
        assert_eq!(record.size, 12);
        assert_eq!(
            std::fs::read_to_string(state_dir.path().join(CHANGE_QUEUE_FILE)).unwrap(),
            "0\n"
        );

        engine.stop().await;
        // Both manifests checkpointed on the way down.
        assert!(state_dir.path().join(crate::state::GOOGLE_DRIVE_MANIFEST).exists());
        assert!(state_dir.path().join(crate::state::LOCAL_DRIVE_MANIFEST).exists());
    }

    /// Resumed cursor + local deletion while down: the cloud copy is removed
    /// rather than re-downloaded.
    #[tokio::test(flavor = "multi_thread")]
    async fn resumed_manifest_propagates_offline_local_deletion() {
        // Seed the state dir with a stored cloud manifest that still lists
        // the file the local side deleted while the engine was down.
        let state_dir = tempfile::tempdir().unwrap();
        {
            let mut manifest = crate::manifest::Manifest::new(RepoTag::GoogleDrive);
            manifest.set_cursor("cursor-9");
            manifest.insert_folder("root-id", p("My Drive"));
            manifest.insert_file(
                "f-a",
                crate::manifest::FileRecord {
                    path: p("My Drive/a.txt"),
                    size: 12,
                    modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                    checksum: "9fc9d606912030dca86582ed62595cf7".into(),
                },
            );
            crate::state::save_manifest(state_dir.path(), &mut manifest).unwrap();
        }

        let mut service = MockDriveService::new();
        service.expect_list_changes().returning(|cursor| {
            Ok(ChangePage {
                changes: vec![],
                next_page_token: None,
                new_start_page_token: Some(cursor.to_string()),
            })
        });
        let deleted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = deleted.clone();
        service.expect_delete().withf(|id| id == "f-a").returning(move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let root_dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::start(
            Arc::new(service),
            EngineSettings {
                local_root: root_dir.path().to_path_buf(),
                state_dir: state_dir.path().to_path_buf(),
                checksum: HashAlgorithm::Md5,
            },
        )
        .await
        .unwrap();

        assert!(deleted.load(std::sync::atomic::Ordering::SeqCst));
        let cloud = engine.cloud().manifest_snapshot().await;
        assert!(cloud.file_at(&p("My Drive/a.txt")).is_none());
        engine.stop().await;
    }
}
