//! Repository abstraction.
//!
//! The two concrete repositories, the drive hierarchy and the local tree,
//! are driven through one narrow interface: the processor replays canonical
//! changes against it, and the supervisor starts and stops monitoring
//! through it. Everything repository-specific (watcher mechanics, REST
//! plumbing, path mapping) stays behind the trait.

pub mod cloud;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::change::{ChangeInfo, RepoTag};
use crate::error::Result;
use crate::path::SyncPath;
use crate::processor::ChangeSink;

#[async_trait]
pub trait Repository: Send + Sync {
    fn tag(&self) -> RepoTag;

    /// Post-replay consistency probe: does this repository now hold the
    /// file/folder the change describes (checksum included, when known)?
    async fn exists(&self, change: &ChangeInfo) -> Result<bool>;

    /// Whole-content read; not-found is a fault here.
    async fn get_content(&self, path: &SyncPath) -> Result<Vec<u8>>;

    async fn create_or_update_file(
        &self,
        path: &SyncPath,
        content: &[u8],
        checksum: &str,
    ) -> Result<()>;

    async fn create_folder(&self, path: &SyncPath) -> Result<()>;

    async fn move_file(&self, from: &SyncPath, to: &SyncPath) -> Result<()>;

    async fn move_folder(&self, from: &SyncPath, to: &SyncPath) -> Result<()>;

    /// Not-found is success for removals.
    async fn remove_file(&self, path: &SyncPath) -> Result<()>;

    async fn remove_folder(&self, path: &SyncPath) -> Result<()>;

    /// Begin observing this repository, emitting canonical changes into the
    /// sink.
    async fn start_monitor(&self, sink: Arc<dyn ChangeSink>) -> Result<()>;

    async fn stop_monitor(&self) -> Result<()>;
}
