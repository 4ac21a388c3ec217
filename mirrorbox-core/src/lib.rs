//! # Mirrorbox Core
//!
//! Bidirectional synchronization engine between a Google Drive hierarchy
//! and a local directory tree. Changes observed on either side are
//! normalized into canonical records, queued durably, and replayed against
//! the other side, with manifest-diff classification and a recent-changes
//! window keeping the engine's own writes from echoing back around the
//! loop.

pub mod change;
pub mod checksum;
pub mod drive;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod path;
pub mod processor;
pub mod reconcile;
pub mod repository;
pub mod state;

pub use change::{ChangeInfo, ChangeKind, RepoTag};
pub use checksum::HashAlgorithm;
pub use drive::client::DriveClient;
pub use drive::{DriveService, DRIVE_ROOT_NAME};
pub use engine::{EngineSettings, SyncEngine};
pub use error::{Result, SyncError};
pub use manifest::Manifest;
pub use path::SyncPath;
pub use processor::{ChangeProcessor, ChangeSink};
pub use reconcile::MIRROR_ONLY_PREFIX;
pub use repository::Repository;
