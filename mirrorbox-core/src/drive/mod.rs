//! The cloud collaborator contract.
//!
//! The engine talks to the drive exclusively through [`DriveService`]; the
//! reqwest-backed [`client::DriveClient`] is the production implementation
//! and tests substitute a mock. Content transfers are whole bodies, never
//! deltas.

pub mod auth;
pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use self::types::{ChangePage, DriveFile};

/// Canonical name of the drive root folder; the first segment of every
/// canonical path on both sides.
pub const DRIVE_ROOT_NAME: &str = "My Drive";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DriveService: Send + Sync {
    /// Fetch one file's metadata by id (`root` resolves the root folder).
    async fn get_file(&self, id: &str) -> Result<DriveFile>;

    /// List every file matching a Drive query, draining pagination.
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>>;

    /// Token marking "now" in the incremental change feed.
    async fn get_start_page_token(&self) -> Result<String>;

    /// One page of the incremental change feed, removals included.
    async fn list_changes(&self, page_token: &str) -> Result<ChangePage>;

    /// Download a file's whole content.
    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Create a file under a parent and upload its content.
    async fn upload(&self, parent_id: &str, name: &str, content: Vec<u8>) -> Result<DriveFile>;

    /// Replace an existing file's content.
    async fn update_content(&self, id: &str, content: Vec<u8>) -> Result<DriveFile>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile>;

    /// Re-parent and/or rename a file or folder.
    async fn relocate(
        &self,
        id: &str,
        remove_parent: &str,
        add_parent: &str,
        name: &str,
    ) -> Result<DriveFile>;

    async fn delete(&self, id: &str) -> Result<()>;
}
