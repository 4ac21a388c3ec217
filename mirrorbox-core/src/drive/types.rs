//! Wire types for the Drive v3 REST surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::checksum::CHECKSUM_UNKNOWN;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";

/// Metadata fields the engine requests for every file.
pub const FILE_FIELDS: &str =
    "id,name,mimeType,parents,size,modifiedTime,md5Checksum,trashed,shortcutDetails";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parents: Vec<String>,
    /// The API serializes sizes as decimal strings.
    #[serde(deserialize_with = "de_opt_i64")]
    pub size: Option<i64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub md5_checksum: Option<String>,
    pub trashed: bool,
    pub shortcut_details: Option<ShortcutDetails>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn is_shortcut(&self) -> bool {
        self.mime_type == SHORTCUT_MIME
    }

    /// Whether this is a shortcut whose target is a folder. The query
    /// language cannot filter on target mime-type, so this check runs
    /// client-side.
    pub fn is_folder_shortcut(&self) -> bool {
        self.is_shortcut()
            && self
                .shortcut_details
                .as_ref()
                .is_some_and(|d| d.target_mime_type == FOLDER_MIME)
    }

    pub fn size_bytes(&self) -> i64 {
        self.size.unwrap_or(-1)
    }

    pub fn modified_or_epoch(&self) -> DateTime<Utc> {
        self.modified_time.unwrap_or_default()
    }

    pub fn content_checksum(&self) -> &str {
        self.md5_checksum.as_deref().unwrap_or(CHECKSUM_UNKNOWN)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
    #[serde(default)]
    pub target_mime_type: String,
}

/// One entry in the incremental change feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveChange {
    pub file_id: Option<String>,
    pub removed: bool,
    pub file: Option<DriveFile>,
}

impl DriveChange {
    /// Removed flag or a trashed payload both mean the file is gone.
    pub fn is_removal(&self) -> bool {
        self.removed || self.file.as_ref().is_some_and(|f| f.trashed)
    }
}

/// One page of the incremental change feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePage {
    pub changes: Vec<DriveChange>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileList {
    pub files: Vec<DriveFile>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPageToken {
    pub start_page_token: String,
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
