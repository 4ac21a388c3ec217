//! Reqwest-backed [`DriveService`] implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::drive::auth::AccessTokenProvider;
use crate::drive::types::{
    ChangePage, DriveFile, FileList, StartPageToken, FILE_FIELDS, FOLDER_MIME,
};
use crate::drive::DriveService;
use crate::error::{Result, SyncError};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const PAGE_SIZE: u32 = 1000;

pub struct DriveClient {
    http: reqwest::Client,
    token: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient").finish_non_exhaustive()
    }
}

impl DriveClient {
    pub fn new(token: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http, token })
    }

    async fn bearer(&self) -> Result<String> {
        self.token.access_token().await
    }

    /// Map HTTP status onto the engine's error kinds: 404 is NotFound (the
    /// caller decides whether that is success or fault), everything else
    /// unsuccessful is transport.
    async fn checked(&self, response: Response, what: &str) -> Result<Response> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(what.to_string()));
        }
        Ok(response.error_for_status()?)
    }
}

#[async_trait]
impl DriveService for DriveClient {
    async fn get_file(&self, id: &str) -> Result<DriveFile> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{API_BASE}/files/{id}"))
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;
        let response = self.checked(response, id).await?;
        Ok(response.json().await?)
    }

    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>> {
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let page_size = PAGE_SIZE.to_string();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.bearer().await?;
            let mut request = self
                .http
                .get(format!("{API_BASE}/files"))
                .bearer_auth(token)
                .query(&[
                    ("q", query),
                    ("fields", fields.as_str()),
                    ("pageSize", page_size.as_str()),
                    ("spaces", "drive"),
                ]);
            if let Some(cursor) = &page_token {
                request = request.query(&[("pageToken", cursor.as_str())]);
            }
            let response = self.checked(request.send().await?, "files.list").await?;
            let page: FileList = response.json().await?;
            debug!(count = page.files.len(), "drive files page");
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn get_start_page_token(&self) -> Result<String> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{API_BASE}/changes/startPageToken"))
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.checked(response, "changes.startPageToken").await?;
        let token: StartPageToken = response.json().await?;
        Ok(token.start_page_token)
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({FILE_FIELDS}))"
        );
        let page_size = PAGE_SIZE.to_string();
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{API_BASE}/changes"))
            .bearer_auth(token)
            .query(&[
                ("pageToken", page_token),
                ("fields", fields.as_str()),
                ("includeRemoved", "true"),
                ("pageSize", page_size.as_str()),
            ])
            .send()
            .await?;
        let response = self.checked(response, "changes.list").await?;
        Ok(response.json().await?)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{API_BASE}/files/{id}"))
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let response = self.checked(response, id).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(&self, parent_id: &str, name: &str, content: Vec<u8>) -> Result<DriveFile> {
        // Metadata first, then a media upload against the new id; avoids
        // multipart encoding.
        let token = self.bearer().await?;
        let response = self
            .http
            .post(format!("{API_BASE}/files"))
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({ "name": name, "parents": [parent_id] }))
            .send()
            .await?;
        let response = self.checked(response, "files.create").await?;
        let created: DriveFile = response.json().await?;
        self.update_content(&created.id, content).await
    }

    async fn update_content(&self, id: &str, content: Vec<u8>) -> Result<DriveFile> {
        let token = self.bearer().await?;
        let response = self
            .http
            .patch(format!("{UPLOAD_BASE}/files/{id}"))
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(content)
            .send()
            .await?;
        let response = self.checked(response, id).await?;
        Ok(response.json().await?)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(format!("{API_BASE}/files"))
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent_id],
            }))
            .send()
            .await?;
        let response = self.checked(response, "files.create").await?;
        Ok(response.json().await?)
    }

    async fn relocate(
        &self,
        id: &str,
        remove_parent: &str,
        add_parent: &str,
        name: &str,
    ) -> Result<DriveFile> {
        let token = self.bearer().await?;
        let response = self
            .http
            .patch(format!("{API_BASE}/files/{id}"))
            .bearer_auth(token)
            .query(&[
                ("addParents", add_parent),
                ("removeParents", remove_parent),
                ("fields", FILE_FIELDS),
            ])
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let response = self.checked(response, id).await?;
        Ok(response.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let token = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{API_BASE}/files/{id}"))
            .bearer_auth(token)
            .send()
            .await?;
        self.checked(response, id).await?;
        Ok(())
    }
}
