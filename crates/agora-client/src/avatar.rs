//! Avatar upload with a local fallback.
//!
//! Images are POSTed to the configured endpoint, which answers with the
//! public URL.  When that fails for any reason the image is kept in the
//! local database and addressed with an `idb:{uuid}` URL instead.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{info, warn};

use agora_shared::constants::{LOCAL_BLOB_SCHEME, MAX_AVATAR_SIZE};
use agora_shared::UserId;
use agora_store::AvatarBlob;

use crate::error::{ClientError, Result};
use crate::state::SharedDatabase;
use crate::subscription::lock;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

pub struct AvatarUploader {
    http: reqwest::Client,
    endpoint: Option<String>,
    db: SharedDatabase,
}

impl AvatarUploader {
    pub fn new(endpoint: Option<String>, db: SharedDatabase) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, endpoint, db })
    }

    /// Upload `data` as `owner`'s avatar and return the URL to store on the
    /// profile.  Only oversized images and local storage failures are
    /// errors; upload failures fall back to local storage.
    pub async fn upload(&self, owner: &UserId, content_type: &str, data: Vec<u8>) -> Result<String> {
        if data.len() > MAX_AVATAR_SIZE {
            return Err(ClientError::InvalidInput(format!(
                "avatar is {} bytes, the limit is {MAX_AVATAR_SIZE}",
                data.len()
            )));
        }

        match self.post(content_type, data.clone()).await {
            Ok(url) => {
                info!(owner = %owner, url = %url, "avatar uploaded");
                Ok(url)
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "avatar upload failed, storing locally");
                let blob = lock(&self.db).store_avatar_blob(owner.as_str(), content_type, &data)?;
                Ok(blob.local_url())
            }
        }
    }

    /// Stored image for an `idb:` URL; `None` for remote URLs.
    pub fn resolve_local(&self, url: &str) -> Result<Option<AvatarBlob>> {
        if !url.starts_with(LOCAL_BLOB_SCHEME) {
            return Ok(None);
        }
        Ok(Some(lock(&self.db).resolve_local_url(url)?))
    }

    async fn post(&self, content_type: &str, data: Vec<u8>) -> Result<String> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| ClientError::Upload("no upload endpoint configured".into()))?;

        let resp = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::Upload(format!("server responded {}", resp.status())));
        }

        let body: UploadResponse = resp.json().await?;
        if body.url.trim().is_empty() {
            return Err(ClientError::Upload("server returned an empty url".into()));
        }
        Ok(body.url)
    }
}
