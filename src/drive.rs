//! Cloud drive adapter.
//!
//! Lists and downloads files from Google Drive using the Drive v3 REST API.
//! Implements recursive folder traversal with pagination, MIME filtering at
//! listing time, and a retry/backoff discipline for byte downloads.
//!
//! # Recognized folder URLs
//!
//! | Form | Example |
//! |------|---------|
//! | `/drive/folders/{ID}` | `https://drive.google.com/drive/folders/1AbC` |
//! | `/drive/u/{N}/folders/{ID}` | `https://drive.google.com/drive/u/0/folders/1AbC` |
//! | `/open?id={ID}` | `https://drive.google.com/open?id=1AbC` |
//!
//! Any other host or path is rejected.
//!
//! # Authentication
//!
//! A per-request user credential (OAuth bearer token) is used when supplied;
//! otherwise the service API key from `DRIVE_API_KEY` is appended. The two
//! modes produce distinct `PermissionDenied` messages so a caller can tell
//! "private folder, no token" from "token lacks access".
//!
//! # Download retry
//!
//! An initial try plus three backed-off retries (2 s, 4 s, 8 s, each with
//! random jitter of at most one second), 30 s per-attempt deadline. On
//! exhaustion, one final attempt against the alternative authenticated
//! download host. Every attempt passes through the drive limiter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DriveConfig;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::models::{is_supported_mime, DriveFile, DriveListing, FOLDER_MIME_TYPE};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_ALT_DOWNLOAD_BASE: &str = "https://drive.usercontent.google.com/download";
const LIST_PAGE_SIZE: u32 = 1000;

/// Thumbnail sizes the drive will actually render.
pub const MIN_THUMBNAIL_SIZE: u32 = 32;
pub const MAX_THUMBNAIL_SIZE: u32 = 1600;

/// Extracts the drive folder id from a user-supplied URL.
///
/// Pure function; used by the ingest coordinator before any network call.
pub fn parse_folder_url(url: &str) -> Result<String> {
    let invalid = || Error::InvalidUrl(url.to_string());

    let rest = url
        .trim()
        .strip_prefix("https://")
        .or_else(|| url.trim().strip_prefix("http://"))
        .ok_or_else(invalid)?;

    let (host, path_and_query) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => (rest, ""),
    };
    if host != "drive.google.com" {
        return Err(invalid());
    }

    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let path = path.split('#').next().unwrap_or(path);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let id = match segments.as_slice() {
        ["drive", "folders", id] => Some(*id),
        ["drive", "u", n, "folders", id] if n.chars().all(|c| c.is_ascii_digit()) => Some(*id),
        ["open"] => query.and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("id="))
                .filter(|v| !v.is_empty())
        }),
        _ => None,
    };

    match id {
        Some(id) if is_valid_drive_id(id) => Ok(id.to_string()),
        _ => Err(invalid()),
    }
}

fn is_valid_drive_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Clamp a requested thumbnail edge length to what the drive will serve.
pub fn clamp_thumbnail_size(size: u32) -> u32 {
    size.clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE)
}

/// Drive API surface consumed by the workers, sync engine, and thumbnail
/// proxy. Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait DriveClient: Send + Sync {
    /// Walks the folder tree breadth-first, paginating every level, and
    /// returns only files whose MIME type is supported.
    async fn list_images_recursive(
        &self,
        drive_folder_id: &str,
        credential: Option<&str>,
    ) -> Result<DriveListing>;

    /// Downloads the file content with retry/backoff; see module docs.
    async fn download_bytes(&self, drive_file_id: &str, credential: Option<&str>)
        -> Result<Vec<u8>>;

    /// Resolves a fresh short-lived thumbnail URL at roughly the requested
    /// edge length. Callers must cache with a bounded TTL and refresh on
    /// failure; the URL expires server-side.
    async fn fresh_thumbnail_url(
        &self,
        drive_file_id: &str,
        size: u32,
        credential: Option<&str>,
    ) -> Result<String>;
}

// ============ HTTP implementation ============

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<FileResource>,
}

#[derive(Debug, Deserialize)]
struct FileResource {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "thumbnailLink")]
    thumbnail_link: Option<String>,
    #[serde(rename = "webViewLink")]
    web_view_link: Option<String>,
    /// The API reports size as a decimal string.
    size: Option<String>,
    #[serde(rename = "md5Checksum")]
    md5_checksum: Option<String>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<DateTime<Utc>>,
    version: Option<String>,
}

/// Production drive adapter over the Drive v3 REST API.
pub struct HttpDriveClient {
    client: reqwest::Client,
    /// Service API key; `None` when all access is via user credentials.
    service_key: Option<String>,
    limiter: Arc<RateLimiter>,
    config: DriveConfig,
}

impl HttpDriveClient {
    pub fn new(service_key: Option<String>, limiter: Arc<RateLimiter>, config: DriveConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            service_key,
            limiter,
            config,
        }
    }

    /// Builds a GET request with the appropriate auth mode.
    fn authed_get(&self, url: &str, credential: Option<&str>) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match credential {
            Some(token) => req.bearer_auth(token),
            None => match &self.service_key {
                Some(key) => req.query(&[("key", key.as_str())]),
                None => req,
            },
        }
    }

    fn permission_denied(&self, credential: Option<&str>, what: &str) -> Error {
        if credential.is_some() {
            Error::PermissionDenied(format!(
                "Your account does not have access to {what}. Ask the owner to share it with you."
            ))
        } else {
            Error::PermissionDenied(format!(
                "{what} is not publicly accessible. Sign in or make it link-visible."
            ))
        }
    }

    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        credential: Option<&str>,
    ) -> Result<ListFilesResponse> {
        self.limiter.acquire().await;

        let url = format!("{DRIVE_API_BASE}/files");
        let query = format!("'{folder_id}' in parents and trashed = false");
        let page_size = LIST_PAGE_SIZE.to_string();
        let mut req = self.authed_get(&url, credential).query(&[
            ("q", query.as_str()),
            (
                "fields",
                "nextPageToken,files(id,name,mimeType,thumbnailLink,webViewLink,size,md5Checksum,modifiedTime,version)",
            ),
            ("pageSize", page_size.as_str()),
        ]);
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 403 || status.as_u16() == 404 {
            return Err(self.permission_denied(credential, &format!("folder {folder_id}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransientUpstream(format!(
                "drive list error {status}: {body}"
            )));
        }

        Ok(resp.json::<ListFilesResponse>().await?)
    }

    async fn folder_name(&self, folder_id: &str, credential: Option<&str>) -> Result<String> {
        self.limiter.acquire().await;

        let url = format!("{DRIVE_API_BASE}/files/{folder_id}");
        let resp = self
            .authed_get(&url, credential)
            .query(&[("fields", "name")])
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 403 || status.as_u16() == 404 {
            return Err(self.permission_denied(credential, &format!("folder {folder_id}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransientUpstream(format!(
                "drive metadata error {status}: {body}"
            )));
        }

        #[derive(Deserialize)]
        struct NameOnly {
            name: String,
        }
        Ok(resp.json::<NameOnly>().await?.name)
    }

    async fn download_attempt(&self, url: &str, credential: Option<&str>) -> Result<Vec<u8>> {
        self.limiter.acquire().await;

        let resp = tokio::time::timeout(
            Duration::from_secs(self.config.download_timeout_secs),
            self.authed_get(url, credential).send(),
        )
        .await
        .map_err(|_| {
            Error::TransientUpstream(format!(
                "download timed out after {} s",
                self.config.download_timeout_secs
            ))
        })??;

        let status = resp.status();
        if status.as_u16() == 403 || status.as_u16() == 404 {
            return Err(self.permission_denied(credential, "the file"));
        }
        if !status.is_success() {
            return Err(Error::TransientUpstream(format!(
                "drive download error {status}"
            )));
        }

        let bytes = tokio::time::timeout(
            Duration::from_secs(self.config.download_timeout_secs),
            resp.bytes(),
        )
        .await
        .map_err(|_| Error::TransientUpstream("download body read timed out".into()))??;

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl DriveClient for HttpDriveClient {
    async fn list_images_recursive(
        &self,
        drive_folder_id: &str,
        credential: Option<&str>,
    ) -> Result<DriveListing> {
        let folder_name = self.folder_name(drive_folder_id, credential).await?;

        let mut files = Vec::new();
        let mut to_visit = std::collections::VecDeque::from([drive_folder_id.to_string()]);

        while let Some(folder_id) = to_visit.pop_front() {
            let mut page_token: Option<String> = None;
            loop {
                let page = self
                    .list_page(&folder_id, page_token.as_deref(), credential)
                    .await?;

                for f in page.files {
                    if f.mime_type == FOLDER_MIME_TYPE {
                        to_visit.push_back(f.id);
                    } else if is_supported_mime(&f.mime_type) {
                        files.push(DriveFile {
                            id: f.id,
                            name: f.name,
                            mime_type: f.mime_type,
                            thumbnail_url: f.thumbnail_link,
                            view_url: f.web_view_link,
                            size: f.size.and_then(|s| s.parse().ok()),
                            checksum: f.md5_checksum,
                            modified_at: f.modified_time,
                            version: f.version,
                        });
                    }
                }

                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        }

        Ok(DriveListing {
            folder_name: Some(folder_name),
            files,
        })
    }

    async fn download_bytes(
        &self,
        drive_file_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<u8>> {
        let url = format!("{DRIVE_API_BASE}/files/{drive_file_id}?alt=media");

        let mut last_err = None;
        for attempt in 0..=self.config.download_attempts {
            if attempt > 0 {
                // 2s, 4s, 8s plus up to one second of jitter.
                let backoff = Duration::from_secs(2u64 << (attempt - 1).min(5));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=1000));
                tokio::time::sleep(backoff + jitter).await;
            }

            match self.download_attempt(&url, credential).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ Error::PermissionDenied(_)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }

        // Final fallback against the alternative authenticated endpoint.
        let alt = format!("{DRIVE_ALT_DOWNLOAD_BASE}?id={drive_file_id}&export=download");
        match self.download_attempt(&alt, credential).await {
            Ok(bytes) => Ok(bytes),
            Err(_) => Err(last_err
                .unwrap_or_else(|| Error::TransientUpstream("download failed".into()))),
        }
    }

    async fn fresh_thumbnail_url(
        &self,
        drive_file_id: &str,
        size: u32,
        credential: Option<&str>,
    ) -> Result<String> {
        self.limiter.acquire().await;

        let url = format!("{DRIVE_API_BASE}/files/{drive_file_id}");
        let resp = self
            .authed_get(&url, credential)
            .query(&[("fields", "thumbnailLink")])
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 403 || status.as_u16() == 404 {
            return Err(self.permission_denied(credential, &format!("file {drive_file_id}")));
        }
        if !status.is_success() {
            return Err(Error::TransientUpstream(format!(
                "drive thumbnail error {status}"
            )));
        }

        #[derive(Deserialize)]
        struct ThumbOnly {
            #[serde(rename = "thumbnailLink")]
            thumbnail_link: Option<String>,
        }
        let link = resp
            .json::<ThumbOnly>()
            .await?
            .thumbnail_link
            .ok_or_else(|| {
                Error::NotFound(format!("no thumbnail available for file {drive_file_id}"))
            })?;

        Ok(resize_thumbnail_link(&link, clamp_thumbnail_size(size)))
    }
}

/// Rewrites the `=sNNN` size suffix the drive appends to thumbnail links.
fn resize_thumbnail_link(link: &str, size: u32) -> String {
    match link.rfind("=s") {
        Some(pos) if link[pos + 2..].chars().all(|c| c.is_ascii_digit() || c == '-') => {
            format!("{}=s{}", &link[..pos], size)
        }
        _ => format!("{link}=s{size}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_folder_url() {
        assert_eq!(
            parse_folder_url("https://drive.google.com/drive/folders/1AbC_d-9").unwrap(),
            "1AbC_d-9"
        );
    }

    #[test]
    fn parses_user_scoped_folder_url() {
        assert_eq!(
            parse_folder_url("https://drive.google.com/drive/u/0/folders/XYZ").unwrap(),
            "XYZ"
        );
        assert_eq!(
            parse_folder_url("https://drive.google.com/drive/u/12/folders/XYZ").unwrap(),
            "XYZ"
        );
    }

    #[test]
    fn parses_open_query_url() {
        assert_eq!(
            parse_folder_url("https://drive.google.com/open?id=AbC123").unwrap(),
            "AbC123"
        );
        assert_eq!(
            parse_folder_url("https://drive.google.com/open?usp=sharing&id=AbC123").unwrap(),
            "AbC123"
        );
    }

    #[test]
    fn tolerates_query_and_fragment_suffixes() {
        assert_eq!(
            parse_folder_url("https://drive.google.com/drive/folders/1AbC?usp=sharing").unwrap(),
            "1AbC"
        );
    }

    #[test]
    fn rejects_foreign_hosts_and_paths() {
        for bad in [
            "https://example.com/drive/folders/1AbC",
            "https://docs.google.com/drive/folders/1AbC",
            "https://drive.google.com/file/d/1AbC/view",
            "https://drive.google.com/open?usp=sharing",
            "https://drive.google.com/drive/folders/",
            "ftp://drive.google.com/drive/folders/1AbC",
            "not a url",
        ] {
            assert!(parse_folder_url(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn rejects_ids_with_unexpected_characters() {
        assert!(parse_folder_url("https://drive.google.com/drive/folders/a%2Fb").is_err());
    }

    #[test]
    fn thumbnail_size_clamps() {
        assert_eq!(clamp_thumbnail_size(1), 32);
        assert_eq!(clamp_thumbnail_size(400), 400);
        assert_eq!(clamp_thumbnail_size(99_999), 1600);
    }

    #[test]
    fn thumbnail_link_resize() {
        assert_eq!(
            resize_thumbnail_link("https://lh3.example/abc=s220", 400),
            "https://lh3.example/abc=s400"
        );
        // No recognizable suffix: append one.
        assert_eq!(
            resize_thumbnail_link("https://lh3.example/abc", 64),
            "https://lh3.example/abc=s64"
        );
        // `=s` appearing mid-token is not a size suffix.
        assert_eq!(
            resize_thumbnail_link("https://lh3.example/a=sbc/xyz", 64),
            "https://lh3.example/a=sbc/xyz=s64"
        );
    }
}
