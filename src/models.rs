//! Core data types that flow through the ingestion and search pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Drive listing → DriveFile → create_images_bulk() → ImageRecord (pending)
//!                                                         ↓
//!                       caption() → embed_caption() → completed row
//!                                                         ↓
//!                                            search() → SearchHit
//! ```
//!
//! # Type Relationships
//!
//! - A **[`DriveFile`]** is produced by the drive adapter before any storage.
//! - A **[`FolderRecord`]** / **[`ImageRecord`]** are the persisted rows.
//! - A **[`JobPayload`]** is the typed queue payload; the three variants form
//!   a closed set dispatched on the serde `kind` discriminator.
//! - Search hits are produced by the search engine with a similarity score
//!   and a cleaned caption (see `search`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// MIME types admitted into the corpus. Anything else is skipped at listing
/// time and rejected at processing time.
pub const SUPPORTED_MIME_TYPES: [&str; 6] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/svg+xml",
];

/// MIME type the drive uses for subfolders; traversed, never admitted.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

pub fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime)
}

/// Processing status shared by folders and images.
///
/// Stored as lowercase TEXT; round-tripped via [`FromStr`] / [`fmt::Display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A file entry returned by the drive adapter's recursive listing.
///
/// Only entries whose `mime_type` is in [`SUPPORTED_MIME_TYPES`] reach this
/// type; subfolders are traversed inside the adapter and never emitted.
#[derive(Debug, Clone)]
pub struct DriveFile {
    /// Drive-side opaque file id, globally unique.
    pub id: String,
    /// Display name, e.g. `IMG_001.jpg`.
    pub name: String,
    pub mime_type: String,
    /// Short-lived thumbnail URL as reported at listing time.
    pub thumbnail_url: Option<String>,
    /// Human-viewable URL (`webViewLink`).
    pub view_url: Option<String>,
    pub size: Option<i64>,
    /// Content checksum reported by the drive, when available.
    pub checksum: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Opaque revision token; part of the image job idempotency key so a
    /// mutated file gets a fresh job.
    pub version: Option<String>,
}

/// Result of a recursive folder listing.
#[derive(Debug, Clone)]
pub struct DriveListing {
    /// Folder display name as discovered from the drive.
    pub folder_name: Option<String>,
    pub files: Vec<DriveFile>,
}

/// Persisted folder row.
#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub id: Uuid,
    /// Drive-side folder id; unique across the corpus.
    pub drive_folder_id: String,
    /// Human-readable name; `None` until discovered from the drive.
    pub name: Option<String>,
    pub origin_url: String,
    /// Owning user, when the submission carried one.
    pub user_id: Option<Uuid>,
    pub status: Status,
    pub total_images: i64,
    pub processed_images: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted image row. `caption`, `tags`, and `caption_vec` are all
/// non-null exactly when `status == Completed`.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: Uuid,
    /// Drive-side file id; unique across the corpus.
    pub drive_file_id: String,
    pub folder_id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub thumbnail_url: Option<String>,
    pub view_url: Option<String>,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub status: Status,
    pub caption: Option<String>,
    /// Comma-joined tag list.
    pub tags: Option<String>,
    pub caption_vec: Option<Vec<f32>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Fresh pending row for a listed drive file.
    pub fn pending(folder_id: Uuid, file: &DriveFile) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            drive_file_id: file.id.clone(),
            folder_id,
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            thumbnail_url: file.thumbnail_url.clone(),
            view_url: file.view_url.clone(),
            size: file.size,
            checksum: file.checksum.clone(),
            modified_at: file.modified_at,
            version: file.version.clone(),
            status: Status::Pending,
            caption: None,
            tags: None,
            caption_vec: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Registered user; owns folders weakly (a folder outlives its user row).
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    /// External auth-provider subject id.
    pub auth_id: String,
    pub email: Option<String>,
}

/// Bookkeeping row recording that a user ingested a drive folder.
///
/// Answers "has this user already scanned this folder" for dedup and sharing
/// features; never consulted by the processing pipeline itself.
#[derive(Debug, Clone)]
pub struct ScanReceipt {
    pub user_id: Uuid,
    pub drive_folder_id: String,
    pub scanned_at: DateTime<Utc>,
    pub deleted: bool,
}

/// Folder snapshot returned by the ingest, sync, and list surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct FolderSnapshot {
    pub id: Uuid,
    pub drive_folder_id: String,
    pub name: Option<String>,
    pub status: Status,
    pub total_images: i64,
    pub processed_images: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&FolderRecord> for FolderSnapshot {
    fn from(f: &FolderRecord) -> Self {
        Self {
            id: f.id,
            drive_folder_id: f.drive_folder_id.clone(),
            name: f.name.clone(),
            status: f.status,
            total_images: f.total_images,
            processed_images: f.processed_images,
            created_at: f.created_at,
        }
    }
}

/// Outcome of one sync pass over a folder.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub status: Status,
    pub total_images: i64,
    pub processed_images: i64,
}

/// Per-image counts by status, as reported by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

// ============ Queue payloads ============

/// Typed queue payload. A closed variant set dispatched on the `kind`
/// discriminator; new job shapes widen the enum, never duck-type.
///
/// The optional `credential` is a per-request user token threaded from the
/// submission down to the drive adapter. It is carried on the payload, never
/// held as ambient process state; absent credential means service-key access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Folder {
        folder_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
    Image {
        image_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
    ImageBatch {
        folder_id: Uuid,
        image_ids: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
}

/// Logical queue names. Two queues, fixed.
pub const FOLDER_QUEUE: &str = "folders";
pub const IMAGE_QUEUE: &str = "images";

/// Idempotency key for a folder job. The timestamp suffix allows re-enqueue
/// after sync discovers new items.
pub fn folder_job_id(drive_folder_id: &str, enqueue_unix_ms: i64) -> String {
    format!("folder:{drive_folder_id}:{enqueue_unix_ms}")
}

/// Idempotency key for a single-image job. Keyed on the version token so a
/// mutated file gets a fresh job while duplicates of the same revision dedup.
pub fn image_job_id(drive_file_id: &str, version: Option<&str>) -> String {
    format!("image:{drive_file_id}:{}", version.unwrap_or("0"))
}

/// Idempotency key for an image-batch job.
pub fn batch_job_id(folder_id: Uuid, enqueue_unix_ms: i64, random: u32) -> String {
    format!("batch:{folder_id}:{enqueue_unix_ms}:{random:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            Status::Pending,
            Status::Processing,
            Status::Completed,
            Status::Failed,
        ] {
            assert_eq!(s.to_string().parse::<Status>().unwrap(), s);
        }
        assert!("cancelled".parse::<Status>().is_err());
    }

    #[test]
    fn supported_mime_set() {
        assert!(is_supported_mime("image/jpeg"));
        assert!(is_supported_mime("image/svg+xml"));
        assert!(!is_supported_mime("image/heic"));
        assert!(!is_supported_mime(FOLDER_MIME_TYPE));
    }

    #[test]
    fn job_payload_discriminator() {
        let folder_id = Uuid::new_v4();
        let payload = JobPayload::ImageBatch {
            folder_id,
            image_ids: vec![Uuid::new_v4()],
            credential: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "image_batch");
        assert!(json.get("credential").is_none());

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn idempotency_key_shapes() {
        assert_eq!(
            folder_job_id("FA", 1700000000000),
            "folder:FA:1700000000000"
        );
        assert_eq!(image_job_id("F1", Some("v7")), "image:F1:v7");
        assert_eq!(image_job_id("F1", None), "image:F1:0");
        let id = batch_job_id(Uuid::nil(), 1700000000000, 0xdead);
        assert!(id.starts_with("batch:00000000-0000-0000-0000-000000000000:1700000000000:"));
        assert!(id.ends_with("0000dead"));
    }
}
