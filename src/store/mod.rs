//! Storage abstraction for the image corpus.
//!
//! The [`Store`] trait defines every persistence operation the pipeline
//! needs, enabling pluggable backends: [`postgres::PgStore`] in production
//! and [`memory::MemoryStore`] for the test suite.
//!
//! # Concurrency contract
//!
//! All writes are per-row. The one cross-row invariant — a folder's
//! processed count never exceeds its total — is maintained by recomputing
//! `processed` from `count(status = completed)` inside the same transaction
//! that updates the folder ([`Store::update_folder_progress`]).
//!
//! Status transitions are guarded: [`Store::set_image_processing`] only
//! succeeds from `pending`, which is how a worker takes ownership of a row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FolderRecord, ImageRecord, Status, StatusCounts, UserRecord};

/// How a filename matched the query; ordered best-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    Exact,
    Prefix,
    Contains,
}

/// A hit from the lexical filename search.
#[derive(Debug, Clone)]
pub struct FilenameHit {
    pub image: ImageRecord,
    pub tier: MatchTier,
}

/// A hit from the vector similarity search, carrying the raw cosine distance.
#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub image: ImageRecord,
    pub distance: f32,
}

/// Scope selector for [`Store::reset_images_to_pending`].
#[derive(Debug, Clone)]
pub enum ResetScope {
    /// One image, from any status.
    Image(Uuid),
    /// An explicit set of images, from any status.
    Images(Vec<Uuid>),
    /// Every `failed` or `pending` image of a folder.
    FolderRetryable(Uuid),
}

/// Abstract storage backend.
///
/// | Method group | Purpose |
/// |--------------|---------|
/// | folder ops | create, look up, and mutate folder rows |
/// | image ops | bulk create, guarded status transitions, resets |
/// | search ops | ranked filename match and cosine similarity |
/// | infra ops | connectivity probe, vector extension/index provisioning |
#[async_trait]
pub trait Store: Send + Sync {
    // ---- infra ----

    /// Connectivity probe for the health surface.
    async fn ping(&self) -> Result<()>;

    /// Idempotently provisions the vector extension, column, and ANN index.
    /// Memoized per process. Returns `VectorBackendUnavailable` when the
    /// deployment lacks the extension; callers degrade rather than fail.
    async fn ensure_vector_infra(&self) -> Result<()>;

    // ---- folders ----

    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<FolderRecord>;

    async fn get_folder(&self, id: Uuid) -> Result<Option<FolderRecord>>;

    async fn get_folder_by_drive_id(&self, drive_folder_id: &str)
        -> Result<Option<FolderRecord>>;

    /// Attaches a user to a folder that has none; a no-op otherwise.
    async fn link_folder_user(&self, folder_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn set_folder_status(&self, folder_id: Uuid, status: Status) -> Result<()>;

    /// Updates the discovered display name.
    async fn set_folder_name(&self, folder_id: Uuid, name: &str) -> Result<()>;

    /// Recomputes `total_images` and `processed_images` from the image rows
    /// and applies the completion rule: status flips to `completed` exactly
    /// when `total > 0 && processed == total`, in the same transaction. A
    /// folder previously `completed` whose counts no longer match is demoted
    /// to `processing`.
    async fn update_folder_progress(&self, folder_id: Uuid) -> Result<FolderRecord>;

    async fn list_folders(&self, status: Option<Status>) -> Result<Vec<FolderRecord>>;

    /// Folders that still have pending images, regardless of folder status.
    async fn folders_with_pending_images(&self) -> Result<Vec<FolderRecord>>;

    // ---- images ----

    /// Inserts pending rows, skipping any whose drive file id already exists.
    /// Returns the number actually inserted.
    async fn create_images_bulk(&self, images: &[ImageRecord]) -> Result<u64>;

    async fn get_image(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    async fn list_images(&self, folder_id: Uuid) -> Result<Vec<ImageRecord>>;

    async fn list_pending_images(&self, folder_id: Uuid, limit: i64)
        -> Result<Vec<ImageRecord>>;

    async fn count_images_by_status(&self, folder_id: Uuid) -> Result<StatusCounts>;

    /// Guarded `pending → processing` transition. Returns `false` when the
    /// row was not pending, in which case the caller does not own it.
    async fn set_image_processing(&self, id: Uuid) -> Result<bool>;

    /// Single atomic write: status `completed`, caption, comma-joined tags,
    /// vector, error cleared, `updated_at` bumped.
    async fn set_image_completed(
        &self,
        id: Uuid,
        caption: &str,
        tags: &str,
        vector: &[f32],
    ) -> Result<()>;

    async fn set_image_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Resets rows to `pending`, nulling caption, tags, vector, and error
    /// atomically. Returns the rows in their reset state so callers can
    /// re-enqueue them.
    async fn reset_images_to_pending(&self, scope: ResetScope) -> Result<Vec<ImageRecord>>;

    /// Removes rows whose drive file ids upstream no longer lists. Rows
    /// currently `processing` are left alone. Returns the number deleted.
    async fn delete_images(&self, folder_id: Uuid, drive_file_ids: &[String]) -> Result<u64>;

    /// Images stuck in `processing` since before `cutoff`.
    async fn stuck_processing_images(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>>;

    // ---- search ----

    /// Ranked filename match: exact > starts-with > contains,
    /// case-insensitive, ties broken by name ascending.
    async fn search_by_filename(
        &self,
        folder_id: Uuid,
        pattern: &str,
        limit: i64,
    ) -> Result<Vec<FilenameHit>>;

    /// Rows ordered by ascending cosine distance to the query vector.
    /// Restricted to `completed` rows with a non-null vector.
    async fn search_by_similarity(
        &self,
        folder_id: Uuid,
        query_vec: &[f32],
        limit: i64,
    ) -> Result<Vec<SimilarityHit>>;

    // ---- users & receipts ----

    async fn upsert_user(&self, auth_id: &str, email: Option<&str>) -> Result<UserRecord>;

    /// Records (or refreshes) the receipt that `user_id` scanned a folder.
    async fn record_scan_receipt(&self, user_id: Uuid, drive_folder_id: &str) -> Result<()>;
}

/// Serializes a vector as the `[v0,v1,…]` literal the vector column accepts
/// via a parameterized cast. Driver-level binding of the vector type is not
/// generally available, so the literal-plus-cast form is the portable write
/// path; it stays inside the store and never leaks to callers.
pub fn vector_literal(vec: &[f32]) -> String {
    let mut out = String::with_capacity(vec.len() * 8 + 2);
    out.push('[');
    for (i, v) in vec.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Parses the textual form of a vector column back into floats.
pub fn parse_vector_literal(text: &str) -> Vec<f32> {
    text.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|s| s.trim().parse::<f32>().ok())
        .collect()
}

/// Exact cosine distance, used by the in-memory backend and as the reference
/// for what the ANN index approximates.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }
    1.0 - dot / denom
}

/// Classifies a filename against a query for the lexical tiers.
pub fn classify_filename_match(name: &str, query: &str) -> Option<MatchTier> {
    let name = name.to_lowercase();
    let query = query.to_lowercase();
    if name == query {
        Some(MatchTier::Exact)
    } else if name.starts_with(&query) {
        Some(MatchTier::Prefix)
    } else if name.contains(&query) {
        Some(MatchTier::Contains)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_roundtrip() {
        let v = vec![1.0f32, -2.5, 0.125];
        let lit = vector_literal(&v);
        assert_eq!(lit, "[1,-2.5,0.125]");
        assert_eq!(parse_vector_literal(&lit), v);
        assert_eq!(parse_vector_literal("[]"), Vec::<f32>::new());
    }

    #[test]
    fn cosine_distance_reference_points() {
        let a = vec![1.0, 0.0];
        assert!((cosine_distance(&a, &[1.0, 0.0])).abs() < 1e-6);
        assert!((cosine_distance(&a, &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&a, &[1.0]), 1.0);
    }

    #[test]
    fn filename_tiers() {
        assert_eq!(
            classify_filename_match("IMG_001.jpg", "img_001.jpg"),
            Some(MatchTier::Exact)
        );
        assert_eq!(
            classify_filename_match("IMG_001.jpg", "img"),
            Some(MatchTier::Prefix)
        );
        assert_eq!(
            classify_filename_match("IMG_001.jpg", "001"),
            Some(MatchTier::Contains)
        );
        assert_eq!(classify_filename_match("IMG_001.jpg", "png"), None);
        assert!(MatchTier::Exact < MatchTier::Prefix);
        assert!(MatchTier::Prefix < MatchTier::Contains);
    }
}
