//! In-memory store backend.
//!
//! Implements the full [`Store`] contract over mutex-guarded maps, with
//! exact cosine distance in place of the ANN index. Used by the test suite;
//! behavior mirrors the Postgres backend including transition guards, the
//! folder completion rule, and vector-backend degradation (constructed via
//! [`MemoryStore::without_vector_backend`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FolderRecord, ImageRecord, ScanReceipt, Status, StatusCounts, UserRecord};

use super::{
    classify_filename_match, cosine_distance, FilenameHit, ResetScope, SimilarityHit, Store,
};

#[derive(Default)]
struct State {
    folders: HashMap<Uuid, FolderRecord>,
    images: HashMap<Uuid, ImageRecord>,
    users: HashMap<String, UserRecord>,
    receipts: HashMap<(Uuid, String), ScanReceipt>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    vector_backend: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            vector_backend: true,
        }
    }

    /// A store whose vector backend reports unavailable, for degradation
    /// tests. Captions and tags still persist; vectors are dropped.
    pub fn without_vector_backend() -> Self {
        Self {
            state: Mutex::new(State::default()),
            vector_backend: false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_progress(folder: &mut FolderRecord, total: i64, processed: i64) {
    folder.total_images = total;
    folder.processed_images = processed;
    if total > 0 && processed == total {
        folder.status = Status::Completed;
    } else if folder.status == Status::Completed {
        folder.status = Status::Processing;
    }
    folder.updated_at = Utc::now();
}

fn reset_image(image: &mut ImageRecord) {
    image.status = Status::Pending;
    image.caption = None;
    image.tags = None;
    image.caption_vec = None;
    image.error = None;
    image.updated_at = Utc::now();
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_vector_infra(&self) -> Result<()> {
        if self.vector_backend {
            Ok(())
        } else {
            Err(Error::VectorBackendUnavailable(
                "memory store constructed without a vector backend".into(),
            ))
        }
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<FolderRecord> {
        let mut state = self.lock();
        if let Some(existing) = state
            .folders
            .values_mut()
            .find(|f| f.drive_folder_id == folder.drive_folder_id)
        {
            if existing.name.is_none() {
                existing.name = folder.name.clone();
            }
            existing.origin_url = folder.origin_url.clone();
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        state.folders.insert(folder.id, folder.clone());
        Ok(folder.clone())
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<FolderRecord>> {
        Ok(self.lock().folders.get(&id).cloned())
    }

    async fn get_folder_by_drive_id(
        &self,
        drive_folder_id: &str,
    ) -> Result<Option<FolderRecord>> {
        Ok(self
            .lock()
            .folders
            .values()
            .find(|f| f.drive_folder_id == drive_folder_id)
            .cloned())
    }

    async fn link_folder_user(&self, folder_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(folder) = state.folders.get_mut(&folder_id) {
            if folder.user_id.is_none() {
                folder.user_id = Some(user_id);
                folder.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn set_folder_status(&self, folder_id: Uuid, status: Status) -> Result<()> {
        let mut state = self.lock();
        let folder = state
            .folders
            .get_mut(&folder_id)
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
        folder.status = status;
        folder.updated_at = Utc::now();
        Ok(())
    }

    async fn set_folder_name(&self, folder_id: Uuid, name: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(folder) = state.folders.get_mut(&folder_id) {
            folder.name = Some(name.to_string());
            folder.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_folder_progress(&self, folder_id: Uuid) -> Result<FolderRecord> {
        let mut state = self.lock();
        let total = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id)
            .count() as i64;
        let processed = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id && i.status == Status::Completed)
            .count() as i64;

        let folder = state
            .folders
            .get_mut(&folder_id)
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
        apply_progress(folder, total, processed);
        Ok(folder.clone())
    }

    async fn list_folders(&self, status: Option<Status>) -> Result<Vec<FolderRecord>> {
        let state = self.lock();
        let mut folders: Vec<_> = state
            .folders
            .values()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .cloned()
            .collect();
        folders.sort_by_key(|f| f.created_at);
        Ok(folders)
    }

    async fn folders_with_pending_images(&self) -> Result<Vec<FolderRecord>> {
        let state = self.lock();
        let mut folders: Vec<_> = state
            .folders
            .values()
            .filter(|f| {
                state
                    .images
                    .values()
                    .any(|i| i.folder_id == f.id && i.status == Status::Pending)
            })
            .cloned()
            .collect();
        folders.sort_by_key(|f| f.created_at);
        Ok(folders)
    }

    async fn create_images_bulk(&self, images: &[ImageRecord]) -> Result<u64> {
        let mut state = self.lock();
        let mut inserted = 0u64;
        for image in images {
            let exists = state
                .images
                .values()
                .any(|i| i.drive_file_id == image.drive_file_id);
            if !exists {
                state.images.insert(image.id, image.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_image(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        Ok(self.lock().images.get(&id).cloned())
    }

    async fn list_images(&self, folder_id: Uuid) -> Result<Vec<ImageRecord>> {
        let state = self.lock();
        let mut images: Vec<_> = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.name.to_lowercase());
        Ok(images)
    }

    async fn list_pending_images(
        &self,
        folder_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ImageRecord>> {
        let state = self.lock();
        let mut images: Vec<_> = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id && i.status == Status::Pending)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.created_at);
        images.truncate(limit.max(0) as usize);
        Ok(images)
    }

    async fn count_images_by_status(&self, folder_id: Uuid) -> Result<StatusCounts> {
        let state = self.lock();
        let mut counts = StatusCounts::default();
        for image in state.images.values().filter(|i| i.folder_id == folder_id) {
            match image.status {
                Status::Pending => counts.pending += 1,
                Status::Processing => counts.processing += 1,
                Status::Completed => counts.completed += 1,
                Status::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn set_image_processing(&self, id: Uuid) -> Result<bool> {
        let mut state = self.lock();
        match state.images.get_mut(&id) {
            Some(image) if image.status == Status::Pending => {
                image.status = Status::Processing;
                image.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_image_completed(
        &self,
        id: Uuid,
        caption: &str,
        tags: &str,
        vector: &[f32],
    ) -> Result<()> {
        let mut state = self.lock();
        let image = state
            .images
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("image {id}")))?;
        image.status = Status::Completed;
        image.caption = Some(caption.to_string());
        image.tags = Some(tags.to_string());
        image.caption_vec = self.vector_backend.then(|| vector.to_vec());
        image.error = None;
        image.updated_at = Utc::now();
        Ok(())
    }

    async fn set_image_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.lock();
        let image = state
            .images
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("image {id}")))?;
        image.status = Status::Failed;
        image.error = Some(error.to_string());
        image.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_images_to_pending(&self, scope: ResetScope) -> Result<Vec<ImageRecord>> {
        let mut state = self.lock();
        let mut reset = Vec::new();
        match scope {
            ResetScope::Image(id) => {
                if let Some(image) = state.images.get_mut(&id) {
                    reset_image(image);
                    reset.push(image.clone());
                }
            }
            ResetScope::Images(ids) => {
                for id in ids {
                    if let Some(image) = state.images.get_mut(&id) {
                        reset_image(image);
                        reset.push(image.clone());
                    }
                }
            }
            ResetScope::FolderRetryable(folder_id) => {
                for image in state.images.values_mut().filter(|i| {
                    i.folder_id == folder_id
                        && matches!(i.status, Status::Failed | Status::Pending)
                }) {
                    reset_image(image);
                    reset.push(image.clone());
                }
            }
        }
        Ok(reset)
    }

    async fn delete_images(&self, folder_id: Uuid, drive_file_ids: &[String]) -> Result<u64> {
        let mut state = self.lock();
        let before = state.images.len();
        state.images.retain(|_, i| {
            !(i.folder_id == folder_id
                && drive_file_ids.contains(&i.drive_file_id)
                && i.status != Status::Processing)
        });
        Ok((before - state.images.len()) as u64)
    }

    async fn stuck_processing_images(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>> {
        let state = self.lock();
        Ok(state
            .images
            .values()
            .filter(|i| i.status == Status::Processing && i.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn search_by_filename(
        &self,
        folder_id: Uuid,
        pattern: &str,
        limit: i64,
    ) -> Result<Vec<FilenameHit>> {
        let state = self.lock();
        let mut hits: Vec<FilenameHit> = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id)
            .filter_map(|i| {
                classify_filename_match(&i.name, pattern).map(|tier| FilenameHit {
                    image: i.clone(),
                    tier,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| a.image.name.to_lowercase().cmp(&b.image.name.to_lowercase()))
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn search_by_similarity(
        &self,
        folder_id: Uuid,
        query_vec: &[f32],
        limit: i64,
    ) -> Result<Vec<SimilarityHit>> {
        if !self.vector_backend {
            return Err(Error::VectorBackendUnavailable(
                "memory store constructed without a vector backend".into(),
            ));
        }

        let state = self.lock();
        let mut hits: Vec<SimilarityHit> = state
            .images
            .values()
            .filter(|i| i.folder_id == folder_id && i.status == Status::Completed)
            .filter_map(|i| {
                i.caption_vec.as_ref().map(|v| SimilarityHit {
                    image: i.clone(),
                    distance: cosine_distance(v, query_vec),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn upsert_user(&self, auth_id: &str, email: Option<&str>) -> Result<UserRecord> {
        let mut state = self.lock();
        let user = state
            .users
            .entry(auth_id.to_string())
            .or_insert_with(|| UserRecord {
                id: Uuid::new_v4(),
                auth_id: auth_id.to_string(),
                email: None,
            });
        if let Some(email) = email {
            user.email = Some(email.to_string());
        }
        Ok(user.clone())
    }

    async fn record_scan_receipt(&self, user_id: Uuid, drive_folder_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.receipts.insert(
            (user_id, drive_folder_id.to_string()),
            ScanReceipt {
                user_id,
                drive_folder_id: drive_folder_id.to_string(),
                scanned_at: Utc::now(),
                deleted: false,
            },
        );
        Ok(())
    }
}
