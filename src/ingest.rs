//! Ingest coordinator — the external entry point.
//!
//! Flow for a submission:
//!
//! 1. Reject a malformed URL (`InvalidUrl`) and extract the drive folder id.
//! 2. An existing folder row: link the user if unlinked, run a sync pass,
//!    return the refreshed snapshot.
//! 3. A new folder: list the drive recursively, enforce the per-folder cap,
//!    reject an image-free folder (`EmptyFolder`), create the folder and
//!    image rows in `pending`, and enqueue a folder job.
//!
//! The per-folder cap is enforced before any row is created, so a rejected
//! submission leaves no trace.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::app::AppContext;
use crate::drive::parse_folder_url;
use crate::error::{Error, Result};
use crate::models::{
    folder_job_id, FolderRecord, FolderSnapshot, ImageRecord, JobPayload, Status, FOLDER_QUEUE,
};
use crate::sync;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub folder_url: String,
    pub user_id: Option<Uuid>,
    /// Per-request drive credential; threaded through job payloads, never
    /// held as process state.
    pub credential: Option<String>,
}

pub async fn submit(ctx: &AppContext, request: IngestRequest) -> Result<FolderSnapshot> {
    let drive_folder_id = parse_folder_url(&request.folder_url)?;
    let credential = request.credential.as_deref();

    if let Some(existing) = ctx.store.get_folder_by_drive_id(&drive_folder_id).await? {
        if let Some(user_id) = request.user_id {
            ctx.store.link_folder_user(existing.id, user_id).await?;
            ctx.store
                .record_scan_receipt(user_id, &drive_folder_id)
                .await?;
        }
        sync::sync_folder(ctx, existing.id, credential).await?;
        let folder = ctx
            .store
            .get_folder(existing.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder {}", existing.id)))?;
        return Ok((&folder).into());
    }

    let listing = ctx
        .drive
        .list_images_recursive(&drive_folder_id, credential)
        .await?;

    if let Some(cap) = ctx.config.workers.folder_cap() {
        if listing.files.len() > cap {
            return Err(Error::FolderCapExceeded {
                found: listing.files.len(),
                cap,
            });
        }
    }
    if listing.files.is_empty() {
        return Err(Error::EmptyFolder);
    }

    let now = Utc::now();
    let folder = ctx
        .store
        .upsert_folder(&FolderRecord {
            id: Uuid::new_v4(),
            drive_folder_id: drive_folder_id.clone(),
            name: listing.folder_name.clone(),
            origin_url: request.folder_url.clone(),
            user_id: request.user_id,
            status: Status::Pending,
            total_images: listing.files.len() as i64,
            processed_images: 0,
            created_at: now,
            updated_at: now,
        })
        .await?;

    let rows: Vec<ImageRecord> = listing
        .files
        .iter()
        .map(|f| ImageRecord::pending(folder.id, f))
        .collect();
    ctx.store.create_images_bulk(&rows).await?;

    if let Some(user_id) = request.user_id {
        ctx.store
            .record_scan_receipt(user_id, &drive_folder_id)
            .await?;
    }

    let job_id = folder_job_id(&drive_folder_id, Utc::now().timestamp_millis());
    ctx.queue
        .enqueue(
            FOLDER_QUEUE,
            &job_id,
            JobPayload::Folder {
                folder_id: folder.id,
                credential: request.credential.clone(),
            },
        )
        .await?;

    info!(
        folder_id = %folder.id,
        drive_folder_id,
        images = listing.files.len(),
        "folder submitted"
    );

    Ok((&folder).into())
}
