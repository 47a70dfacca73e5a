//! Synchronization engine.
//!
//! Reconciles a folder already present in the store against the live drive
//! listing:
//!
//! 1. List the drive recursively (supported MIME only).
//! 2. `New = drive \ local`, `Deleted = local \ drive`.
//! 3. Abort with `FolderCapExceeded` before any mutation if the projected
//!    row count would exceed the per-folder cap.
//! 4. Insert New as `pending`; delete Deleted (rows mid-`processing` are
//!    spared by the store guard and picked up on the next pass).
//! 5. Recompute counts; a folder whose remaining work all completed flips to
//!    `completed` inside the recompute transaction.
//! 6. New work ⇒ status `processing` and a fresh folder job; otherwise a
//!    previously `failed` or `pending` folder is re-queued, anything else
//!    keeps its status.
//!
//! Running sync twice with no drive changes is a no-op.

use chrono::Utc;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::models::{
    folder_job_id, ImageRecord, JobPayload, Status, SyncReport, FOLDER_QUEUE,
};

pub async fn sync_folder(
    ctx: &AppContext,
    folder_id: Uuid,
    credential: Option<&str>,
) -> Result<SyncReport> {
    let folder = ctx
        .store
        .get_folder(folder_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
    let prior_status = folder.status;

    let listing = ctx
        .drive
        .list_images_recursive(&folder.drive_folder_id, credential)
        .await?;

    let local = ctx.store.list_images(folder_id).await?;
    let local_ids: HashSet<&str> = local.iter().map(|i| i.drive_file_id.as_str()).collect();
    let drive_ids: HashSet<&str> = listing.files.iter().map(|f| f.id.as_str()).collect();

    let new_files: Vec<_> = listing
        .files
        .iter()
        .filter(|f| !local_ids.contains(f.id.as_str()))
        .collect();
    let deleted_ids: Vec<String> = local
        .iter()
        .filter(|i| !drive_ids.contains(i.drive_file_id.as_str()))
        .map(|i| i.drive_file_id.clone())
        .collect();

    if let Some(cap) = ctx.config.workers.folder_cap() {
        let projected = local.len() + new_files.len() - deleted_ids.len();
        if projected > cap {
            return Err(Error::FolderCapExceeded {
                found: projected,
                cap,
            });
        }
    }

    if let Some(name) = &listing.folder_name {
        if folder.name.as_deref() != Some(name) {
            ctx.store.set_folder_name(folder_id, name).await?;
        }
    }

    let new_rows: Vec<ImageRecord> = new_files
        .iter()
        .map(|f| ImageRecord::pending(folder_id, f))
        .collect();
    let added = ctx.store.create_images_bulk(&new_rows).await? as usize;
    let removed = ctx.store.delete_images(folder_id, &deleted_ids).await? as usize;

    let mut updated = ctx.store.update_folder_progress(folder_id).await?;
    ctx.progress
        .update(folder_id, updated.total_images, updated.processed_images);

    if added > 0 {
        ctx.store
            .set_folder_status(folder_id, Status::Processing)
            .await?;
        updated.status = Status::Processing;
        enqueue_folder_job(ctx, &updated.drive_folder_id, folder_id, credential).await?;
    } else if updated.status != Status::Completed
        && matches!(prior_status, Status::Failed | Status::Pending)
    {
        enqueue_folder_job(ctx, &updated.drive_folder_id, folder_id, credential).await?;
    }

    info!(
        %folder_id,
        added,
        removed,
        status = %updated.status,
        "sync pass finished"
    );

    Ok(SyncReport {
        added,
        removed,
        status: updated.status,
        total_images: updated.total_images,
        processed_images: updated.processed_images,
    })
}

async fn enqueue_folder_job(
    ctx: &AppContext,
    drive_folder_id: &str,
    folder_id: Uuid,
    credential: Option<&str>,
) -> Result<()> {
    let job_id = folder_job_id(drive_folder_id, Utc::now().timestamp_millis());
    ctx.queue
        .enqueue(
            FOLDER_QUEUE,
            &job_id,
            JobPayload::Folder {
                folder_id,
                credential: credential.map(str::to_string),
            },
        )
        .await?;
    Ok(())
}
