//! Postgres-backed store.
//!
//! Vectors live in a `vector(D)` column (pgvector) on the `images` table.
//! The base migration creates the column as TEXT so the schema is uniform on
//! deployments without the extension; [`PgStore::ensure_vector_infra`]
//! upgrades the column type and provisions the HNSW cosine index where the
//! extension exists, and reports `VectorBackendUnavailable` where it does
//! not. In the unavailable state completed rows persist caption and tags and
//! leave the vector NULL.
//!
//! Vector writes go through a parameterized cast of a serialized literal
//! (`$n::vector`); reads select `caption_vec::text`. Neither form leaks past
//! the store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FolderRecord, ImageRecord, Status, StatusCounts, UserRecord};

use super::{
    vector_literal, FilenameHit, MatchTier, ResetScope, SimilarityHit, Store,
};

/// Column list shared by every image SELECT/RETURNING. The vector column is
/// read through its text cast.
const IMAGE_COLS: &str = "id, drive_file_id, folder_id, name, mime_type, thumbnail_url, \
     view_url, size, checksum, modified_at, version, status, caption, tags, \
     caption_vec::text AS caption_vec, error, created_at, updated_at";

const FOLDER_COLS: &str = "id, drive_folder_id, name, origin_url, user_id, status, \
     total_images, processed_images, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
    dims: usize,
    /// Memoized outcome of vector provisioning; `Err` carries the reason.
    vector_state: OnceCell<std::result::Result<(), String>>,
}

impl PgStore {
    pub fn new(pool: PgPool, dims: usize) -> Self {
        Self {
            pool,
            dims,
            vector_state: OnceCell::new(),
        }
    }

    async fn provision_vector(&self) -> std::result::Result<(), String> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("vector extension unavailable: {e}"))?;

        // Upgrade the TEXT placeholder column in place, once.
        let udt: Option<String> = sqlx::query_scalar(
            "SELECT udt_name FROM information_schema.columns \
             WHERE table_name = 'images' AND column_name = 'caption_vec'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if udt.as_deref() != Some("vector") {
            sqlx::query(&format!(
                "ALTER TABLE images ALTER COLUMN caption_vec TYPE vector({}) \
                 USING NULLIF(caption_vec, '')::vector({})",
                self.dims, self.dims
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| format!("vector column upgrade failed: {e}"))?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_images_caption_vec_hnsw \
             ON images USING hnsw (caption_vec vector_cosine_ops) \
             WITH (m = 16, ef_construction = 64)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("vector index creation failed: {e}"))?;

        Ok(())
    }
}

fn folder_from_row(row: &PgRow) -> Result<FolderRecord> {
    let status: String = row.get("status");
    Ok(FolderRecord {
        id: row.get("id"),
        drive_folder_id: row.get("drive_folder_id"),
        name: row.get("name"),
        origin_url: row.get("origin_url"),
        user_id: row.get("user_id"),
        status: status
            .parse()
            .map_err(|e: String| Error::StoreUnavailable(e))?,
        total_images: row.get("total_images"),
        processed_images: row.get("processed_images"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord> {
    let status: String = row.get("status");
    let vec_text: Option<String> = row.get("caption_vec");
    Ok(ImageRecord {
        id: row.get("id"),
        drive_file_id: row.get("drive_file_id"),
        folder_id: row.get("folder_id"),
        name: row.get("name"),
        mime_type: row.get("mime_type"),
        thumbnail_url: row.get("thumbnail_url"),
        view_url: row.get("view_url"),
        size: row.get("size"),
        checksum: row.get("checksum"),
        modified_at: row.get("modified_at"),
        version: row.get("version"),
        status: status
            .parse()
            .map_err(|e: String| Error::StoreUnavailable(e))?,
        caption: row.get("caption"),
        tags: row.get("tags"),
        caption_vec: vec_text
            .filter(|t| !t.is_empty())
            .map(|t| super::parse_vector_literal(&t)),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Escapes LIKE metacharacters so user queries match literally.
fn escape_like(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_vector_infra(&self) -> Result<()> {
        let state = self
            .vector_state
            .get_or_init(|| async { self.provision_vector().await })
            .await;
        state
            .clone()
            .map_err(Error::VectorBackendUnavailable)
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<FolderRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO folders (id, drive_folder_id, name, origin_url, user_id, status,
                                 total_images, processed_images, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (drive_folder_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, folders.name),
                origin_url = EXCLUDED.origin_url,
                updated_at = EXCLUDED.updated_at
            RETURNING {FOLDER_COLS}
            "#
        ))
        .bind(folder.id)
        .bind(&folder.drive_folder_id)
        .bind(&folder.name)
        .bind(&folder.origin_url)
        .bind(folder.user_id)
        .bind(folder.status.to_string())
        .bind(folder.total_images)
        .bind(folder.processed_images)
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .fetch_one(&self.pool)
        .await?;

        folder_from_row(&row)
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<FolderRecord>> {
        let row = sqlx::query(&format!("SELECT {FOLDER_COLS} FROM folders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn get_folder_by_drive_id(
        &self,
        drive_folder_id: &str,
    ) -> Result<Option<FolderRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {FOLDER_COLS} FROM folders WHERE drive_folder_id = $1"
        ))
        .bind(drive_folder_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn link_folder_user(&self, folder_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE folders SET user_id = $2, updated_at = NOW() \
             WHERE id = $1 AND user_id IS NULL",
        )
        .bind(folder_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_folder_status(&self, folder_id: Uuid, status: Status) -> Result<()> {
        sqlx::query("UPDATE folders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(folder_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_folder_name(&self, folder_id: Uuid, name: &str) -> Result<()> {
        sqlx::query("UPDATE folders SET name = $2, updated_at = NOW() WHERE id = $1")
            .bind(folder_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_folder_progress(&self, folder_id: Uuid) -> Result<FolderRecord> {
        let mut tx = self.pool.begin().await?;

        let (total, processed): (i64, i64) = {
            let row = sqlx::query(
                "SELECT COUNT(*) AS total, \
                        COUNT(*) FILTER (WHERE status = 'completed') AS completed \
                 FROM images WHERE folder_id = $1",
            )
            .bind(folder_id)
            .fetch_one(&mut *tx)
            .await?;
            (row.get("total"), row.get("completed"))
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE folders SET
                total_images = $2,
                processed_images = $3,
                status = CASE
                    WHEN $2 > 0 AND $3 = $2 THEN 'completed'
                    WHEN status = 'completed' THEN 'processing'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {FOLDER_COLS}
            "#
        ))
        .bind(folder_id)
        .bind(total)
        .bind(processed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        folder_from_row(&row)
    }

    async fn list_folders(&self, status: Option<Status>) -> Result<Vec<FolderRecord>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {FOLDER_COLS} FROM folders WHERE status = $1 ORDER BY created_at"
                ))
                .bind(s.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {FOLDER_COLS} FROM folders ORDER BY created_at"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(folder_from_row).collect()
    }

    async fn folders_with_pending_images(&self) -> Result<Vec<FolderRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLDER_COLS} FROM folders \
             WHERE id IN (SELECT DISTINCT folder_id FROM images WHERE status = 'pending')"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    async fn create_images_bulk(&self, images: &[ImageRecord]) -> Result<u64> {
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;

        for image in images {
            let result = sqlx::query(
                r#"
                INSERT INTO images (id, drive_file_id, folder_id, name, mime_type,
                                    thumbnail_url, view_url, size, checksum, modified_at,
                                    version, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (drive_file_id) DO NOTHING
                "#,
            )
            .bind(image.id)
            .bind(&image.drive_file_id)
            .bind(image.folder_id)
            .bind(&image.name)
            .bind(&image.mime_type)
            .bind(&image.thumbnail_url)
            .bind(&image.view_url)
            .bind(image.size)
            .bind(&image.checksum)
            .bind(image.modified_at)
            .bind(&image.version)
            .bind(image.status.to_string())
            .bind(image.created_at)
            .bind(image.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_image(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query(&format!("SELECT {IMAGE_COLS} FROM images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(image_from_row).transpose()
    }

    async fn list_images(&self, folder_id: Uuid) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLS} FROM images WHERE folder_id = $1 ORDER BY lower(name)"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn list_pending_images(
        &self,
        folder_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLS} FROM images \
             WHERE folder_id = $1 AND status = 'pending' \
             ORDER BY created_at LIMIT $2"
        ))
        .bind(folder_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn count_images_by_status(&self, folder_id: Uuid) -> Result<StatusCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                    COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM images WHERE folder_id = $1",
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(StatusCounts {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    async fn set_image_processing(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE images SET status = 'processing', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_image_completed(
        &self,
        id: Uuid,
        caption: &str,
        tags: &str,
        vector: &[f32],
    ) -> Result<()> {
        // Provision on demand so a fresh worker process writes vectors from
        // its first completion; memoization makes this free afterwards.
        let vector_ok = self.ensure_vector_infra().await.is_ok();
        if vector_ok {
            sqlx::query(
                "UPDATE images SET status = 'completed', caption = $2, tags = $3, \
                 caption_vec = $4::vector, error = NULL, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(caption)
            .bind(tags)
            .bind(vector_literal(vector))
            .execute(&self.pool)
            .await?;
        } else {
            // Degraded mode: caption and tags persist, the vector stays NULL.
            sqlx::query(
                "UPDATE images SET status = 'completed', caption = $2, tags = $3, \
                 error = NULL, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(caption)
            .bind(tags)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn set_image_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE images SET status = 'failed', error = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_images_to_pending(&self, scope: ResetScope) -> Result<Vec<ImageRecord>> {
        let reset_set = "status = 'pending', caption = NULL, tags = NULL, \
                         caption_vec = NULL, error = NULL, updated_at = NOW()";
        let rows = match scope {
            ResetScope::Image(id) => {
                sqlx::query(&format!(
                    "UPDATE images SET {reset_set} WHERE id = $1 RETURNING {IMAGE_COLS}"
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            ResetScope::Images(ids) => {
                sqlx::query(&format!(
                    "UPDATE images SET {reset_set} WHERE id = ANY($1) RETURNING {IMAGE_COLS}"
                ))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            ResetScope::FolderRetryable(folder_id) => {
                sqlx::query(&format!(
                    "UPDATE images SET {reset_set} \
                     WHERE folder_id = $1 AND status IN ('failed', 'pending') \
                     RETURNING {IMAGE_COLS}"
                ))
                .bind(folder_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(image_from_row).collect()
    }

    async fn delete_images(&self, folder_id: Uuid, drive_file_ids: &[String]) -> Result<u64> {
        if drive_file_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM images \
             WHERE folder_id = $1 AND drive_file_id = ANY($2) AND status != 'processing'",
        )
        .bind(folder_id)
        .bind(drive_file_ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stuck_processing_images(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLS} FROM images \
             WHERE status = 'processing' AND updated_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn search_by_filename(
        &self,
        folder_id: Uuid,
        pattern: &str,
        limit: i64,
    ) -> Result<Vec<FilenameHit>> {
        let escaped = escape_like(pattern);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {IMAGE_COLS},
                CASE
                    WHEN lower(name) = lower($2) THEN 0
                    WHEN lower(name) LIKE lower($3) || '%' ESCAPE '\' THEN 1
                    ELSE 2
                END AS tier
            FROM images
            WHERE folder_id = $1 AND name ILIKE '%' || $3 || '%' ESCAPE '\'
            ORDER BY tier ASC, lower(name) ASC
            LIMIT $4
            "#
        ))
        .bind(folder_id)
        .bind(pattern)
        .bind(&escaped)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let tier: i32 = row.get("tier");
                Ok(FilenameHit {
                    image: image_from_row(row)?,
                    tier: match tier {
                        0 => MatchTier::Exact,
                        1 => MatchTier::Prefix,
                        _ => MatchTier::Contains,
                    },
                })
            })
            .collect()
    }

    async fn search_by_similarity(
        &self,
        folder_id: Uuid,
        query_vec: &[f32],
        limit: i64,
    ) -> Result<Vec<SimilarityHit>> {
        self.ensure_vector_infra().await?;

        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLS}, (caption_vec <=> $2::vector)::float4 AS distance \
             FROM images \
             WHERE folder_id = $1 AND status = 'completed' AND caption_vec IS NOT NULL \
             ORDER BY caption_vec <=> $2::vector ASC \
             LIMIT $3"
        ))
        .bind(folder_id)
        .bind(vector_literal(query_vec))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SimilarityHit {
                    image: image_from_row(row)?,
                    distance: row.get("distance"),
                })
            })
            .collect()
    }

    async fn upsert_user(&self, auth_id: &str, email: Option<&str>) -> Result<UserRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, auth_id, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (auth_id) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, users.email)
            RETURNING id, auth_id, email
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(auth_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserRecord {
            id: row.get("id"),
            auth_id: row.get("auth_id"),
            email: row.get("email"),
        })
    }

    async fn record_scan_receipt(&self, user_id: Uuid, drive_folder_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_receipts (user_id, drive_folder_id, scanned_at, deleted)
            VALUES ($1, $2, NOW(), FALSE)
            ON CONFLICT (user_id, drive_folder_id) DO UPDATE SET
                scanned_at = NOW(), deleted = FALSE
            "#,
        )
        .bind(user_id)
        .bind(drive_folder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
