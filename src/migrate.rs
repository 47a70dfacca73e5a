//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Designed to
//! run via `drivelens init` (and safe to run on every deploy).
//!
//! # Schema
//!
//! ```text
//! ┌───────────────┐      ┌────────────────┐     ┌───────────────┐
//! │    folders    │──┐   │     images     │     │     users     │
//! │               │  │   │                │     │               │
//! │ id (PK)       │  │   │ id (PK)        │     │ id (PK)       │
//! │ drive_folder_ │  └───│ folder_id (FK) │     │ auth_id (UQ)  │
//! │   id (UQ)     │      │ drive_file_id  │     │ email         │
//! │ name          │      │   (UQ)         │     └───────────────┘
//! │ origin_url    │      │ name, mime     │
//! │ user_id       │      │ thumbnail_url  │     ┌───────────────┐
//! │ status        │      │ view_url       │     │ scan_receipts │
//! │ total_images  │      │ size, checksum │     │               │
//! │ processed_    │      │ modified_at    │     │ user_id    ┐PK│
//! │   images      │      │ version        │     │ drive_     ┘  │
//! │ created_at    │      │ status         │     │   folder_id   │
//! │ updated_at    │      │ caption, tags  │     │ scanned_at    │
//! └───────────────┘      │ caption_vec    │     │ deleted       │
//!                        │ error          │     └───────────────┘
//!                        │ created_at     │
//!                        │ updated_at     │     (jobs table: see queue)
//!                        └────────────────┘
//! ```
//!
//! # Vector column
//!
//! `images.caption_vec` is created as TEXT so the base schema works on every
//! deployment; the store's `ensure_vector_infra` upgrades it to `vector(D)`
//! and adds the HNSW cosine index where pgvector is installed. Provisioning
//! is attempted here as a best effort — an unavailable extension is logged,
//! never fatal, and search degrades at runtime instead.
//!
//! # Idempotency
//!
//! Every statement is `IF NOT EXISTS`-style; running migrations repeatedly
//! is safe.

use anyhow::Result;
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::queue::postgres::PgQueue;
use crate::queue::RetryPolicy;
use crate::store::postgres::PgStore;
use crate::store::Store;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            auth_id TEXT NOT NULL UNIQUE,
            email TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS folders (
            id UUID PRIMARY KEY,
            drive_folder_id TEXT NOT NULL UNIQUE,
            name TEXT,
            origin_url TEXT NOT NULL,
            user_id UUID REFERENCES users(id) ON DELETE SET NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            total_images BIGINT NOT NULL DEFAULT 0,
            processed_images BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id UUID PRIMARY KEY,
            drive_file_id TEXT NOT NULL UNIQUE,
            folder_id UUID NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            thumbnail_url TEXT,
            view_url TEXT,
            size BIGINT,
            checksum TEXT,
            modified_at TIMESTAMPTZ,
            version TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            caption TEXT,
            tags TEXT,
            caption_vec TEXT,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_receipts (
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            drive_folder_id TEXT NOT NULL,
            scanned_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (user_id, drive_folder_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_folder_id ON images(folder_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_images_folder_status ON images(folder_id, status)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_images_status_updated ON images(status, updated_at)",
    )
    .execute(&pool)
    .await?;

    // Queue storage lives beside the corpus when the URLs match, but has its
    // own migration either way.
    let queue = PgQueue::connect(
        &config.queue.url,
        RetryPolicy {
            max_attempts: config.queue.max_attempts,
            initial_backoff: std::time::Duration::from_millis(config.queue.backoff_ms),
        },
    )
    .await?;
    queue.migrate().await?;

    // Best-effort vector provisioning; deployments without pgvector keep
    // working with search degraded to the lexical path.
    let store = PgStore::new(pool.clone(), config.caption.dims);
    if let Err(e) = store.ensure_vector_infra().await {
        warn!(error = %e, "vector infrastructure not provisioned");
    }

    pool.close().await;
    Ok(())
}
