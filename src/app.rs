//! Composition root.
//!
//! Builds every shared component exactly once — store, queue, drive adapter,
//! caption adapter, the two rate limiters, progress tracker, thumbnail
//! cache — and hands them out behind `Arc`s. The limiters ARE the shared
//! quota accounting, so nothing outside this module may construct one; tests
//! assemble an [`AppContext`] from their own deterministic parts via
//! [`AppContext::assemble`].

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::caption::{CaptionProvider, GeminiCaptioner};
use crate::config::Config;
use crate::db;
use crate::drive::{DriveClient, HttpDriveClient};
use crate::limiter::RateLimiter;
use crate::progress::ProgressTracker;
use crate::queue::postgres::PgQueue;
use crate::queue::{Queue, RetryPolicy};
use crate::store::postgres::PgStore;
use crate::store::Store;
use crate::thumbs::ThumbnailCache;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub drive: Arc<dyn DriveClient>,
    pub captioner: Arc<dyn CaptionProvider>,
    pub caption_limiter: Arc<RateLimiter>,
    pub drive_limiter: Arc<RateLimiter>,
    pub progress: Arc<ProgressTracker>,
    pub thumbs: Arc<ThumbnailCache>,
}

impl AppContext {
    /// Production wiring: Postgres store and queue, HTTP drive and caption
    /// adapters, limiters from config. Secrets come from the environment
    /// (`DRIVE_API_KEY` optional, `GEMINI_API_KEY` required).
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let pool = db::connect(&config).await?;
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool, config.caption.dims));

        let policy = RetryPolicy {
            max_attempts: config.queue.max_attempts,
            initial_backoff: Duration::from_millis(config.queue.backoff_ms),
        };
        let queue = PgQueue::connect(&config.queue.url, policy).await?;
        queue.migrate().await?;
        let queue: Arc<dyn Queue> = Arc::new(queue);

        let drive_limiter = Arc::new(RateLimiter::per_minute(
            config.drive.max_per_minute as usize,
        ));
        let caption_limiter = Arc::new(
            RateLimiter::per_minute(config.caption.max_per_minute as usize).with_burst(
                config.caption.burst_max as usize,
                Duration::from_millis(config.caption.burst_window_ms),
            ),
        );

        let drive: Arc<dyn DriveClient> = Arc::new(HttpDriveClient::new(
            std::env::var("DRIVE_API_KEY").ok(),
            drive_limiter.clone(),
            config.drive.clone(),
        ));
        let captioner: Arc<dyn CaptionProvider> =
            Arc::new(GeminiCaptioner::from_env(config.caption.clone())?);

        Ok(Self::assemble(
            config,
            store,
            queue,
            drive,
            captioner,
            caption_limiter,
            drive_limiter,
        ))
    }

    /// Assembles a context from pre-built parts. Used by [`build`](Self::build)
    /// and by the test suite, which injects in-memory backends and scripted
    /// adapters.
    pub fn assemble(
        config: Config,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        drive: Arc<dyn DriveClient>,
        captioner: Arc<dyn CaptionProvider>,
        caption_limiter: Arc<RateLimiter>,
        drive_limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let thumbs = Arc::new(ThumbnailCache::new(
            config.thumbnails.cache_entries,
            config.thumbnails.ttl(),
        ));
        Arc::new(Self {
            config,
            store,
            queue,
            drive,
            captioner,
            caption_limiter,
            drive_limiter,
            progress: Arc::new(ProgressTracker::new()),
            thumbs,
        })
    }

    /// Age threshold after which processing rows and active jobs count as
    /// stalled.
    pub fn stall_cutoff(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() - chrono::Duration::seconds(self.config.queue.stall_secs as i64)
    }
}
