//! Shared test fixtures: scripted drive and caption adapters, a fully
//! in-memory application context, and a queue drainer that stands in for
//! the worker pool.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drivelens::app::AppContext;
use drivelens::caption::{normalize_text, CaptionProvider, Captioned};
use drivelens::config::{Config, DatabaseConfig, QueueConfig};
use drivelens::drive::DriveClient;
use drivelens::error::{Error, Result};
use drivelens::folder_worker::run_folder_job;
use drivelens::image_worker::{run_image_batch, run_single_image};
use drivelens::limiter::RateLimiter;
use drivelens::models::{DriveFile, DriveListing, JobPayload, FOLDER_QUEUE, IMAGE_QUEUE};
use drivelens::queue::memory::MemoryQueue;
use drivelens::queue::RetryPolicy;
use drivelens::store::memory::MemoryStore;
use drivelens::store::Store;

pub const TEST_DIMS: usize = 16;

/// A drive file fixture with a supported-by-default MIME type.
pub fn drive_file(id: &str, name: &str, mime: &str) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: mime.to_string(),
        thumbnail_url: Some(format!("https://thumbs.example/{id}=s220")),
        view_url: Some(format!("https://drive.google.com/file/d/{id}/view")),
        size: Some(1024),
        checksum: None,
        modified_at: None,
        version: Some("1".to_string()),
    }
}

/// Scripted drive adapter: listings are set per folder id; downloads return
/// the file id as bytes so the caption mock can key on them.
#[derive(Default)]
pub struct ScriptedDrive {
    folders: Mutex<HashMap<String, DriveListing>>,
    failing_downloads: Mutex<Vec<String>>,
}

impl ScriptedDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a folder listing. Mirrors the production adapter contract:
    /// only supported MIME types are emitted from a listing.
    pub fn set_listing(&self, folder_id: &str, name: &str, files: Vec<DriveFile>) {
        let files = files
            .into_iter()
            .filter(|f| drivelens::models::is_supported_mime(&f.mime_type))
            .collect();
        self.folders.lock().unwrap().insert(
            folder_id.to_string(),
            DriveListing {
                folder_name: Some(name.to_string()),
                files,
            },
        );
    }

    pub fn fail_download(&self, file_id: &str) {
        self.failing_downloads
            .lock()
            .unwrap()
            .push(file_id.to_string());
    }
}

#[async_trait]
impl DriveClient for ScriptedDrive {
    async fn list_images_recursive(
        &self,
        drive_folder_id: &str,
        credential: Option<&str>,
    ) -> Result<DriveListing> {
        self.folders
            .lock()
            .unwrap()
            .get(drive_folder_id)
            .cloned()
            .ok_or_else(|| {
                if credential.is_some() {
                    Error::PermissionDenied(format!(
                        "Your account does not have access to folder {drive_folder_id}."
                    ))
                } else {
                    Error::PermissionDenied(format!(
                        "folder {drive_folder_id} is not publicly accessible."
                    ))
                }
            })
    }

    async fn download_bytes(
        &self,
        drive_file_id: &str,
        _credential: Option<&str>,
    ) -> Result<Vec<u8>> {
        if self
            .failing_downloads
            .lock()
            .unwrap()
            .contains(&drive_file_id.to_string())
        {
            return Err(Error::TransientUpstream(format!(
                "download of {drive_file_id} failed"
            )));
        }
        Ok(drive_file_id.as_bytes().to_vec())
    }

    async fn fresh_thumbnail_url(
        &self,
        drive_file_id: &str,
        size: u32,
        _credential: Option<&str>,
    ) -> Result<String> {
        Ok(format!("https://thumbs.example/{drive_file_id}=s{size}"))
    }
}

/// Deterministic caption/embedding mock.
///
/// Captions are looked up by drive file id (the scripted drive returns the
/// id as the download bytes); unknown files get a generic caption. The
/// embedding is a hashed bag-of-words over the normalized text, so any
/// case/whitespace variant of a text maps to the identical vector.
pub struct MockCaptioner {
    captions: Mutex<HashMap<String, Captioned>>,
    auth_broken: AtomicBool,
}

impl MockCaptioner {
    pub fn new() -> Self {
        Self {
            captions: Mutex::new(HashMap::new()),
            auth_broken: AtomicBool::new(false),
        }
    }

    pub fn set_caption(&self, file_id: &str, caption: &str, tags: &[&str]) {
        self.captions.lock().unwrap().insert(
            file_id.to_string(),
            Captioned {
                caption: caption.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    /// Makes every caption call fail like an invalid API key.
    pub fn break_auth(&self) {
        self.auth_broken.store(true, Ordering::SeqCst);
    }

    pub fn embed_reference(text: &str) -> Vec<f32> {
        hash_embed(text)
    }
}

impl Default for MockCaptioner {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_embed(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; TEST_DIMS];
    for token in normalize_text(text)
        .split_whitespace()
        .filter(|t| t.chars().count() >= 3)
    {
        let mut h: u32 = 2166136261;
        for b in token.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        vec[(h as usize) % TEST_DIMS] += 1.0;
    }
    vec
}

#[async_trait]
impl CaptionProvider for MockCaptioner {
    async fn caption(&self, bytes: &[u8], _mime_type: &str) -> Result<Captioned> {
        if self.auth_broken.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied(
                "captioning API rejected the configured key".into(),
            ));
        }
        let file_id = String::from_utf8_lossy(bytes).to_string();
        Ok(self
            .captions
            .lock()
            .unwrap()
            .get(&file_id)
            .cloned()
            .unwrap_or_else(|| Captioned {
                caption: format!("a photo labeled {file_id}"),
                tags: vec!["photo".to_string()],
            }))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embed(text))
    }

    fn dims(&self) -> usize {
        TEST_DIMS
    }
}

/// Test context wiring: memory store/queue, scripted adapters, wide-open
/// limiters, zero retry backoff, zero stall threshold (anything
/// `processing` is immediately stale to the supervisor).
pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub drive: Arc<ScriptedDrive>,
    pub captioner: Arc<MockCaptioner>,
}

pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            url: "postgres://unused-in-tests".to_string(),
            max_connections: 1,
        },
        queue: QueueConfig {
            url: "postgres://unused-in-tests".to_string(),
            max_attempts: 3,
            backoff_ms: 0,
            stall_secs: 0,
        },
        drive: Default::default(),
        caption: Default::default(),
        workers: Default::default(),
        server: Default::default(),
        thumbnails: Default::default(),
    }
}

pub fn harness() -> TestHarness {
    harness_with(test_config(), Arc::new(MemoryStore::new()))
}

pub fn harness_with(config: Config, store: Arc<dyn Store>) -> TestHarness {
    let drive = Arc::new(ScriptedDrive::new());
    let captioner = Arc::new(MockCaptioner::new());
    let queue = Arc::new(MemoryQueue::with_policy(RetryPolicy {
        max_attempts: config.queue.max_attempts,
        initial_backoff: Duration::from_millis(config.queue.backoff_ms),
    }));

    let ctx = AppContext::assemble(
        config,
        store,
        queue,
        drive.clone(),
        captioner.clone(),
        Arc::new(RateLimiter::new(1_000_000, Duration::from_secs(60))),
        Arc::new(RateLimiter::new(1_000_000, Duration::from_secs(60))),
    );

    TestHarness {
        ctx,
        drive,
        captioner,
    }
}

/// Drains both queues to quiescence, standing in for the worker pool.
pub async fn drain(ctx: &AppContext) {
    loop {
        let mut worked = false;

        while let Some(job) = ctx.queue.dequeue(FOLDER_QUEUE).await.unwrap() {
            worked = true;
            let result = match &job.payload {
                JobPayload::Folder {
                    folder_id,
                    credential,
                } => run_folder_job(ctx, *folder_id, credential.as_deref()).await,
                other => panic!("unexpected payload on folder queue: {other:?}"),
            };
            finish(ctx, &job.job_id, result).await;
        }

        while let Some(job) = ctx.queue.dequeue(IMAGE_QUEUE).await.unwrap() {
            worked = true;
            let result = match &job.payload {
                JobPayload::ImageBatch {
                    image_ids,
                    credential,
                    ..
                } => run_image_batch(ctx, image_ids, credential.as_deref())
                    .await
                    .map(|_| ()),
                JobPayload::Image {
                    image_id,
                    credential,
                } => run_single_image(ctx, *image_id, credential.as_deref()).await,
                other => panic!("unexpected payload on image queue: {other:?}"),
            };
            finish(ctx, &job.job_id, result).await;
        }

        if !worked {
            break;
        }
    }
}

async fn finish(ctx: &AppContext, job_id: &str, result: Result<()>) {
    match result {
        Ok(()) => ctx.queue.complete(job_id).await.unwrap(),
        Err(e) => ctx.queue.fail(job_id, &e.to_string()).await.unwrap(),
    }
}
