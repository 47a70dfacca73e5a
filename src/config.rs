use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration, loaded from a TOML file.
///
/// Secrets never live in the file: the drive service key is read from
/// `DRIVE_API_KEY` and the captioning key from `GEMINI_API_KEY` at adapter
/// construction time.
///
/// Limiters are process-local. Multi-process deployments must divide the
/// upstream quota statically across processes in these settings.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub caption: CaptionConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Broker connection URL. May equal `database.url`; the queue keeps its
    /// own pool either way so broker reconnects never starve store traffic.
    pub url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry backoff in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Age after which an active job without a heartbeat is declared stalled.
    #[serde(default = "default_stall_secs")]
    pub stall_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    /// Requests per minute against the drive API.
    #[serde(default = "default_drive_rpm")]
    pub max_per_minute: u32,
    /// Backed-off retries after the first download attempt.
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            max_per_minute: default_drive_rpm(),
            download_attempts: default_download_attempts(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptionConfig {
    /// Requests per minute against the captioning/embedding API.
    #[serde(default = "default_caption_rpm")]
    pub max_per_minute: u32,
    /// Short-window burst cap, requests per `burst_window_ms`.
    #[serde(default = "default_caption_burst")]
    pub burst_max: u32,
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,
    /// Embedding dimensionality; must match the deployed vector column.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_caption_model")]
    pub model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            max_per_minute: default_caption_rpm(),
            burst_max: default_caption_burst(),
            burst_window_ms: default_burst_window_ms(),
            dims: default_dims(),
            model: default_caption_model(),
            embed_model: default_embed_model(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,
    #[serde(default = "default_folder_concurrency")]
    pub folder_concurrency: usize,
    /// Per-folder image cap; 0 means unlimited.
    #[serde(default)]
    pub max_images_per_folder: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            image_concurrency: default_image_concurrency(),
            folder_concurrency: default_folder_concurrency(),
            max_images_per_folder: 0,
        }
    }
}

impl WorkersConfig {
    /// The cap as an `Option`, `None` meaning unlimited.
    pub fn folder_cap(&self) -> Option<usize> {
        (self.max_images_per_folder > 0).then_some(self.max_images_per_folder)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_entries")]
    pub cache_entries: usize,
    #[serde(default = "default_thumb_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_thumb_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_entries: default_thumb_cache_entries(),
            ttl_secs: default_thumb_ttl_secs(),
            fetch_timeout_secs: default_thumb_fetch_timeout_secs(),
        }
    }
}

impl ThumbnailConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_max_connections() -> u32 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    2_000
}
fn default_stall_secs() -> u64 {
    300
}
fn default_drive_rpm() -> u32 {
    10_000
}
fn default_download_attempts() -> u32 {
    3
}
fn default_download_timeout_secs() -> u64 {
    30
}
fn default_caption_rpm() -> u32 {
    15
}
fn default_caption_burst() -> u32 {
    5
}
fn default_burst_window_ms() -> u64 {
    1_000
}
fn default_dims() -> usize {
    768
}
fn default_caption_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-004".to_string()
}
fn default_api_timeout_secs() -> u64 {
    60
}
fn default_image_concurrency() -> usize {
    5
}
fn default_folder_concurrency() -> usize {
    5
}
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_thumb_cache_entries() -> usize {
    10_000
}
fn default_thumb_ttl_secs() -> u64 {
    7_200
}
fn default_thumb_fetch_timeout_secs() -> u64 {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.database.url.is_empty() {
        anyhow::bail!("database.url must be set");
    }
    if config.queue.url.is_empty() {
        anyhow::bail!("queue.url must be set");
    }
    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }
    if config.caption.dims == 0 {
        anyhow::bail!("caption.dims must be > 0");
    }
    if config.caption.max_per_minute == 0 || config.drive.max_per_minute == 0 {
        anyhow::bail!("limiter windows must allow at least one request per minute");
    }
    if config.workers.image_concurrency == 0 || config.workers.folder_concurrency == 0 {
        anyhow::bail!("worker concurrency must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config(
            r#"
[database]
url = "postgres://localhost/drivelens"

[queue]
url = "postgres://localhost/drivelens"
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.caption.max_per_minute, 15);
        assert_eq!(config.caption.burst_max, 5);
        assert_eq!(config.caption.dims, 768);
        assert_eq!(config.drive.max_per_minute, 10_000);
        assert_eq!(config.workers.image_concurrency, 5);
        assert_eq!(config.workers.folder_cap(), None);
        assert_eq!(config.thumbnails.cache_entries, 10_000);
        assert_eq!(config.thumbnails.ttl_secs, 7_200);
    }

    #[test]
    fn zero_dims_rejected() {
        let f = write_config(
            r#"
[database]
url = "postgres://localhost/drivelens"

[queue]
url = "postgres://localhost/drivelens"

[caption]
dims = 0
"#,
        );
        let err = load_config(f.path()).unwrap_err().to_string();
        assert!(err.contains("caption.dims"));
    }

    #[test]
    fn folder_cap_zero_means_unlimited() {
        let f = write_config(
            r#"
[database]
url = "postgres://x/d"

[queue]
url = "postgres://x/d"

[workers]
max_images_per_folder = 2
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.workers.folder_cap(), Some(2));
    }
}
