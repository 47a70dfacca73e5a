//! Thumbnail URL cache.
//!
//! Drive thumbnail URLs are short-lived, so the proxy endpoint resolves them
//! through this process-local cache: bounded size (≈10 000 entries), per-entry
//! TTL (≈2 h), opportunistic eviction when the cap is exceeded. On a failed
//! fetch the caller invalidates the entry and resolves again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::drive::DriveClient;
use crate::error::Result;

struct CachedUrl {
    url: String,
    inserted_at: Instant,
}

pub struct ThumbnailCache {
    entries: Mutex<HashMap<(String, u32), CachedUrl>>,
    cap: usize,
    ttl: Duration,
}

impl ThumbnailCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cap,
            ttl,
        }
    }

    /// Returns a cached URL if fresh, otherwise resolves a new one through
    /// the drive adapter and caches it.
    pub async fn url(
        &self,
        drive: &dyn DriveClient,
        file_id: &str,
        size: u32,
        credential: Option<&str>,
    ) -> Result<String> {
        let key = (file_id.to_string(), size);

        if let Some(url) = self.fresh_entry(&key) {
            return Ok(url);
        }

        let url = drive.fresh_thumbnail_url(file_id, size, credential).await?;
        self.insert(key, url.clone());
        Ok(url)
    }

    /// Drops the entry so the next lookup re-resolves; called after a fetch
    /// against the cached URL fails (the URL expired server-side).
    pub fn invalidate(&self, file_id: &str, size: u32) {
        self.entries
            .lock()
            .expect("thumb cache poisoned")
            .remove(&(file_id.to_string(), size));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("thumb cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_entry(&self, key: &(String, u32)) -> Option<String> {
        let entries = self.entries.lock().expect("thumb cache poisoned");
        entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.url.clone())
    }

    fn insert(&self, key: (String, u32), url: String) {
        let mut entries = self.entries.lock().expect("thumb cache poisoned");
        entries.insert(
            key,
            CachedUrl {
                url,
                inserted_at: Instant::now(),
            },
        );

        // Opportunistic eviction: only when over the cap, expired first.
        if entries.len() > self.cap {
            entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        }
        while entries.len() > self.cap {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::DriveListing;

    struct CountingDrive {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DriveClient for CountingDrive {
        async fn list_images_recursive(
            &self,
            _folder_id: &str,
            _credential: Option<&str>,
        ) -> Result<DriveListing> {
            unimplemented!("not used by the cache")
        }

        async fn download_bytes(
            &self,
            _file_id: &str,
            _credential: Option<&str>,
        ) -> Result<Vec<u8>> {
            unimplemented!("not used by the cache")
        }

        async fn fresh_thumbnail_url(
            &self,
            file_id: &str,
            size: u32,
            _credential: Option<&str>,
        ) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://thumbs.example/{file_id}=s{size}?gen={n}"))
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let drive = CountingDrive {
            calls: AtomicUsize::new(0),
        };
        let cache = ThumbnailCache::new(10, Duration::from_secs(60));

        let a = cache.url(&drive, "F1", 220, None).await.unwrap();
        let b = cache.url(&drive, "F1", 220, None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(drive.calls.load(Ordering::SeqCst), 1);

        // A different size is a different entry.
        cache.url(&drive, "F1", 400, None).await.unwrap();
        assert_eq!(drive.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let drive = CountingDrive {
            calls: AtomicUsize::new(0),
        };
        let cache = ThumbnailCache::new(10, Duration::from_secs(60));

        let a = cache.url(&drive, "F1", 220, None).await.unwrap();
        cache.invalidate("F1", 220);
        let b = cache.url(&drive, "F1", 220, None).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn eviction_keeps_cache_bounded() {
        let drive = CountingDrive {
            calls: AtomicUsize::new(0),
        };
        let cache = ThumbnailCache::new(3, Duration::from_secs(60));

        for i in 0..10 {
            cache
                .url(&drive, &format!("F{i}"), 220, None)
                .await
                .unwrap();
        }
        assert!(cache.len() <= 3);
    }

    #[tokio::test]
    async fn expired_entries_refresh() {
        let drive = CountingDrive {
            calls: AtomicUsize::new(0),
        };
        let cache = ThumbnailCache::new(10, Duration::ZERO);

        cache.url(&drive, "F1", 220, None).await.unwrap();
        cache.url(&drive, "F1", 220, None).await.unwrap();
        assert_eq!(drive.calls.load(Ordering::SeqCst), 2);
    }
}
