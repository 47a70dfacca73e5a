//! In-memory per-folder processing progress.
//!
//! A monitoring aid only: the persisted counters are authoritative and are
//! recomputed from row counts on every folder update. This map exists to
//! derive throughput and ETA for folders currently being worked, and is
//! rebuilt from the store at worker startup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ProgressEntry {
    pub started_at: Instant,
    pub total: i64,
    pub processed: i64,
    /// Processed count when tracking began; excluded from the rate so a
    /// resumed folder does not inherit phantom throughput.
    baseline: i64,
}

impl ProgressEntry {
    /// Estimated time to completion from the observed per-image rate.
    pub fn eta(&self) -> Option<Duration> {
        let done_here = self.processed - self.baseline;
        let remaining = self.total - self.processed;
        if done_here <= 0 || remaining <= 0 {
            return None;
        }
        let per_image = self.started_at.elapsed() / done_here as u32;
        Some(per_image * remaining as u32)
    }
}

#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<Uuid, ProgressEntry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) tracking a folder.
    pub fn begin(&self, folder_id: Uuid, total: i64, processed: i64) {
        self.entries.lock().expect("progress map poisoned").insert(
            folder_id,
            ProgressEntry {
                started_at: Instant::now(),
                total,
                processed,
                baseline: processed,
            },
        );
    }

    /// Records the latest committed counts. Begins tracking if absent so the
    /// supervisor's rebuild pass and the workers can race harmlessly.
    pub fn update(&self, folder_id: Uuid, total: i64, processed: i64) {
        let mut entries = self.entries.lock().expect("progress map poisoned");
        match entries.get_mut(&folder_id) {
            Some(entry) => {
                entry.total = total;
                entry.processed = processed;
            }
            None => {
                entries.insert(
                    folder_id,
                    ProgressEntry {
                        started_at: Instant::now(),
                        total,
                        processed,
                        baseline: processed,
                    },
                );
            }
        }
    }

    pub fn finish(&self, folder_id: Uuid) {
        self.entries
            .lock()
            .expect("progress map poisoned")
            .remove(&folder_id);
    }

    pub fn get(&self, folder_id: Uuid) -> Option<ProgressEntry> {
        self.entries
            .lock()
            .expect("progress map poisoned")
            .get(&folder_id)
            .copied()
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().expect("progress map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_needs_observed_throughput() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();

        tracker.begin(id, 10, 4);
        // No images processed since tracking began: no rate, no ETA.
        assert!(tracker.get(id).unwrap().eta().is_none());

        tracker.update(id, 10, 6);
        assert!(tracker.get(id).unwrap().eta().is_some());

        tracker.update(id, 10, 10);
        assert!(tracker.get(id).unwrap().eta().is_none());
    }

    #[test]
    fn update_without_begin_starts_tracking() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.update(id, 5, 2);
        let entry = tracker.get(id).unwrap();
        assert_eq!(entry.total, 5);
        assert_eq!(entry.processed, 2);

        tracker.finish(id);
        assert!(tracker.get(id).is_none());
        assert_eq!(tracker.active_count(), 0);
    }
}
