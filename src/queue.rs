//! Freshness classification and the bounded ingest queue.
//!
//! Files are classified by modification age so a conversation the user is in
//! right now is embedded within seconds, while month-old backlog drains a few
//! files per cycle. A WARM file that has waited past `max_warm_wait` is
//! promoted to URGENT_WARM so backlog can never starve it.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Config;
use crate::metrics::{incr, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessLevel {
    Hot,
    UrgentWarm,
    Warm,
    Cold,
}

impl FreshnessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessLevel::Hot => "hot",
            FreshnessLevel::UrgentWarm => "urgent_warm",
            FreshnessLevel::Warm => "warm",
            FreshnessLevel::Cold => "cold",
        }
    }

    pub fn is_hot_or_urgent(&self) -> bool {
        matches!(self, FreshnessLevel::Hot | FreshnessLevel::UrgentWarm)
    }
}

/// Classify a file given its mtime and when it first entered scheduling.
/// Lower priority numbers pop first; within WARM/COLD the mtime term keeps
/// older files ahead (FIFO), within HOT it keeps the freshest first.
pub fn classify(
    mtime_epoch_s: i64,
    now_epoch_s: i64,
    first_seen_epoch_s: Option<i64>,
    config: &Config,
) -> (FreshnessLevel, i64) {
    let age_s = (now_epoch_s - mtime_epoch_s).max(0);
    let k = mtime_epoch_s;

    let hot_window_s = config.hot_window_minutes as i64 * 60;
    let warm_window_s = config.warm_window_hours as i64 * 3600;
    let max_warm_wait_s = config.max_warm_wait_minutes as i64 * 60;

    if age_s <= hot_window_s {
        return (FreshnessLevel::Hot, 100 - k);
    }

    if age_s <= warm_window_s {
        let waited = first_seen_epoch_s
            .map(|seen| now_epoch_s - seen)
            .unwrap_or(0);
        if waited > max_warm_wait_s {
            return (FreshnessLevel::UrgentWarm, 10_000 - k);
        }
        return (FreshnessLevel::Warm, 20_000 + k);
    }

    (FreshnessLevel::Cold, 40_000 + k)
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub queue_size: usize,
    pub hot: usize,
    pub urgent_warm: usize,
    pub warm: usize,
    pub cold: usize,
}

#[derive(Default)]
struct QueueInner {
    /// Priority-ordered entries; the path in the key breaks priority ties.
    entries: BTreeMap<(i64, PathBuf), FreshnessLevel>,
    queued: HashSet<PathBuf>,
}

impl QueueInner {
    fn count(&self, level: FreshnessLevel) -> usize {
        self.entries.values().filter(|l| **l == level).count()
    }

    /// Remove the lowest-urgency COLD entry, if one exists.
    fn evict_one_cold(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, level)| **level == FreshnessLevel::Cold)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.queued.remove(&key.1);
            true
        } else {
            false
        }
    }
}

/// Bounded, de-duplicating priority queue of files awaiting ingestion.
pub struct IngestQueue {
    inner: Mutex<QueueInner>,
    max_size: usize,
}

impl IngestQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_size,
        }
    }

    /// Enqueue classified files. Re-enqueueing a queued path is a no-op. At
    /// most `max_cold` COLD entries are admitted per call; when the queue is
    /// full, COLD arrivals are dropped and HOT/URGENT_WARM arrivals evict a
    /// queued COLD instead. Returns how many entries were admitted.
    pub fn add_categorized(
        &self,
        items: &[(PathBuf, FreshnessLevel, i64)],
        max_cold: usize,
    ) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0usize;
        let mut cold_admitted = 0usize;

        for (path, level, priority) in items {
            if inner.queued.contains(path) {
                continue;
            }

            if *level == FreshnessLevel::Cold {
                if cold_admitted >= max_cold || inner.entries.len() >= self.max_size {
                    incr(&metrics().cold_dropped);
                    continue;
                }
                cold_admitted += 1;
            } else if inner.entries.len() >= self.max_size {
                // Full queue never turns away fresh work; backlog pays.
                if !inner.evict_one_cold() {
                    if level.is_hot_or_urgent() {
                        tracing::warn!(path = %path.display(), "queue full with no COLD to evict; dropping entry");
                    }
                    continue;
                }
                incr(&metrics().cold_dropped);
            }

            inner.entries.insert((*priority, path.clone()), *level);
            inner.queued.insert(path.clone());
            added += 1;
        }

        added
    }

    /// Pop up to `n` entries in ascending priority order.
    pub fn get_batch(&self, n: usize) -> Vec<(PathBuf, FreshnessLevel)> {
        let mut inner = self.inner.lock();
        let keys: Vec<(i64, PathBuf)> = inner.entries.keys().take(n).cloned().collect();
        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(level) = inner.entries.remove(&key) {
                inner.queued.remove(&key.1);
                batch.push((key.1, level));
            }
        }
        batch
    }

    pub fn has_hot_or_urgent(&self) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|level| level.is_hot_or_urgent())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock();
        QueueMetrics {
            queue_size: inner.entries.len(),
            hot: inner.count(FreshnessLevel::Hot),
            urgent_warm: inner.count(FreshnessLevel::UrgentWarm),
            warm: inner.count(FreshnessLevel::Warm),
            cold: inner.count(FreshnessLevel::Cold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_env()
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_classification_windows() {
        let cfg = config();
        let (hot, _) = classify(NOW - 120, NOW, None, &cfg); // 2 min
        let (warm, _) = classify(NOW - 7200, NOW, None, &cfg); // 2 h
        let (cold, _) = classify(NOW - 90_000, NOW, None, &cfg); // 25 h
        assert_eq!(hot, FreshnessLevel::Hot);
        assert_eq!(warm, FreshnessLevel::Warm);
        assert_eq!(cold, FreshnessLevel::Cold);
    }

    #[test]
    fn test_priority_ordering_across_levels() {
        let cfg = config();
        let (_, hot_p) = classify(NOW - 120, NOW, None, &cfg);
        let (_, warm_p) = classify(NOW - 7200, NOW, None, &cfg);
        let (_, cold_p) = classify(NOW - 90_000, NOW, None, &cfg);
        assert!(hot_p < warm_p);
        assert!(warm_p < cold_p);
    }

    #[test]
    fn test_warm_promotes_to_urgent_after_wait() {
        let cfg = config();
        let mtime = NOW - 7200;
        let (level1, p1) = classify(mtime, NOW, Some(NOW - 60), &cfg);
        assert_eq!(level1, FreshnessLevel::Warm);
        let (level2, p2) = classify(mtime, NOW, Some(NOW - 35 * 60), &cfg);
        assert_eq!(level2, FreshnessLevel::UrgentWarm);
        assert!(p2 < p1);
    }

    #[test]
    fn test_warm_fifo_by_mtime() {
        let cfg = config();
        let (_, older) = classify(NOW - 7200, NOW, None, &cfg);
        let (_, newer) = classify(NOW - 3600, NOW, None, &cfg);
        assert!(older < newer);
    }

    #[test]
    fn test_get_batch_priority_order() {
        let cfg = config();
        let queue = IngestQueue::new(10);
        let items: Vec<(PathBuf, FreshnessLevel, i64)> = [
            ("/cold.jsonl", NOW - 108_000),
            ("/warm.jsonl", NOW - 7200),
            ("/hot.jsonl", NOW - 120),
        ]
        .iter()
        .map(|(p, mtime)| {
            let (level, priority) = classify(*mtime, NOW, None, &cfg);
            (PathBuf::from(p), level, priority)
        })
        .collect();

        assert_eq!(queue.add_categorized(&items, 3), 3);

        let batch = queue.get_batch(10);
        let names: Vec<&str> = batch
            .iter()
            .map(|(p, _)| p.to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["/hot.jsonl", "/warm.jsonl", "/cold.jsonl"]);
    }

    #[test]
    fn test_hot_pops_before_backlog() {
        let cfg = config();
        let queue = IngestQueue::new(100);
        let mut items = Vec::new();
        for i in 0..20 {
            let (level, priority) = classify(NOW - 100_000 - i, NOW, None, &cfg);
            items.push((PathBuf::from(format!("/cold{i}.jsonl")), level, priority));
        }
        let (level, priority) = classify(NOW - 60, NOW, None, &cfg);
        items.push((PathBuf::from("/hot.jsonl"), level, priority));

        queue.add_categorized(&items, 20);
        let first = queue.get_batch(1);
        assert_eq!(first[0].0, PathBuf::from("/hot.jsonl"));
        assert!(first[0].1.is_hot_or_urgent());
    }

    #[test]
    fn test_duplicate_enqueue_is_noop() {
        let cfg = config();
        let queue = IngestQueue::new(10);
        let (level, priority) = classify(NOW - 60, NOW, None, &cfg);
        let items = vec![(PathBuf::from("/a.jsonl"), level, priority)];
        assert_eq!(queue.add_categorized(&items, 3), 1);
        assert_eq!(queue.add_categorized(&items, 3), 0);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_cold_cap_per_cycle() {
        let cfg = config();
        let queue = IngestQueue::new(100);
        let items: Vec<_> = (0..10)
            .map(|i| {
                let (level, priority) = classify(NOW - 100_000 - i, NOW, None, &cfg);
                (PathBuf::from(format!("/c{i}.jsonl")), level, priority)
            })
            .collect();
        assert_eq!(queue.add_categorized(&items, 3), 3);
        assert_eq!(queue.metrics().cold, 3);
    }

    #[test]
    fn test_full_queue_evicts_cold_for_hot() {
        let cfg = config();
        let queue = IngestQueue::new(3);
        let items: Vec<_> = (0..3)
            .map(|i| {
                let (level, priority) = classify(NOW - 100_000 - i, NOW, None, &cfg);
                (PathBuf::from(format!("/c{i}.jsonl")), level, priority)
            })
            .collect();
        queue.add_categorized(&items, 3);
        assert_eq!(queue.len(), 3);

        let (level, priority) = classify(NOW - 60, NOW, None, &cfg);
        let hot = vec![(PathBuf::from("/hot.jsonl"), level, priority)];
        assert_eq!(queue.add_categorized(&hot, 3), 1);
        assert_eq!(queue.len(), 3);
        assert!(queue.has_hot_or_urgent());
        assert_eq!(queue.metrics().cold, 2);
    }

    #[test]
    fn test_full_queue_rejects_cold() {
        let cfg = config();
        let queue = IngestQueue::new(2);
        let items: Vec<_> = (0..2)
            .map(|i| {
                let (level, priority) = classify(NOW - 3600 - i, NOW, None, &cfg);
                (PathBuf::from(format!("/w{i}.jsonl")), level, priority)
            })
            .collect();
        queue.add_categorized(&items, 3);

        let (level, priority) = classify(NOW - 100_000, NOW, None, &cfg);
        let cold = vec![(PathBuf::from("/cold.jsonl"), level, priority)];
        assert_eq!(queue.add_categorized(&cold, 3), 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_has_hot_or_urgent_flag() {
        let cfg = config();
        let queue = IngestQueue::new(10);
        assert!(!queue.has_hot_or_urgent());
        let (level, priority) = classify(NOW - 7200, NOW, None, &cfg);
        queue.add_categorized(&[(PathBuf::from("/w.jsonl"), level, priority)], 3);
        assert!(!queue.has_hot_or_urgent());
        let (level, priority) = classify(NOW - 30, NOW, None, &cfg);
        queue.add_categorized(&[(PathBuf::from("/h.jsonl"), level, priority)], 3);
        assert!(queue.has_hot_or_urgent());
    }
}
