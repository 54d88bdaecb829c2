use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Process-wide counters backing the health/status surface. Every non-fatal
/// error path increments one of these in addition to its log entry.
#[derive(Debug, Default)]
pub struct Metrics {
    pub files_ingested: AtomicU64,
    pub files_failed: AtomicU64,
    pub chunks_written: AtomicU64,
    pub points_upserted: AtomicU64,
    pub corrupt_lines: AtomicU64,
    pub transient_retries: AtomicU64,
    pub collections_skipped: AtomicU64,
    pub cold_dropped: AtomicU64,
    pub memory_pauses: AtomicU64,
    pub cpu_throttles: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

impl Metrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "files_ingested": self.files_ingested.load(Ordering::Relaxed),
            "files_failed": self.files_failed.load(Ordering::Relaxed),
            "chunks_written": self.chunks_written.load(Ordering::Relaxed),
            "points_upserted": self.points_upserted.load(Ordering::Relaxed),
            "corrupt_lines": self.corrupt_lines.load(Ordering::Relaxed),
            "transient_retries": self.transient_retries.load(Ordering::Relaxed),
            "collections_skipped": self.collections_skipped.load(Ordering::Relaxed),
            "cold_dropped": self.cold_dropped.load(Ordering::Relaxed),
            "memory_pauses": self.memory_pauses.load(Ordering::Relaxed),
            "cpu_throttles": self.cpu_throttles.load(Ordering::Relaxed),
        })
    }
}

pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_keys() {
        let m = Metrics::default();
        incr(&m.corrupt_lines);
        add(&m.chunks_written, 5);
        let snap = m.snapshot();
        assert_eq!(snap["corrupt_lines"], 1);
        assert_eq!(snap["chunks_written"], 5);
        assert_eq!(snap["files_failed"], 0);
    }
}
