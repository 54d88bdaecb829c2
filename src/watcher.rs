//! The watcher supervisor loop.
//!
//! Each cycle scans the log root, classifies files by freshness, feeds the
//! bounded queue, and drains a batch through per-file ingest pipelines with
//! bounded parallelism. The tick adapts: seconds while anything HOT or
//! URGENT_WARM is queued, the normal import frequency otherwise. Shutdown
//! stops admitting work, drains in-flight pipelines within the grace period,
//! and leaves the committed state ready for the next run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use dashmap::DashMap;
use ignore::WalkBuilder;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::governor::MemoryMonitor;
use crate::ingester::{IngestOutcome, Ingester};
use crate::metrics::{incr, metrics};
use crate::queue::{classify, FreshnessLevel, IngestQueue};
use crate::state::StateStore;

pub struct Watcher {
    config: Arc<Config>,
    queue: Arc<IngestQueue>,
    ingester: Arc<Ingester>,
    state: Arc<StateStore>,
    memory: Arc<MemoryMonitor>,
    /// Epoch seconds at which each path first entered scheduling; drives
    /// WARM → URGENT_WARM promotion.
    first_seen: DashMap<PathBuf, i64>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<IngestQueue>,
        ingester: Arc<Ingester>,
        state: Arc<StateStore>,
        memory: Arc<MemoryMonitor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            queue,
            ingester,
            state,
            memory,
            first_seen: DashMap::new(),
            shutdown_rx,
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let parallelism = self
            .config
            .parallelism_for(self.ingester.provider().suffix());
        let semaphore = Arc::new(Semaphore::new(parallelism));

        info!(
            logs_dir = %self.config.logs_dir.display(),
            parallelism,
            import_frequency_s = self.config.import_frequency_s,
            "watcher started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.scan_and_enqueue();

            let batch = self.queue.get_batch(self.config.batch_size);
            if !batch.is_empty() {
                match self.ingest_batch(batch, semaphore.clone()).await? {
                    BatchResult::Drained => {}
                    BatchResult::ShutDown => break,
                }
            }

            let tick = if self.queue.has_hot_or_urgent() {
                Duration::from_secs(self.config.hot_check_interval_s)
            } else {
                Duration::from_secs(self.config.import_frequency_s)
            };

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!(
            queue = ?self.queue.metrics(),
            counters = %metrics().snapshot(),
            "watcher stopped"
        );
        Ok(())
    }

    /// Stat every conversation file under the log root and enqueue the ones
    /// with uncommitted bytes.
    fn scan_and_enqueue(&self) {
        let now = chrono::Utc::now().timestamp();
        let mut items: Vec<(PathBuf, FreshnessLevel, i64)> = Vec::new();

        let walker = WalkBuilder::new(&self.config.logs_dir)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .build();

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let size = meta.len();
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            if should_skip(self.state.get(&path.to_string_lossy()).as_ref(), size, mtime) {
                continue;
            }

            let path = path.to_path_buf();
            let first_seen = *self.first_seen.entry(path.clone()).or_insert(now);
            let (level, priority) = classify(mtime, now, Some(first_seen), &self.config);
            items.push((path, level, priority));
        }

        if items.is_empty() {
            return;
        }
        let added = self
            .queue
            .add_categorized(&items, self.config.max_cold_files);
        if added > 0 {
            debug!(scanned = items.len(), added, queued = self.queue.len(), "scan cycle");
        }
    }

    /// Run one batch through bounded-parallel pipelines.
    async fn ingest_batch(
        &self,
        batch: Vec<(PathBuf, FreshnessLevel)>,
        semaphore: Arc<Semaphore>,
    ) -> AppResult<BatchResult> {
        let mut join_set = JoinSet::new();

        for (path, level) in batch {
            debug!(path = %path.display(), level = level.as_str(), "dispatching file");
            let ingester = self.ingester.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = ingester.ingest_file(&path).await;
                (path, level, outcome)
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutting_down = loop {
            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = shutdown_rx.changed() => break true,
            };
            match joined {
                None => break false,
                Some(Ok((path, _level, outcome))) => self.handle_outcome(path, outcome).await?,
                Some(Err(e)) if e.is_cancelled() => debug!("ingest pipeline cancelled"),
                Some(Err(e)) => error!(error = %e, "ingest task panicked"),
            }
        };

        if !shutting_down {
            return Ok(BatchResult::Drained);
        }

        // Shutdown mid-batch: give in-flight pipelines the grace period to
        // commit, then cut them loose. Idempotency recovers anything aborted.
        info!(
            grace_s = self.config.shutdown_grace_s,
            "shutdown requested; draining in-flight pipelines"
        );
        let drain = async {
            while let Some(joined) = join_set.join_next().await {
                if let Ok((path, _level, outcome)) = joined {
                    let _ = self.handle_outcome(path, outcome).await;
                }
            }
        };
        let grace = Duration::from_secs(self.config.shutdown_grace_s);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace period elapsed; aborting remaining pipelines");
            join_set.abort_all();
        }
        Ok(BatchResult::ShutDown)
    }

    /// Per-file failures are logged and retried next cycle; only an
    /// authentication failure kills the loop (exit code 4 upstream).
    async fn handle_outcome(
        &self,
        path: PathBuf,
        outcome: AppResult<IngestOutcome>,
    ) -> AppResult<()> {
        match outcome {
            Ok(IngestOutcome::Completed { chunks }) => {
                if chunks > 0 {
                    debug!(path = %path.display(), chunks, "file pipeline finished");
                }
                self.first_seen.remove(&path);
                Ok(())
            }
            Ok(IngestOutcome::UpToDate) => {
                self.first_seen.remove(&path);
                Ok(())
            }
            Ok(IngestOutcome::Yielded) => {
                // Progress is committed; put the file back and let RSS settle.
                let now = chrono::Utc::now().timestamp();
                let mtime = std::fs::metadata(&path)
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(now);
                let first_seen = *self.first_seen.entry(path.clone()).or_insert(now);
                let (level, priority) = classify(mtime, now, Some(first_seen), &self.config);
                self.queue
                    .add_categorized(&[(path, level, priority)], self.config.max_cold_files);
                self.memory.wait_until_below_warning().await;
                Ok(())
            }
            Err(e @ AppError::AuthFailure(_)) => {
                error!(path = %path.display(), error = %e, "provider authentication failed; stopping watcher");
                Err(e)
            }
            Err(e) => {
                // State is untouched, so the next cycle retries this file
                // from its last committed offset.
                incr(&metrics().files_failed);
                error!(path = %path.display(), error = %e, "file ingest failed");
                Ok(())
            }
        }
    }
}

enum BatchResult {
    Drained,
    ShutDown,
}

/// A file is skipped only when both its size and mtime match the committed
/// record; either changing means there may be uncommitted bytes.
fn should_skip(record: Option<&crate::state::FileRecord>, size: u64, mtime: i64) -> bool {
    record
        .map(|r| r.size_at_last_commit == size && r.last_modified == mtime)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileRecord;

    fn record(size: u64, mtime: i64) -> FileRecord {
        FileRecord {
            path: "/logs/p/c1.jsonl".into(),
            size_at_last_commit: size,
            byte_offset: size,
            last_modified: mtime,
            last_imported_at: "2026-01-01T00:00:00Z".into(),
            chunks_written: 1,
            conversation_id: "c1".into(),
            project: "p".into(),
            collection: "conv_x_local".into(),
            chunking_version: "v2".into(),
            corrupt_lines: 0,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_unknown_file_is_scanned() {
        assert!(!should_skip(None, 100, 1_700_000_000));
    }

    #[test]
    fn test_committed_file_is_skipped() {
        let rec = record(100, 1_700_000_000);
        assert!(should_skip(Some(&rec), 100, 1_700_000_000));
    }

    #[test]
    fn test_grown_file_is_rescanned() {
        let rec = record(100, 1_700_000_000);
        assert!(!should_skip(Some(&rec), 150, 1_700_000_000));
    }

    #[test]
    fn test_touched_file_is_rescanned() {
        let rec = record(100, 1_700_000_000);
        assert!(!should_skip(Some(&rec), 100, 1_700_000_999));
    }
}
