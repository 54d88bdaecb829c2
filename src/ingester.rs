//! Streaming per-file ingest pipeline.
//!
//! Reads a conversation file from its committed byte offset, parses records
//! line by line (holding at most one trailing partial line), micro-batches
//! messages, chunks, embeds, upserts, and advances the durable cursor. Within
//! one file everything is serial so chunk indices and offsets stay monotonic;
//! parallelism lives one level up, across files.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::{
    CHUNKING_VERSION, CHUNK_METHOD, CHUNK_WINDOW_CHARS, EMBED_BATCH_SIZE, MAX_RETRIES,
    MICRO_BATCH_MAX_BYTES, MICRO_BATCH_MAX_MESSAGES, READ_BLOCK_BYTES, RETRY_CAP_SECS,
    STATE_COMMIT_INTERVAL_MS, THROTTLE_SLEEP_MS,
};
use crate::embedder::EmbeddingProvider;
use crate::error::{AppError, AppResult};
use crate::governor::{CpuMonitor, MemoryMonitor, MemoryStatus};
use crate::metrics::{add, incr, metrics};
use crate::state::{FileRecord, StateStore};
use crate::store::{ChunkPayload, Point, VectorStore};
use crate::{chunker, naming};

/// Concept keywords surfaced into chunk payloads for concept search.
const CONCEPT_KEYWORDS: &[&str] = &[
    "docker",
    "kubernetes",
    "database",
    "migration",
    "testing",
    "debugging",
    "deployment",
    "security",
    "authentication",
    "performance",
    "caching",
    "embedding",
    "search",
    "frontend",
    "backend",
    "api",
];

/// Tool names whose file inputs count as edits rather than reads.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

#[derive(Debug)]
pub enum IngestOutcome {
    /// File fully processed up to its last complete line.
    Completed { chunks: u64 },
    /// Nothing new since the last commit.
    UpToDate,
    /// Stopped early under memory pressure; progress so far is committed and
    /// the file should be re-queued.
    Yielded,
}

pub struct Ingester {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    state: Arc<StateStore>,
    memory: Arc<MemoryMonitor>,
    cpu: Arc<CpuMonitor>,
}

#[derive(Debug, Clone)]
struct ParsedMessage {
    role: String,
    text: String,
    tools_used: Vec<String>,
    files_analyzed: Vec<String>,
    files_edited: Vec<String>,
}

enum LineKind {
    Message(ParsedMessage),
    Skip,
    Corrupt,
}

#[derive(Default)]
struct MicroBatch {
    messages: Vec<ParsedMessage>,
    text_chars: usize,
    raw_bytes: usize,
}

impl MicroBatch {
    fn push(&mut self, message: ParsedMessage, raw_len: usize) {
        self.text_chars += message.text.chars().count();
        self.raw_bytes += raw_len;
        self.messages.push(message);
    }

    /// Full enough to hand to the chunker: one chunker window of text, or the
    /// message/byte caps.
    fn closeable(&self) -> bool {
        self.text_chars >= CHUNK_WINDOW_CHARS
            || self.messages.len() >= MICRO_BATCH_MAX_MESSAGES
            || self.raw_bytes >= MICRO_BATCH_MAX_BYTES
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn take(&mut self) -> Vec<ParsedMessage> {
        self.text_chars = 0;
        self.raw_bytes = 0;
        std::mem::take(&mut self.messages)
    }
}

impl Ingester {
    pub fn new(
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        state: Arc<StateStore>,
        memory: Arc<MemoryMonitor>,
        cpu: Arc<CpuMonitor>,
    ) -> Self {
        Self {
            store,
            provider,
            state,
            memory,
            cpu,
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Run the pipeline for one file. Errors leave the last committed state
    /// untouched; idempotent point ids absorb any re-embedded tail.
    pub async fn ingest_file(&self, path: &Path) -> AppResult<IngestOutcome> {
        let path_str = path.to_string_lossy().to_string();
        let meta = tokio::fs::metadata(path).await?;
        let current_size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let project_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let (project_name, collection) =
            naming::collection_for(project_dir, self.provider.suffix());
        let conversation_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let existing = self.state.get(&path_str);
        if let Some(record) = &existing {
            if record.size_at_last_commit == current_size {
                return Ok(IngestOutcome::UpToDate);
            }
        }

        // Permanent errors (dimension mismatch) surface here and stop the file.
        self.store
            .ensure_collection(&collection, self.provider.dim())
            .await?;

        let mut offset = existing.as_ref().map(|r| r.byte_offset).unwrap_or(0);
        if offset > current_size {
            warn!(path = %path_str, offset, current_size, "committed offset beyond file size; restarting file");
            offset = 0;
        }
        let mut chunk_base = existing.as_ref().map(|r| r.chunks_written).unwrap_or(0);
        let mut corrupt_lines = existing.as_ref().map(|r| r.corrupt_lines).unwrap_or(0);
        let chunks_before = chunk_base;

        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::with_capacity(READ_BLOCK_BYTES, file);
        reader.seek(SeekFrom::Start(offset)).await?;

        let mut cursor = FileCursor {
            path: path_str.clone(),
            conversation_id,
            project: project_name,
            collection,
            consumed: offset,
            mtime,
            last_commit: Instant::now(),
        };

        let mut buf: Vec<u8> = Vec::new();
        let mut block = vec![0u8; READ_BLOCK_BYTES];
        let mut batch = MicroBatch::default();

        loop {
            let n = reader.read(&mut block).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&block[..n]);

            let mut line_start = 0usize;
            while let Some(nl) = buf[line_start..].iter().position(|&b| b == b'\n') {
                let line_end = line_start + nl;
                let line = &buf[line_start..line_end];

                match parse_line(line) {
                    LineKind::Message(message) => batch.push(message, line.len() + 1),
                    LineKind::Skip => {}
                    LineKind::Corrupt => {
                        corrupt_lines += 1;
                        incr(&metrics().corrupt_lines);
                        debug!(path = %cursor.path, "skipping corrupt line");
                    }
                }

                cursor.consumed += (nl + 1) as u64;
                line_start = line_end + 1;
            }
            // The tail is the single in-memory partial line; the committed
            // offset never moves past it.
            buf.drain(..line_start);

            if batch.closeable() {
                let stopped = self
                    .flush(&mut batch, &mut chunk_base, corrupt_lines, &mut cursor)
                    .await?;
                if stopped {
                    return Ok(IngestOutcome::Yielded);
                }
            }
        }

        // End of file: flush whatever is buffered, then commit the terminal
        // record. size_at_last_commit is the full current size so unchanged
        // files are skipped on the next scan; any unterminated tail is
        // re-read once the file grows.
        if !batch.is_empty() {
            let stopped = self
                .flush(&mut batch, &mut chunk_base, corrupt_lines, &mut cursor)
                .await?;
            if stopped {
                return Ok(IngestOutcome::Yielded);
            }
        }

        self.commit_state(&mut cursor, current_size, chunk_base, corrupt_lines)?;

        let chunks = chunk_base - chunks_before;
        if chunks > 0 {
            info!(
                path = %cursor.path,
                collection = %cursor.collection,
                chunks,
                offset = cursor.consumed,
                "file ingested"
            );
        }
        incr(&metrics().files_ingested);
        Ok(IngestOutcome::Completed { chunks })
    }

    /// Chunk, embed, and upsert one micro-batch, then advance the cursor.
    /// Returns `true` when the memory governor demands the file be yielded.
    async fn flush(
        &self,
        batch: &mut MicroBatch,
        chunk_base: &mut u64,
        corrupt_lines: u64,
        cursor: &mut FileCursor,
    ) -> AppResult<bool> {
        let messages = batch.take();
        if messages.is_empty() {
            return Ok(false);
        }

        let combined = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let pieces = chunker::chunk_text(&combined);
        if pieces.is_empty() {
            return Ok(false);
        }

        let start_role = messages.first().map(|m| m.role.clone());
        let tools_used = collect_unique(messages.iter().flat_map(|m| m.tools_used.iter()));
        let files_analyzed = collect_unique(messages.iter().flat_map(|m| m.files_analyzed.iter()));
        let files_edited = collect_unique(messages.iter().flat_map(|m| m.files_edited.iter()));
        let concepts = extract_concepts(&combined);
        let has_file_metadata = !files_analyzed.is_empty() || !files_edited.is_empty();

        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let timestamp_ms = now.timestamp_millis();

        let mut points = Vec::with_capacity(pieces.len());
        for slice in pieces.chunks(EMBED_BATCH_SIZE) {
            let provider = self.provider.clone();
            let texts: Vec<String> = slice.to_vec();
            let vectors = retry_with_backoff("embed", || {
                let provider = provider.clone();
                let texts = texts.clone();
                async move { provider.embed_documents(&texts).await }
            })
            .await?;

            for (text, vector) in slice.iter().zip(vectors) {
                let index = *chunk_base;
                *chunk_base += 1;
                points.push(Point {
                    id: point_id(&cursor.conversation_id, index),
                    vector,
                    payload: ChunkPayload {
                        text: text.clone(),
                        conversation_id: cursor.conversation_id.clone(),
                        project: cursor.project.clone(),
                        chunk_index: index,
                        timestamp: timestamp.clone(),
                        timestamp_ms,
                        chunking_version: CHUNKING_VERSION.to_string(),
                        chunk_method: CHUNK_METHOD.to_string(),
                        chunk_overlap: true,
                        start_role: start_role.clone(),
                        files_analyzed: files_analyzed.clone(),
                        files_edited: files_edited.clone(),
                        tools_used: tools_used.clone(),
                        concepts: concepts.clone(),
                        has_file_metadata,
                        reflection: None,
                        tags: Vec::new(),
                    },
                });
            }
        }

        let store = self.store.clone();
        let collection = cursor.collection.clone();
        let to_send = points.clone();
        retry_with_backoff("upsert", || {
            let store = store.clone();
            let collection = collection.clone();
            let points = to_send.clone();
            async move { store.upsert(&collection, &points).await }
        })
        .await?;

        add(&metrics().chunks_written, points.len() as u64);
        add(&metrics().points_upserted, points.len() as u64);

        // Offset is durable only after the store acknowledged the batch.
        if cursor.last_commit.elapsed() >= Duration::from_millis(STATE_COMMIT_INTERVAL_MS) {
            self.commit_state(cursor, cursor.consumed, *chunk_base, corrupt_lines)?;
        }

        if self.cpu.should_throttle() {
            incr(&metrics().cpu_throttles);
            tokio::time::sleep(Duration::from_millis(THROTTLE_SLEEP_MS)).await;
        }

        match self.memory.status() {
            MemoryStatus::OverLimit => {
                incr(&metrics().memory_pauses);
                warn!(path = %cursor.path, "memory over limit; committing and yielding file");
                self.commit_state(cursor, cursor.consumed, *chunk_base, corrupt_lines)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn commit_state(
        &self,
        cursor: &mut FileCursor,
        size_at_last_commit: u64,
        chunks_written: u64,
        corrupt_lines: u64,
    ) -> AppResult<()> {
        self.state.commit(FileRecord {
            path: cursor.path.clone(),
            size_at_last_commit,
            byte_offset: cursor.consumed,
            last_modified: cursor.mtime,
            last_imported_at: Utc::now().to_rfc3339(),
            chunks_written,
            conversation_id: cursor.conversation_id.clone(),
            project: cursor.project.clone(),
            collection: cursor.collection.clone(),
            chunking_version: CHUNKING_VERSION.to_string(),
            corrupt_lines,
            extra: serde_json::Map::new(),
        })?;
        cursor.last_commit = Instant::now();
        Ok(())
    }
}

struct FileCursor {
    path: String,
    conversation_id: String,
    project: String,
    collection: String,
    consumed: u64,
    mtime: i64,
    last_commit: Instant,
}

/// Deterministic 32-hex point id: `sha256("<conversation>_<index>_v2")[..32]`.
pub fn point_id(conversation_id: &str, chunk_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{conversation_id}_{chunk_index}_{CHUNKING_VERSION}").as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// Retry a transient-failing operation with capped exponential backoff and
/// ±20% jitter. Permanent errors return immediately.
pub async fn retry_with_backoff<T, F, Fut>(what: &'static str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                incr(&metrics().transient_retries);
                let base_ms = RETRY_CAP_SECS.min(1u64 << attempt.min(5)) * 1000;
                let delay_ms = jittered_ms(base_ms);
                warn!(what, attempt, delay_ms, error = %e, "transient error; backing off");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// ±20% jitter derived from the subsecond clock.
fn jittered_ms(base_ms: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let span = (base_ms * 2 / 5).max(1); // full width of the ±20% band
    base_ms - span / 2 + nanos % span
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

fn parse_line(line: &[u8]) -> LineKind {
    let trimmed: &[u8] = {
        let start = line.iter().position(|b| !b.is_ascii_whitespace());
        match start {
            Some(s) => &line[s..],
            None => return LineKind::Skip,
        }
    };

    let value: serde_json::Value = match serde_json::from_slice(trimmed) {
        Ok(v) => v,
        Err(_) => return LineKind::Corrupt,
    };

    // Primary shape nests the message; the alternate is flat.
    let message = match value.get("message") {
        Some(m) if m.is_object() => m,
        _ => &value,
    };

    let role = match message.get("role").and_then(|r| r.as_str()) {
        Some(r) => r.to_string(),
        None => return LineKind::Skip,
    };
    let content = match message.get("content") {
        Some(c) => c,
        None => return LineKind::Skip,
    };

    let mut text_parts: Vec<String> = Vec::new();
    let mut tools_used = Vec::new();
    let mut files_analyzed = Vec::new();
    let mut files_edited = Vec::new();

    match content {
        serde_json::Value::String(s) => text_parts.push(s.clone()),
        serde_json::Value::Array(parts) => {
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(t.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = part.get("name").and_then(|n| n.as_str()).unwrap_or("");
                        if !name.is_empty() {
                            tools_used.push(name.to_string());
                        }
                        let file = part
                            .get("input")
                            .and_then(|i| i.get("file_path").or_else(|| i.get("path")))
                            .and_then(|p| p.as_str());
                        if let Some(file) = file {
                            if EDIT_TOOLS.contains(&name) {
                                files_edited.push(file.to_string());
                            } else {
                                files_analyzed.push(file.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => return LineKind::Skip,
    }

    let text = text_parts.join("\n");
    if text.trim().is_empty() && tools_used.is_empty() {
        return LineKind::Skip;
    }

    LineKind::Message(ParsedMessage {
        role,
        text,
        tools_used,
        files_analyzed,
        files_edited,
    })
}

fn collect_unique<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    for item in items {
        seen.insert(item.clone());
    }
    seen.into_iter().collect()
}

fn extract_concepts(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    CONCEPT_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(**kw))
        .map(|kw| kw.to_string())
        .collect()
}
