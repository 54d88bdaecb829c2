//! Query service over the ingested conversation collections.
//!
//! Routes a natural-language query to the right per-project collection(s),
//! embeds it with the active provider, searches with optional time decay, and
//! merges ranked excerpts. Collection-level failures degrade the response
//! instead of failing it; only a dead embedding provider is fatal.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{Config, CHUNKING_VERSION, CHUNK_METHOD};
use crate::embedder::EmbeddingProvider;
use crate::error::{AppError, AppResult};
use crate::metrics::{incr, metrics};
use crate::naming;
use crate::store::{ChunkPayload, DecayParams, DecayPath, Point, ScoredPoint, VectorStore};

/// Decay flag with the environment default as the third state. Coerced from
/// the CLI boundary ("on"/"off"/"default", or 1/0/-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecayMode {
    On,
    Off,
    #[default]
    Default,
}

impl std::str::FromStr for DecayMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" | "1" => Ok(DecayMode::On),
            "off" | "0" => Ok(DecayMode::Off),
            "default" | "-1" => Ok(DecayMode::Default),
            other => Err(AppError::Config(format!(
                "invalid decay mode '{other}' (expected on, off, or default)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    #[default]
    Current,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Brief,
    Markdown,
    Raw,
}

impl std::str::FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brief" => Ok(OutputFormat::Brief),
            "markdown" => Ok(OutputFormat::Markdown),
            "raw" => Ok(OutputFormat::Raw),
            other => Err(AppError::Config(format!(
                "invalid format '{other}' (expected brief, markdown, or raw)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub project: Option<String>,
    pub limit: usize,
    pub min_score: f32,
    pub decay: DecayMode,
    pub scope: SearchScope,
    pub format: OutputFormat,
    pub offset: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            project: None,
            limit: 5,
            min_score: 0.7,
            decay: DecayMode::Default,
            scope: SearchScope::Current,
            format: OutputFormat::Brief,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub role: String,
    pub text: String,
    pub project: String,
    pub conversation_id: Option<String>,
    pub collection: String,
    pub payload: Value,
}

impl SearchHit {
    pub fn excerpt(&self, max_chars: usize) -> String {
        let mut excerpt: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().count() > max_chars {
            excerpt.push('…');
        }
        excerpt
    }
}

#[derive(Debug)]
pub struct ReflectResponse {
    pub hits: Vec<SearchHit>,
    /// True when one or more target collections were skipped.
    pub degraded: bool,
    pub decay_path: DecayPath,
}

pub struct SearchEngine {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: Arc<Config>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Semantic search over past conversations.
    pub async fn reflect(&self, query: &str, opts: &SearchOptions) -> AppResult<ReflectResponse> {
        let collections = self.target_collections(opts).await?;
        let qvec = self.embed_query(query).await?;
        let decay = self.decay_params(opts.decay);

        let mut hits = Vec::new();
        let mut degraded = false;
        let mut decay_path = DecayPath::None;

        for collection in &collections {
            let outcome = self
                .store
                .search(
                    collection,
                    &qvec,
                    opts.limit,
                    Some(opts.min_score),
                    opts.offset,
                    None,
                    decay,
                )
                .await;
            match outcome {
                Ok(outcome) => {
                    if outcome.decay_path != DecayPath::None {
                        decay_path = outcome.decay_path;
                    }
                    hits.extend(
                        outcome
                            .points
                            .into_iter()
                            .map(|p| hit_from_scored(p, collection)),
                    );
                }
                Err(e) => {
                    // Partial results beat no results; the caller sees the
                    // degraded marker.
                    incr(&metrics().collections_skipped);
                    warn!(collection = %collection, error = %e, "collection skipped during search");
                    degraded = true;
                }
            }
        }

        rank(&mut hits);
        hits.truncate(opts.limit);

        tracing::debug!(
            hits = hits.len(),
            collections = collections.len(),
            degraded,
            decay_path = ?decay_path,
            "reflect complete"
        );
        Ok(ReflectResponse {
            hits,
            degraded,
            decay_path,
        })
    }

    /// Convenience single-result variant.
    pub async fn quick_search(&self, query: &str, opts: &SearchOptions) -> AppResult<ReflectResponse> {
        let opts = SearchOptions {
            limit: 1,
            ..opts.clone()
        };
        self.reflect(query, &opts).await
    }

    /// Pagination over the same ranked ordering.
    pub async fn get_more_results(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
        opts: &SearchOptions,
    ) -> AppResult<ReflectResponse> {
        let opts = SearchOptions {
            offset,
            limit,
            ..opts.clone()
        };
        self.reflect(query, &opts).await
    }

    /// Persist a self-authored memory into the reserved reflections
    /// collection, using the standard point schema.
    pub async fn store_reflection(&self, content: &str, tags: &[String]) -> AppResult<String> {
        let collection = naming::reflections_collection(self.provider.suffix());
        self.store
            .ensure_collection(&collection, self.provider.dim())
            .await?;

        let vector = self
            .provider
            .embed_documents(&[content.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AppError::EmbeddingUnavailable("empty embedding response".into()))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let point = Point {
            id: id.clone(),
            vector,
            payload: ChunkPayload {
                text: content.to_string(),
                conversation_id: format!("reflection-{}", &id[..8]),
                project: "reflections".to_string(),
                chunk_index: 0,
                timestamp: now.to_rfc3339(),
                timestamp_ms: now.timestamp_millis(),
                chunking_version: CHUNKING_VERSION.to_string(),
                chunk_method: CHUNK_METHOD.to_string(),
                chunk_overlap: false,
                start_role: None,
                files_analyzed: Vec::new(),
                files_edited: Vec::new(),
                tools_used: Vec::new(),
                concepts: Vec::new(),
                has_file_metadata: false,
                reflection: Some(true),
                tags: tags.to_vec(),
            },
        };
        self.store.upsert(&collection, &[point]).await?;
        Ok(id)
    }

    /// Payload-filter search for conversations that touched a file. No
    /// embedding involved.
    pub async fn search_by_file(&self, file_path: &str, limit: usize) -> AppResult<Vec<SearchHit>> {
        let filter = json!({
            "should": [
                { "key": "files_analyzed", "match": { "value": file_path } },
                { "key": "files_edited", "match": { "value": file_path } },
            ]
        });
        let mut hits = self.scroll_all(filter, limit).await?;
        hits.sort_by_key(|h| std::cmp::Reverse(h.timestamp_ms));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Concept-tag search: payload filter on `concepts`, semantically ranked
    /// when the provider is up, recency-ordered otherwise. `include_files`
    /// keeps the per-hit file lists in the returned payloads; otherwise they
    /// are stripped to keep responses small.
    pub async fn search_by_concept(
        &self,
        concept: &str,
        include_files: bool,
        limit: usize,
    ) -> AppResult<Vec<SearchHit>> {
        let filter = json!({
            "must": [ { "key": "concepts", "match": { "value": concept.to_lowercase() } } ]
        });

        let mut hits = match self.embed_query(concept).await {
            Ok(qvec) => {
                let mut hits = Vec::new();
                for collection in self.suffix_collections().await? {
                    match self
                        .store
                        .search(&collection, &qvec, limit, None, 0, Some(filter.clone()), None)
                        .await
                    {
                        Ok(outcome) => hits.extend(
                            outcome
                                .points
                                .into_iter()
                                .map(|p| hit_from_scored(p, &collection)),
                        ),
                        Err(e) => {
                            incr(&metrics().collections_skipped);
                            warn!(collection = %collection, error = %e, "collection skipped during concept search");
                        }
                    }
                }
                rank(&mut hits);
                hits
            }
            Err(e) => {
                warn!(error = %e, "embedding unavailable; concept search falls back to payload filter");
                let mut hits = self.scroll_all(filter, limit).await?;
                hits.sort_by_key(|h| std::cmp::Reverse(h.timestamp_ms));
                hits
            }
        };

        hits.truncate(limit);
        if !include_files {
            for hit in &mut hits {
                if let Some(obj) = hit.payload.as_object_mut() {
                    obj.remove("files_analyzed");
                    obj.remove("files_edited");
                }
            }
        }
        Ok(hits)
    }

    /// Render a response in the requested format.
    pub fn format(&self, query: &str, response: &ReflectResponse, format: OutputFormat) -> String {
        if response.hits.is_empty() {
            let mut out = format!("No conversations found matching '{query}'.");
            if response.degraded {
                out.push_str(" (degraded: some collections were unavailable)");
            }
            return out;
        }

        match format {
            OutputFormat::Brief => {
                let mut out = String::new();
                for (i, hit) in response.hits.iter().enumerate() {
                    out.push_str(&format!(
                        "{}. [{:.3}] {}: {}\n",
                        i + 1,
                        hit.score,
                        hit.project,
                        hit.excerpt(200)
                    ));
                }
                if response.degraded {
                    out.push_str("(degraded: some collections were unavailable)\n");
                }
                out
            }
            OutputFormat::Markdown | OutputFormat::Raw => {
                let mut out = format!(
                    "Found {} relevant conversation(s) for '{}':\n\n",
                    response.hits.len(),
                    query
                );
                for (i, hit) in response.hits.iter().enumerate() {
                    out.push_str(&format!("**Result {}** (Score: {:.3})\n", i + 1, hit.score));
                    out.push_str(&format!("Time: {}\n", hit.timestamp));
                    out.push_str(&format!("Project: {}\n", hit.project));
                    out.push_str(&format!("Role: {}\n", hit.role));
                    out.push_str(&format!("Excerpt: {}\n", hit.excerpt(500)));
                    if format == OutputFormat::Raw {
                        out.push_str(&format!(
                            "Payload: {}\n",
                            serde_json::to_string_pretty(&hit.payload).unwrap_or_default()
                        ));
                    }
                    out.push_str("---\n\n");
                }
                if response.degraded {
                    out.push_str("_degraded: some collections were unavailable_\n");
                }
                out
            }
        }
    }

    fn decay_params(&self, mode: DecayMode) -> Option<DecayParams> {
        let enabled = match mode {
            DecayMode::On => true,
            DecayMode::Off => false,
            DecayMode::Default => self.config.enable_memory_decay,
        };
        enabled.then(|| DecayParams {
            weight: self.config.decay_weight,
            scale_ms: self.config.decay_scale_ms(),
        })
    }

    async fn embed_query(&self, query: &str) -> AppResult<Vec<f32>> {
        self.provider.embed_query(query).await.map_err(|e| match e {
            AppError::AuthFailure(m) => AppError::AuthFailure(m),
            other => AppError::EmbeddingUnavailable(other.to_string()),
        })
    }

    async fn target_collections(&self, opts: &SearchOptions) -> AppResult<Vec<String>> {
        match opts.scope {
            SearchScope::All => self.suffix_collections().await,
            SearchScope::Current => {
                let project_path = self.resolve_project_path(opts.project.as_deref())?;
                let (project_name, collection) =
                    naming::collection_for(&project_path, self.provider.suffix());
                let known = self.store.list_collections().await?;
                if !known.contains(&collection) {
                    return Err(AppError::ProjectUnknown(format!(
                        "no collection for project '{project_name}' (expected {collection})"
                    )));
                }
                Ok(vec![collection])
            }
        }
    }

    /// All conversation collections for the active provider's vector space.
    async fn suffix_collections(&self) -> AppResult<Vec<String>> {
        let suffix = format!("_{}", self.provider.suffix());
        Ok(self
            .store
            .list_collections()
            .await?
            .into_iter()
            .filter(|name| name.starts_with("conv_") && name.ends_with(&suffix))
            .collect())
    }

    fn resolve_project_path(&self, explicit: Option<&str>) -> AppResult<PathBuf> {
        if let Some(path) = explicit {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = &self.config.active_project {
            return Ok(PathBuf::from(path));
        }
        std::env::current_dir()
            .map_err(|_| AppError::ProjectUnknown("no project given and no working directory".into()))
    }

    async fn scroll_all(&self, filter: Value, limit: usize) -> AppResult<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for collection in self.suffix_collections().await? {
            match self
                .store
                .scroll(&collection, Some(filter.clone()), limit, None)
                .await
            {
                Ok((points, _)) => {
                    hits.extend(points.into_iter().map(|p| hit_from_scored(p, &collection)));
                }
                Err(e) => {
                    incr(&metrics().collections_skipped);
                    warn!(collection = %collection, error = %e, "collection skipped during scroll");
                }
            }
        }
        Ok(hits)
    }
}

/// Score descending, ties broken by recency.
fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.timestamp_ms.cmp(&a.timestamp_ms))
    });
}

fn hit_from_scored(point: ScoredPoint, collection: &str) -> SearchHit {
    let payload = &point.payload;
    let get_str = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let project = match payload.get("project").and_then(Value::as_str) {
        Some(p) => p.to_string(),
        None => collection
            .trim_start_matches("conv_")
            .trim_end_matches("_local")
            .trim_end_matches("_voyage")
            .to_string(),
    };
    SearchHit {
        id: point.id,
        score: point.score,
        timestamp: get_str("timestamp"),
        timestamp_ms: payload
            .get("timestamp_ms")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        role: {
            let role = get_str("start_role");
            if role.is_empty() {
                "unknown".to_string()
            } else {
                role
            }
        },
        text: get_str("text"),
        project,
        conversation_id: payload
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        collection: collection.to_string(),
        payload: point.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(score: f32, timestamp_ms: i64) -> SearchHit {
        SearchHit {
            id: format!("{score}-{timestamp_ms}"),
            score,
            timestamp: String::new(),
            timestamp_ms,
            role: "user".into(),
            text: "body".into(),
            project: "alpha".into(),
            conversation_id: None,
            collection: "conv_x_local".into(),
            payload: Value::Null,
        }
    }

    #[test]
    fn test_decay_mode_parsing() {
        assert_eq!("on".parse::<DecayMode>().unwrap(), DecayMode::On);
        assert_eq!("1".parse::<DecayMode>().unwrap(), DecayMode::On);
        assert_eq!("off".parse::<DecayMode>().unwrap(), DecayMode::Off);
        assert_eq!("0".parse::<DecayMode>().unwrap(), DecayMode::Off);
        assert_eq!("default".parse::<DecayMode>().unwrap(), DecayMode::Default);
        assert_eq!("-1".parse::<DecayMode>().unwrap(), DecayMode::Default);
        assert!("maybe".parse::<DecayMode>().is_err());
    }

    #[test]
    fn test_rank_by_score_then_recency() {
        let mut hits = vec![hit(0.8, 100), hit(0.9, 50), hit(0.8, 200)];
        rank(&mut hits);
        let order: Vec<(f32, i64)> = hits.iter().map(|h| (h.score, h.timestamp_ms)).collect();
        assert_eq!(order, vec![(0.9, 50), (0.8, 200), (0.8, 100)]);
    }

    #[test]
    fn test_hit_from_payload() {
        let point = ScoredPoint {
            id: "abc".into(),
            score: 0.91,
            payload: serde_json::json!({
                "text": "we fixed the build",
                "project": "alpha",
                "conversation_id": "c7",
                "timestamp": "2026-01-02T03:04:05Z",
                "timestamp_ms": 1_767_323_045_000_i64,
                "start_role": "assistant",
            }),
        };
        let hit = hit_from_scored(point, "conv_deadbeef_local");
        assert_eq!(hit.project, "alpha");
        assert_eq!(hit.role, "assistant");
        assert_eq!(hit.conversation_id.as_deref(), Some("c7"));
        assert_eq!(hit.timestamp_ms, 1_767_323_045_000);
    }

    #[test]
    fn test_hit_project_falls_back_to_collection() {
        let point = ScoredPoint {
            id: "abc".into(),
            score: 0.5,
            payload: Value::Null,
        };
        let hit = hit_from_scored(point, "conv_deadbeef_local");
        assert_eq!(hit.project, "deadbeef");
        assert_eq!(hit.role, "unknown");
    }

    #[test]
    fn test_excerpt_truncation() {
        let mut h = hit(0.5, 0);
        h.text = "x".repeat(500);
        let excerpt = h.excerpt(200);
        assert_eq!(excerpt.chars().count(), 201); // 200 chars + ellipsis
        h.text = "short".into();
        assert_eq!(h.excerpt(200), "short");
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("brief".parse::<OutputFormat>().unwrap(), OutputFormat::Brief);
        assert_eq!(
            "markdown".parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert_eq!("raw".parse::<OutputFormat>().unwrap(), OutputFormat::Raw);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = SearchOptions::default();
        assert_eq!(opts.limit, 5);
        assert_eq!(opts.min_score, 0.7);
        assert_eq!(opts.decay, DecayMode::Default);
        assert_eq!(opts.format, OutputFormat::Brief);
    }
}
