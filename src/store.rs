//! Typed adapter over the external vector store's REST API.
//!
//! Wraps collection management, upserts, scrolls, counts, deletes, and
//! search. Search supports server-side re-scoring with exponential time
//! decay; stores that reject the formula fall back to a client-side
//! evaluation of the same expression. The outcome reports which path ran.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::UPSERT_BATCH_SIZE;
use crate::error::{AppError, AppResult};

/// Payload stored with every point. One record type with optional fields, so
/// readers never poke at untyped keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub text: String,
    pub conversation_id: String,
    pub project: String,
    pub chunk_index: u64,
    /// ISO-8601 ingestion time.
    pub timestamp: String,
    /// Milliseconds since epoch; the numeric key decay formulas operate on.
    pub timestamp_ms: i64,
    pub chunking_version: String,
    pub chunk_method: String,
    pub chunk_overlap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_analyzed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_edited: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub has_file_metadata: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct DecayParams {
    pub weight: f64,
    pub scale_ms: f64,
}

/// Which scoring path a search took, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayPath {
    Native,
    ClientSide,
    None,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub points: Vec<ScoredPoint>,
    pub decay_path: DecayPath,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
    result: CollectionsResult,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
    #[serde(default)]
    points_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPointWire>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    points: Vec<ScoredPointWire>,
}

#[derive(Debug, Deserialize)]
struct ScoredPointWire {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

impl ScoredPointWire {
    fn into_scored(self) -> ScoredPoint {
        let id = match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ScoredPoint {
            id,
            score: self.score,
            payload: self.payload.unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<RecordWire>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecordWire {
    id: Value,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct VectorStore {
    client: reqwest::Client,
    base_url: String,
    /// Collections already verified this process: name -> dimension.
    ensured: DashMap<String, usize>,
}

impl VectorStore {
    pub fn new(base_url: &str, timeout_s: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ensured: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Cheap reachability probe used by `status` and `doctor`.
    pub async fn healthz(&self) -> AppResult<()> {
        let resp = self
            .client
            .get(self.url("/collections"))
            .send()
            .await
            .map_err(|e| AppError::TransientStore(format!("store unreachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AppError::TransientStore(format!(
                "store returned {}",
                resp.status()
            )))
        }
    }

    pub async fn list_collections(&self) -> AppResult<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/collections"))
            .send()
            .await
            .map_err(transient)?;
        let parsed: CollectionsResponse = check(resp).await?.json().await?;
        Ok(parsed
            .result
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    /// Configured vector dimension of an existing collection, if it exists.
    pub async fn collection_dim(&self, name: &str) -> AppResult<Option<usize>> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .map_err(transient)?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let parsed: CollectionInfoResponse = check(resp).await?.json().await?;
        Ok(Some(parsed.result.config.params.vectors.size))
    }

    pub async fn collection_count(&self, name: &str) -> AppResult<u64> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .map_err(transient)?;
        let parsed: CollectionInfoResponse = check(resp).await?.json().await?;
        Ok(parsed.result.points_count.unwrap_or(0))
    }

    /// Idempotently create a collection with cosine distance and on-disk
    /// payload. An existing collection with a different dimension is a
    /// configuration mismatch and is never dropped or recreated here.
    pub async fn ensure_collection(&self, name: &str, dim: usize) -> AppResult<()> {
        if let Some(known) = self.ensured.get(name) {
            if *known == dim {
                return Ok(());
            }
            return Err(AppError::ConfigMismatch {
                collection: name.to_string(),
                expected: dim,
                actual: *known,
            });
        }

        match self.collection_dim(name).await? {
            Some(existing) if existing == dim => {
                self.ensured.insert(name.to_string(), existing);
                return Ok(());
            }
            Some(existing) => {
                return Err(AppError::ConfigMismatch {
                    collection: name.to_string(),
                    expected: dim,
                    actual: existing,
                });
            }
            None => {}
        }

        let body = json!({
            "vectors": { "size": dim, "distance": "Cosine" },
            "on_disk_payload": true,
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{name}")))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        // A concurrent creator may have won; conflict is fine if dims agree.
        if resp.status().as_u16() == 409 {
            if let Some(existing) = self.collection_dim(name).await? {
                if existing != dim {
                    return Err(AppError::ConfigMismatch {
                        collection: name.to_string(),
                        expected: dim,
                        actual: existing,
                    });
                }
            }
        } else {
            check(resp).await?;
            info!(collection = name, dim, "created collection");
        }
        self.ensured.insert(name.to_string(), dim);
        Ok(())
    }

    /// Upsert points in bounded batches, waiting for acknowledgement.
    /// Every vector's length is checked against the collection dimension.
    pub async fn upsert(&self, collection: &str, points: &[Point]) -> AppResult<()> {
        let dim = match self.ensured.get(collection) {
            Some(d) => *d,
            None => self
                .collection_dim(collection)
                .await?
                .ok_or_else(|| AppError::TransientStore(format!("collection {collection} missing")))?,
        };
        for point in points {
            if point.vector.len() != dim {
                return Err(AppError::ConfigMismatch {
                    collection: collection.to_string(),
                    expected: point.vector.len(),
                    actual: dim,
                });
            }
        }

        for batch in points.chunks(UPSERT_BATCH_SIZE) {
            let body = json!({ "points": batch });
            let resp = self
                .client
                .put(self.url(&format!("/collections/{collection}/points?wait=true")))
                .json(&body)
                .send()
                .await
                .map_err(transient)?;
            check(resp).await?;
            debug!(collection, batch = batch.len(), "upserted points");
        }
        Ok(())
    }

    /// Cursor-paged scroll over points matching `filter`.
    pub async fn scroll(
        &self,
        collection: &str,
        filter: Option<Value>,
        limit: usize,
        offset: Option<Value>,
    ) -> AppResult<(Vec<ScoredPoint>, Option<Value>)> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        if let Some(offset) = offset {
            body["offset"] = offset;
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/scroll")))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        let parsed: ScrollResponse = check(resp).await?.json().await?;
        let points = parsed
            .result
            .points
            .into_iter()
            .map(|r| ScoredPoint {
                id: match &r.id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                score: 0.0,
                payload: r.payload.unwrap_or(Value::Null),
            })
            .collect();
        Ok((points, parsed.result.next_page_offset))
    }

    pub async fn count(&self, collection: &str, filter: Option<Value>) -> AppResult<u64> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/count")))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        let parsed: CountResponse = check(resp).await?.json().await?;
        Ok(parsed.result.count)
    }

    /// Id-based deletion, the other half of the delete contract. Repair
    /// tooling calls this; the core paths delete by filter.
    #[allow(dead_code)]
    pub async fn delete_points(&self, collection: &str, ids: &[String]) -> AppResult<()> {
        let body = json!({ "points": ids });
        let resp = self
            .client
            .post(self.url(&format!(
                "/collections/{collection}/points/delete?wait=true"
            )))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        check(resp).await?;
        Ok(())
    }

    pub async fn delete_by_filter(&self, collection: &str, filter: Value) -> AppResult<()> {
        let body = json!({ "filter": filter });
        let resp = self
            .client
            .post(self.url(&format!(
                "/collections/{collection}/points/delete?wait=true"
            )))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        check(resp).await?;
        Ok(())
    }

    /// Vector search with optional decay re-scoring.
    ///
    /// With decay, the store is asked to evaluate
    /// `score + weight * exp_decay(timestamp_ms, now, scale, midpoint=0.5)`
    /// itself; if it rejects the formula (older versions), `3 * limit`
    /// plain candidates are fetched and the same expression is applied here.
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
        offset: usize,
        filter: Option<Value>,
        decay: Option<DecayParams>,
    ) -> AppResult<SearchOutcome> {
        let Some(params) = decay else {
            let points = self
                .plain_search(collection, vector, limit, min_score, offset, filter)
                .await?;
            return Ok(SearchOutcome {
                points,
                decay_path: DecayPath::None,
            });
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let native = self
            .native_decay_search(
                collection,
                vector,
                limit,
                min_score,
                offset,
                filter.clone(),
                params,
                now_ms,
            )
            .await?;
        if let Some(points) = native {
            return Ok(SearchOutcome {
                points,
                decay_path: DecayPath::Native,
            });
        }

        // Store rejected the formula: fetch extra plain candidates and apply
        // the identical expression here.
        let candidates = self
            .plain_search(collection, vector, limit * 3 + offset, None, 0, filter)
            .await?;
        let mut rescored: Vec<ScoredPoint> = candidates
            .into_iter()
            .map(|mut p| {
                let ts = p.payload.get("timestamp_ms").and_then(Value::as_i64);
                p.score = apply_decay(p.score, ts, now_ms, params);
                p
            })
            .filter(|p| min_score.map(|m| p.score >= m).unwrap_or(true))
            .collect();
        rescored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let points = rescored.into_iter().skip(offset).take(limit).collect();
        Ok(SearchOutcome {
            points,
            decay_path: DecayPath::ClientSide,
        })
    }

    async fn plain_search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
        offset: usize,
        filter: Option<Value>,
    ) -> AppResult<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(min_score) = min_score {
            body["score_threshold"] = json!(min_score);
        }
        if offset > 0 {
            body["offset"] = json!(offset);
        }
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        let parsed: SearchResponse = check(resp).await?.json().await?;
        Ok(parsed
            .result
            .into_iter()
            .map(ScoredPointWire::into_scored)
            .collect())
    }

    /// `Ok(None)` means the store rejected the formula and the caller should
    /// re-score client-side.
    #[allow(clippy::too_many_arguments)]
    async fn native_decay_search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
        offset: usize,
        filter: Option<Value>,
        params: DecayParams,
        now_ms: i64,
    ) -> AppResult<Option<Vec<ScoredPoint>>> {
        let mut prefetch = json!({
            "query": vector,
            "limit": (limit + offset) * 3,
        });
        if let Some(filter) = filter {
            prefetch["filter"] = filter;
        }
        let mut body = json!({
            "prefetch": prefetch,
            "query": {
                "formula": {
                    "sum": [
                        "$score",
                        { "mult": [
                            params.weight,
                            { "exp_decay": {
                                "x": "timestamp_ms",
                                "target": now_ms,
                                "scale": params.scale_ms,
                                "midpoint": 0.5,
                            } }
                        ] }
                    ]
                }
            },
            "limit": limit,
            "with_payload": true,
        });
        if let Some(min_score) = min_score {
            body["score_threshold"] = json!(min_score);
        }
        if offset > 0 {
            body["offset"] = json!(offset);
        }

        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/query")))
            .json(&body)
            .send()
            .await
            .map_err(transient)?;

        let status = resp.status();
        if status.is_client_error() {
            // Formula unsupported on this store version.
            let text = resp.text().await.unwrap_or_default();
            warn!(collection, %status, "native decay rejected: {text}");
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::TransientStore(format!("store {status}: {text}")));
        }
        let parsed: QueryResponse = resp.json().await?;
        Ok(Some(
            parsed
                .result
                .points
                .into_iter()
                .map(ScoredPointWire::into_scored)
                .collect(),
        ))
    }
}

/// The decay expression both paths evaluate: with midpoint 0.5 the boost
/// halves every `scale_ms` of age.
pub fn apply_decay(score: f32, timestamp_ms: Option<i64>, now_ms: i64, params: DecayParams) -> f32 {
    match timestamp_ms {
        Some(ts) => {
            let age_ms = (now_ms - ts).max(0) as f64;
            let boost = params.weight * 0.5_f64.powf(age_ms / params.scale_ms);
            score + boost as f32
        }
        None => score,
    }
}

fn transient(e: reqwest::Error) -> AppError {
    AppError::TransientStore(format!("store request failed: {e}"))
}

/// Surface a non-success response as a store error with its body attached.
async fn check(resp: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(AppError::TransientStore(format!("store {status}: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    fn params() -> DecayParams {
        DecayParams {
            weight: 0.3,
            scale_ms: 90.0 * DAY_MS as f64,
        }
    }

    #[test]
    fn test_decay_recent_point_near_full_boost() {
        let now = 1_700_000_000_000;
        let score = apply_decay(0.8, Some(now - DAY_MS), now, params());
        // One day of age over a 90-day half-life barely dents the boost.
        assert!((score - 1.09).abs() < 0.01, "got {score}");
    }

    #[test]
    fn test_decay_old_point_small_boost() {
        let now = 1_700_000_000_000;
        let score = apply_decay(0.8, Some(now - 400 * DAY_MS), now, params());
        assert!((score - 0.814).abs() < 0.005, "got {score}");
    }

    #[test]
    fn test_decay_gap_between_recent_and_old() {
        let now = 1_700_000_000_000;
        let recent = apply_decay(0.8, Some(now - DAY_MS), now, params());
        let old = apply_decay(0.8, Some(now - 400 * DAY_MS), now, params());
        assert!(recent > old);
        assert!(recent - old > 0.25);
    }

    #[test]
    fn test_decay_monotone_in_age() {
        let now = 1_700_000_000_000;
        let mut last = f32::MAX;
        for days in [0, 1, 10, 90, 365, 1000] {
            let score = apply_decay(0.5, Some(now - days * DAY_MS), now, params());
            assert!(score <= last, "decay not monotone at {days} days");
            last = score;
        }
    }

    #[test]
    fn test_decay_missing_timestamp_unchanged() {
        assert_eq!(apply_decay(0.7, None, 0, params()), 0.7);
    }

    #[test]
    fn test_decay_future_timestamp_clamped() {
        let now = 1_700_000_000_000;
        let score = apply_decay(0.5, Some(now + DAY_MS), now, params());
        // Clock skew never produces a boost above the configured weight.
        assert!((score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_payload_roundtrip_skips_empty() {
        let payload = ChunkPayload {
            text: "hello".into(),
            conversation_id: "c1".into(),
            project: "alpha".into(),
            chunk_index: 0,
            timestamp: "2026-01-01T00:00:00Z".into(),
            timestamp_ms: 1_700_000_000_000,
            chunking_version: "v2".into(),
            chunk_method: "token_aware".into(),
            chunk_overlap: true,
            start_role: None,
            files_analyzed: vec![],
            files_edited: vec![],
            tools_used: vec![],
            concepts: vec![],
            has_file_metadata: false,
            reflection: None,
            tags: vec![],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("files_analyzed").is_none());
        assert!(value.get("reflection").is_none());
        assert_eq!(value["chunking_version"], "v2");
        let back: ChunkPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.text, "hello");
    }

    #[test]
    fn test_scored_point_id_shapes() {
        let wire = ScoredPointWire {
            id: Value::String("abc".into()),
            score: 0.5,
            payload: None,
        };
        assert_eq!(wire.into_scored().id, "abc");
        let wire = ScoredPointWire {
            id: json!(42),
            score: 0.5,
            payload: None,
        };
        assert_eq!(wire.into_scored().id, "42");
    }
}
