use std::path::{Path, PathBuf};

/// Opaque tag identifying the chunking algorithm. Re-ingesting a conversation
/// with the same tag is idempotent; a different tag replaces its chunks.
pub const CHUNKING_VERSION: &str = "v2";
pub const CHUNK_METHOD: &str = "token_aware";

/// Chunker window and overlap, in characters (400 / 75 tokens at ~4 chars per token).
pub const CHUNK_WINDOW_CHARS: usize = 1600;
pub const CHUNK_OVERLAP_CHARS: usize = 300;

/// Maximum texts per embedding call.
pub const EMBED_BATCH_SIZE: usize = 32;

/// Maximum points per store upsert request.
pub const UPSERT_BATCH_SIZE: usize = 100;

/// Micro-batch close thresholds for the streaming ingester.
pub const MICRO_BATCH_MAX_MESSAGES: usize = 64;
pub const MICRO_BATCH_MAX_BYTES: usize = 1024 * 1024;

/// File read block size.
pub const READ_BLOCK_BYTES: usize = 64 * 1024;

/// Transient-error retry policy: delay = min(RETRY_CAP_SECS, 2^attempt), ±20% jitter.
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_CAP_SECS: u64 = 30;

/// Cooperative sleep inserted between batches while the CPU governor throttles.
pub const THROTTLE_SLEEP_MS: u64 = 200;

/// Minimum interval between state-file commits for a file mid-ingest.
pub const STATE_COMMIT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the conversation-log tree (per-project subdirectories of *.jsonl).
    pub logs_dir: PathBuf,
    /// Directory holding state files and logs. The state file name itself is
    /// provider-specific unless overridden by `state_file`.
    pub data_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub store_url: String,
    pub prefer_local: bool,
    pub voyage_api_key: Option<String>,
    pub fastembed_cache_dir: PathBuf,
    pub enable_memory_decay: bool,
    pub decay_weight: f64,
    pub decay_scale_days: f64,
    pub memory_limit_mb: u64,
    pub memory_warning_mb: u64,
    pub max_cpu_percent_per_core: f32,
    pub max_queue_size: usize,
    pub max_cold_files: usize,
    pub import_frequency_s: u64,
    pub hot_check_interval_s: u64,
    pub hot_window_minutes: u64,
    pub warm_window_hours: u64,
    pub max_warm_wait_minutes: u64,
    pub batch_size: usize,
    /// Concurrent per-file pipelines. Defaults to 1 for the local provider and
    /// 4 for the cloud provider when unset.
    pub ingester_parallelism: Option<usize>,
    pub shutdown_grace_s: u64,
    pub request_timeout_s: u64,
    /// Project path used for scope=current searches.
    pub active_project: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env_var("RECALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .map(|d| d.join("recall"))
                    .unwrap_or_else(|| PathBuf::from(".recall-data"))
            });

        let logs_dir = env_var("RECALL_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".claude").join("projects"))
                    .unwrap_or_else(|| PathBuf::from("/logs"))
            });

        // Containers get tighter memory thresholds than workstations.
        let constrained = is_memory_constrained();
        let (default_warning, default_limit) = if constrained { (400, 600) } else { (800, 1024) };

        Self {
            logs_dir,
            state_file: env_var("RECALL_STATE_FILE").map(PathBuf::from),
            store_url: env_var("RECALL_STORE_URL")
                .unwrap_or_else(|| "http://localhost:6333".to_string()),
            prefer_local: env_parse("RECALL_PREFER_LOCAL").unwrap_or(true),
            voyage_api_key: env_var("RECALL_VOYAGE_API_KEY")
                .or_else(|| env_var("VOYAGE_API_KEY"))
                .filter(|k| !k.is_empty()),
            fastembed_cache_dir: env_var("RECALL_FASTEMBED_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("fastembed-cache")),
            enable_memory_decay: env_parse("RECALL_ENABLE_MEMORY_DECAY").unwrap_or(false),
            decay_weight: env_parse("RECALL_DECAY_WEIGHT").unwrap_or(0.3),
            decay_scale_days: env_parse("RECALL_DECAY_SCALE_DAYS").unwrap_or(90.0),
            memory_warning_mb: env_parse("RECALL_MEMORY_WARNING_MB").unwrap_or(default_warning),
            memory_limit_mb: env_parse("RECALL_MEMORY_LIMIT_MB").unwrap_or(default_limit),
            max_cpu_percent_per_core: env_parse("RECALL_MAX_CPU_PERCENT_PER_CORE").unwrap_or(50.0),
            max_queue_size: env_parse("RECALL_MAX_QUEUE_SIZE").unwrap_or(10_000),
            max_cold_files: env_parse("RECALL_MAX_COLD_FILES").unwrap_or(3),
            import_frequency_s: env_parse("RECALL_IMPORT_FREQUENCY").unwrap_or(60),
            hot_check_interval_s: env_parse("RECALL_HOT_CHECK_INTERVAL_S").unwrap_or(2),
            hot_window_minutes: env_parse("RECALL_HOT_WINDOW_MINUTES").unwrap_or(5),
            warm_window_hours: env_parse("RECALL_WARM_WINDOW_HOURS").unwrap_or(24),
            max_warm_wait_minutes: env_parse("RECALL_MAX_WARM_WAIT_MINUTES").unwrap_or(30),
            batch_size: env_parse("RECALL_BATCH_SIZE").unwrap_or(5),
            ingester_parallelism: env_parse("RECALL_INGESTER_PARALLELISM"),
            shutdown_grace_s: env_parse("RECALL_SHUTDOWN_GRACE").unwrap_or(30),
            request_timeout_s: env_parse("RECALL_REQUEST_TIMEOUT_S").unwrap_or(30),
            active_project: env_var("RECALL_ACTIVE_PROJECT"),
            data_dir,
        }
    }

    /// Resolve the state file path for a provider, honoring the explicit override.
    pub fn state_file_for(&self, provider_state_filename: &str) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(provider_state_filename))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn decay_scale_ms(&self) -> f64 {
        self.decay_scale_days * 24.0 * 60.0 * 60.0 * 1000.0
    }

    /// Effective per-file pipeline parallelism for a provider suffix.
    pub fn parallelism_for(&self, provider_suffix: &str) -> usize {
        self.ingester_parallelism
            .unwrap_or(if provider_suffix == "local" { 1 } else { 4 })
            .max(1)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Detect whether the process runs under a memory-constrained container:
/// a Docker sentinel file, or a cgroup v2 memory ceiling below 2 GiB.
fn is_memory_constrained() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    match std::fs::read_to_string("/sys/fs/cgroup/memory.max") {
        Ok(contents) => {
            let trimmed = contents.trim();
            match trimmed.parse::<u64>() {
                Ok(bytes) => bytes < 2 * 1024 * 1024 * 1024,
                Err(_) => false, // "max" means unconstrained
            }
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallelism_defaults() {
        let mut config = Config::from_env();
        config.ingester_parallelism = None;
        assert_eq!(config.parallelism_for("local"), 1);
        assert_eq!(config.parallelism_for("voyage"), 4);
        config.ingester_parallelism = Some(2);
        assert_eq!(config.parallelism_for("local"), 2);
        assert_eq!(config.parallelism_for("voyage"), 2);
    }

    #[test]
    fn test_decay_scale_ms() {
        let mut config = Config::from_env();
        config.decay_scale_days = 90.0;
        assert_eq!(config.decay_scale_ms(), 90.0 * 86_400_000.0);
    }

    #[test]
    fn test_state_file_override() {
        let mut config = Config::from_env();
        config.state_file = Some(PathBuf::from("/tmp/explicit.json"));
        assert_eq!(
            config.state_file_for("recall-watcher.json"),
            PathBuf::from("/tmp/explicit.json")
        );
        config.state_file = None;
        assert!(config
            .state_file_for("recall-watcher.json")
            .ends_with("recall-watcher.json"));
    }
}
