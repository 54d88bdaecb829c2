use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vector store error: {0}")]
    TransientStore(String),

    #[error("Embedding provider error: {0}")]
    TransientProvider(String),

    #[error("Collection {collection} is configured for {actual}d vectors, provider produces {expected}d")]
    ConfigMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("State file corrupt: {0}")]
    StateCorrupt(String),

    #[error("Cannot resolve active project: {0}")]
    ProjectUnknown(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Ingest queue full")]
    QueueFull,

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the retry loop should take another attempt at this error.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TransientStore(_) | AppError::TransientProvider(_) => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Process exit code for the CLI: 0 success, 2 configuration error,
    /// 3 store unreachable, 4 provider unavailable, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::StateCorrupt(_) => 2,
            AppError::TransientStore(_) => 3,
            AppError::Http(e) if e.is_connect() || e.is_timeout() => 3,
            AppError::AuthFailure(_) | AppError::EmbeddingUnavailable(_) => 4,
            _ => 1,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_split() {
        assert!(AppError::TransientStore("timeout".into()).is_transient());
        assert!(AppError::TransientProvider("429".into()).is_transient());
        assert!(!AppError::AuthFailure("bad key".into()).is_transient());
        assert!(!AppError::Config("bad flag".into()).is_transient());
        assert!(!AppError::StateCorrupt("torn".into()).is_transient());
        assert!(!AppError::QueueFull.is_transient());
        assert!(!AppError::Cancelled.is_transient());
        assert!(!AppError::ConfigMismatch {
            collection: "conv_x_local".into(),
            expected: 384,
            actual: 1024,
        }
        .is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Config("x".into()).exit_code(), 2);
        assert_eq!(AppError::StateCorrupt("x".into()).exit_code(), 2);
        assert_eq!(AppError::TransientStore("x".into()).exit_code(), 3);
        assert_eq!(AppError::AuthFailure("x".into()).exit_code(), 4);
        assert_eq!(AppError::EmbeddingUnavailable("x".into()).exit_code(), 4);
        assert_eq!(AppError::Cancelled.exit_code(), 1);
        assert_eq!(AppError::QueueFull.exit_code(), 1);
    }

    #[test]
    fn test_mismatch_message_names_both_dims() {
        let e = AppError::ConfigMismatch {
            collection: "conv_x_local".into(),
            expected: 384,
            actual: 1024,
        };
        let msg = e.to_string();
        assert!(msg.contains("conv_x_local"));
        assert!(msg.contains("384"));
        assert!(msg.contains("1024"));
    }
}
