// Error types for the arbflow engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("WebSocket connection error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rate limited on endpoint {endpoint}")]
    RateLimited { endpoint: String },

    #[error("No healthy endpoint available")]
    NoEndpointAvailable,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Source error: {source_id} - {message}")]
    SourceError { source_id: String, message: String },

    #[error("Pipeline rejected opportunity: {0}")]
    PipelineRejected(String),

    #[error("Trading gated by safety plane: {0}")]
    SafetyGated(String),

    #[error("Queue overflow: {0}")]
    QueueOverflow(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True for failures that resolve on their own and should be retried
    /// rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::WebSocketError(_)
                | EngineError::RateLimited { .. }
                | EngineError::Timeout(_)
                | EngineError::HttpError(_)
                | EngineError::NoEndpointAvailable
        )
    }
}
