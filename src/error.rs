use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource missing: {0}")]
    Resource(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Transient remote failure: {0}")]
    TransientRemote(String),

    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Unsupported content: {0}")]
    UserContent(String),

    #[error("Ingest cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk store error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Lexical index error: {0}")]
    Lexical(#[from] tantivy::TantivyError),

    #[error("Inference error: {0}")]
    Inference(#[from] ort::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RagError {
    /// Whether the retry policy may re-attempt the failed operation.
    /// Validation, configuration, and integrity failures never retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RagError::TransientIo(_) | RagError::TransientRemote(_) | RagError::Io(_) => true,
            RagError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RagError::TransientIo("disk busy".into()).is_transient());
        assert!(RagError::TransientRemote("llm 503".into()).is_transient());
        assert!(!RagError::Config("overlap >= chunk size".into()).is_transient());
        assert!(!RagError::DataIntegrity("dimension mismatch".into()).is_transient());
        assert!(!RagError::Resource("model file absent".into()).is_transient());
    }
}
