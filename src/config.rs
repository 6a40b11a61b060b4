use crate::error::{RagError, RagResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Supported corpus file extensions. Plain-text formats are chunked directly;
/// the extractor formats (pdf/html/images) are recognized so that a missing
/// extractor is reported per file instead of silently skipping the file.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst"];
pub const EXTRACTOR_EXTENSIONS: &[&str] =
    &["pdf", "html", "htm", "png", "jpg", "jpeg", "webp", "tiff", "bmp"];

pub fn is_text_extension(ext: &str) -> bool {
    TEXT_EXTENSIONS.contains(&ext)
}

pub fn needs_extractor(ext: &str) -> bool {
    EXTRACTOR_EXTENSIONS.contains(&ext)
}

/// Which execution provider the inference sessions should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RagConfig {
    // Model files
    pub embedding_model_path: PathBuf,
    pub reranker_model_path: PathBuf,

    // Store locations
    pub chunk_store_path: PathBuf,
    pub vector_index_path: PathBuf,
    pub lexical_index_path: PathBuf,

    // LLM collaborator
    pub llm_endpoint: String,
    pub llm_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,

    // Chunking
    pub enable_semantic_chunking: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Embedding
    pub embedding_batch_size: usize,
    pub embedding_dimension: usize,

    // Query pipeline
    pub enable_query_expansion: bool,
    pub query_expansion_count: usize,
    pub enable_hybrid_search: bool,
    pub hybrid_alpha: f32,
    pub enable_reranking: bool,
    pub rerank_top_k: usize,
    pub default_top_k: usize,

    // Execution provider
    pub execution_provider_preference: ProviderPreference,
    pub gpu_device_id: i32,
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            embedding_model_path: PathBuf::from("models/embedding/model.onnx"),
            reranker_model_path: PathBuf::from("models/reranker/model.onnx"),
            chunk_store_path: data_dir.join("chunks.db"),
            vector_index_path: data_dir.join("vectors.idx"),
            lexical_index_path: data_dir.join("lexical"),
            llm_endpoint: "http://127.0.0.1:11434".to_string(),
            llm_model: "llama3".to_string(),
            temperature: 0.1,
            top_p: 0.9,
            max_tokens: 500,
            request_timeout_seconds: 180,
            enable_semantic_chunking: false,
            chunk_size: 1600,
            chunk_overlap: 200,
            embedding_batch_size: 16,
            embedding_dimension: 384,
            enable_query_expansion: true,
            query_expansion_count: 3,
            enable_hybrid_search: true,
            hybrid_alpha: 0.7,
            enable_reranking: true,
            rerank_top_k: 20,
            default_top_k: 7,
            execution_provider_preference: ProviderPreference::Auto,
            gpu_device_id: 0,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("ragline"))
        .unwrap_or_else(|| PathBuf::from(".ragline-data"))
}

impl RagConfig {
    /// Load configuration from a TOML file. A missing file yields pure
    /// defaults; a present-but-malformed file is a configuration error.
    pub fn load(path: Option<&Path>) -> RagResult<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("ragline.toml"));
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: RagConfig = toml::from_str(&raw)
                .map_err(|e| RagError::Config(format!("{}: {}", path.display(), e)))?;
            tracing::info!(config = %path.display(), "Loaded configuration");
            config
        } else {
            tracing::debug!(config = %path.display(), "No config file, using defaults");
            RagConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate numeric settings before any I/O begins.
    pub fn validate(&self) -> RagResult<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Config("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be < chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_dimension == 0 {
            return Err(RagError::Config("embedding_dimension must be > 0".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(RagError::Config("embedding_batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(RagError::Config(format!(
                "hybrid_alpha ({}) must lie in [0, 1]",
                self.hybrid_alpha
            )));
        }
        if self.query_expansion_count < 1 {
            return Err(RagError::Config("query_expansion_count must be >= 1".into()));
        }
        if self.default_top_k == 0 {
            return Err(RagError::Config("default_top_k must be > 0".into()));
        }
        if self.rerank_top_k == 0 {
            return Err(RagError::Config("rerank_top_k must be > 0".into()));
        }
        Ok(())
    }

    /// Directory used for rotated log files, alongside the data stores.
    pub fn log_dir(&self) -> PathBuf {
        self.chunk_store_path
            .parent()
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 1600);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.embedding_dimension, 384);
        assert_eq!(config.hybrid_alpha, 0.7);
        assert_eq!(config.default_top_k, 7);
    }

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let config = RagConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..RagConfig::default()
        };
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn alpha_out_of_range_rejected() {
        let config = RagConfig {
            hybrid_alpha: 1.5,
            ..RagConfig::default()
        };
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn toml_round_trip_with_partial_keys() {
        let raw = r#"
            chunk_size = 800
            chunk_overlap = 80
            hybrid_alpha = 0.5
            execution_provider_preference = "cpu"
        "#;
        let config: RagConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.hybrid_alpha, 0.5);
        assert_eq!(config.execution_provider_preference, ProviderPreference::Cpu);
        // Unspecified keys keep their defaults
        assert_eq!(config.embedding_batch_size, 16);
    }
}
