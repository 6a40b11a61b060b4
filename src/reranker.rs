//! Cross-encoder reranking: joint `(query, chunk)` scoring for the precision
//! stage of the query pipeline.

use crate::chunk_store::ChunkRecord;
use crate::config::RagConfig;
use crate::error::{RagError, RagResult};
use crate::execution::{self, ProviderStatus};
use crate::tokenizer::WordPieceTokenizer;
use once_cell::sync::OnceCell;
use ort::session::Session;
use ort::value::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct Reranker {
    session: OnceCell<Mutex<Session>>,
    tokenizer: Option<Arc<WordPieceTokenizer>>,
    model_path: PathBuf,
    provider: ProviderStatus,
    enabled: bool,
}

impl Reranker {
    /// A disabled reranker (config flag off, or model file absent) is not an
    /// error; it degrades to an identity pass.
    pub fn new(config: &RagConfig, provider: ProviderStatus) -> RagResult<Self> {
        let model_path = config.reranker_model_path.clone();
        let enabled = config.enable_reranking && model_path.exists();

        if config.enable_reranking && !model_path.exists() {
            warn!(
                model = %model_path.display(),
                "Reranker model not found, reranking disabled for this session"
            );
        }

        let tokenizer = if enabled {
            let model_dir = model_path.parent().ok_or_else(|| {
                RagError::Config("reranker_model_path has no parent directory".into())
            })?;
            let tokenizer = Arc::new(WordPieceTokenizer::from_pretrained(model_dir, None)?);
            info!(
                model = %model_path.display(),
                vocab = tokenizer.vocab_size(),
                "Reranker ready"
            );
            Some(tokenizer)
        } else {
            None
        };

        Ok(Self {
            session: OnceCell::new(),
            tokenizer,
            model_path,
            provider,
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn session(&self) -> RagResult<&Mutex<Session>> {
        self.session.get_or_try_init(|| {
            execution::build_session(&self.model_path, self.provider).map(Mutex::new)
        })
    }

    /// Sort records by descending cross-encoder score. Disabled sessions
    /// return the input ordering unchanged.
    pub fn rerank(&self, query: &str, records: Vec<ChunkRecord>) -> RagResult<Vec<ChunkRecord>> {
        if !self.enabled || records.len() < 2 {
            return Ok(records);
        }
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| RagError::DataIntegrity("enabled reranker has no tokenizer".into()))?;

        let mut scored = Vec::with_capacity(records.len());
        for record in records {
            let score = self.score_pair(tokenizer, query, &record.content)?;
            scored.push((score, record));
        }
        // Stable sort keeps the incoming order for equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().map(|(_, record)| record).collect())
    }

    fn score_pair(
        &self,
        tokenizer: &WordPieceTokenizer,
        query: &str,
        content: &str,
    ) -> RagResult<f32> {
        let seq_len = tokenizer.max_seq_len();
        let encoding = tokenizer.encode_pair(query, content);

        let ids_tensor = Value::from_array(([1usize, seq_len], encoding.input_ids))?;
        let mask_tensor = Value::from_array(([1usize, seq_len], encoding.attention_mask))?;
        let type_tensor = Value::from_array(([1usize, seq_len], encoding.token_type_ids))?;

        let mut session = self
            .session()?
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session.run(ort::inputs![
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
            "token_type_ids" => type_tensor,
        ])?;

        // Scalar relevance logit at [0, 0].
        let (_shape, logits) = outputs[0].try_extract_tensor::<f32>()?;
        logits.first().copied().ok_or_else(|| {
            RagError::DataIntegrity("reranker session produced an empty logit tensor".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SelectedProvider;

    fn cpu_provider() -> ProviderStatus {
        ProviderStatus {
            provider: SelectedProvider::Cpu,
            using_gpu: false,
            fallback_to_cpu: false,
        }
    }

    fn record(id: i64, content: &str) -> ChunkRecord {
        ChunkRecord {
            id,
            content: content.to_string(),
            source_uri: "doc.txt".to_string(),
            source_type: "text".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            vector_digest: None,
        }
    }

    #[test]
    fn disabled_reranker_preserves_input_order() {
        let config = RagConfig {
            enable_reranking: false,
            ..RagConfig::default()
        };
        let reranker = Reranker::new(&config, cpu_provider()).unwrap();
        assert!(!reranker.is_enabled());

        let input = vec![record(3, "c"), record(1, "a"), record(2, "b")];
        let output = reranker.rerank("query", input.clone()).unwrap();
        let ids: Vec<i64> = output.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn missing_model_degrades_to_identity() {
        let config = RagConfig {
            enable_reranking: true,
            reranker_model_path: std::path::PathBuf::from("/nonexistent/model.onnx"),
            ..RagConfig::default()
        };
        let reranker = Reranker::new(&config, cpu_provider()).unwrap();
        assert!(!reranker.is_enabled());
    }
}
