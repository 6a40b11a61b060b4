//! Text embedding: WordPiece encode, ONNX session run, masked mean pool,
//! L2 normalize.

use crate::config::RagConfig;
use crate::error::{RagError, RagResult};
use crate::execution::{self, ProviderStatus, INTERNAL_RETRY};
use crate::tokenizer::WordPieceTokenizer;
use once_cell::sync::OnceCell;
use ort::session::Session;
use ort::value::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

const NORM_EPSILON: f32 = 1e-12;

/// The embedding seam: `embed` / `embed_batch` with a fixed output dimension
/// and unit-normalized vectors.
pub trait TextEmbedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> RagResult<Vec<f32>>;
    fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;
}

pub struct Embedder {
    /// Lazy-loaded ONNX session; `run()` needs `&mut`, hence the Mutex.
    session: OnceCell<Mutex<Session>>,
    tokenizer: Arc<WordPieceTokenizer>,
    model_path: PathBuf,
    provider: ProviderStatus,
    dimension: usize,
    batch_size: usize,
}

impl Embedder {
    pub fn new(config: &RagConfig, provider: ProviderStatus) -> RagResult<Self> {
        let model_path = config.embedding_model_path.clone();
        if !model_path.exists() {
            return Err(RagError::Resource(format!(
                "embedding model not found: {} (set embedding_model_path or download the model)",
                model_path.display()
            )));
        }
        let model_dir = model_path
            .parent()
            .ok_or_else(|| RagError::Config("embedding_model_path has no parent directory".into()))?;
        let tokenizer = Arc::new(WordPieceTokenizer::from_pretrained(model_dir, None)?);
        info!(
            model = %model_path.display(),
            vocab = tokenizer.vocab_size(),
            max_seq_len = tokenizer.max_seq_len(),
            "Embedder ready"
        );

        Ok(Self {
            session: OnceCell::new(),
            tokenizer,
            model_path,
            provider,
            dimension: config.embedding_dimension,
            batch_size: config.embedding_batch_size,
        })
    }

    pub fn tokenizer(&self) -> Arc<WordPieceTokenizer> {
        self.tokenizer.clone()
    }

    fn session(&self) -> RagResult<&Mutex<Session>> {
        self.session.get_or_try_init(|| {
            execution::build_session(&self.model_path, self.provider).map(Mutex::new)
        })
    }

    fn run_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch = texts.len();
        let seq_len = self.tokenizer.max_seq_len();

        let mut input_ids = Vec::with_capacity(batch * seq_len);
        let mut attention_mask = Vec::with_capacity(batch * seq_len);
        let mut token_type_ids = Vec::with_capacity(batch * seq_len);
        for text in texts {
            let encoding = self.tokenizer.encode(text);
            input_ids.extend_from_slice(&encoding.input_ids);
            attention_mask.extend_from_slice(&encoding.attention_mask);
            token_type_ids.extend_from_slice(&encoding.token_type_ids);
        }

        let ids_tensor = Value::from_array(([batch, seq_len], input_ids))?;
        let mask_tensor = Value::from_array(([batch, seq_len], attention_mask.clone()))?;
        let type_tensor = Value::from_array(([batch, seq_len], token_type_ids))?;

        let mut session = self
            .session()?
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session.run(ort::inputs![
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
            "token_type_ids" => type_tensor,
        ])?;

        let (_shape, hidden) = outputs["last_hidden_state"].try_extract_tensor::<f32>()?;
        let hidden_dim = hidden.len() / (batch * seq_len);
        if hidden_dim != self.dimension {
            return Err(RagError::DataIntegrity(format!(
                "model hidden size {} does not match configured embedding_dimension {}",
                hidden_dim, self.dimension
            )));
        }

        let mut vectors = Vec::with_capacity(batch);
        for i in 0..batch {
            let example = &hidden[i * seq_len * hidden_dim..(i + 1) * seq_len * hidden_dim];
            let mask = &attention_mask[i * seq_len..(i + 1) * seq_len];
            let mut pooled = masked_mean_pool(example, mask, hidden_dim);
            l2_normalize(&mut pooled);
            vectors.push(pooled);
        }
        Ok(vectors)
    }
}

impl TextEmbedder for Embedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let single = [text.to_string()];
        let mut vectors = self.embed_batch(&single)?;
        vectors
            .pop()
            .ok_or_else(|| RagError::DataIntegrity("embedding batch returned no vector".into()))
    }

    /// Embed texts in fixed-size batches, each batch under the internal
    /// retry policy.
    fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors =
                execution::retry_blocking(INTERNAL_RETRY, "embed_batch", || self.run_batch(batch))?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Attention-weighted mean over the sequence axis. An all-zero mask yields
/// the zero vector, which is then left unnormalized.
pub fn masked_mean_pool(hidden: &[f32], mask: &[i64], hidden_dim: usize) -> Vec<f32> {
    let seq_len = mask.len();
    let mut sum = vec![0.0f32; hidden_dim];
    let mut mask_total = 0.0f32;
    for t in 0..seq_len {
        let m = mask[t] as f32;
        if m == 0.0 {
            continue;
        }
        mask_total += m;
        let row = &hidden[t * hidden_dim..(t + 1) * hidden_dim];
        for (acc, value) in sum.iter_mut().zip(row) {
            *acc += value * m;
        }
    }
    let denom = mask_total.max(1.0);
    for value in &mut sum {
        *value /= denom;
    }
    sum
}

/// Divide by the L2 norm with an epsilon floor; the zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    let inv = 1.0 / norm.max(NORM_EPSILON);
    for value in v.iter_mut() {
        *value *= inv;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_averages_only_unmasked_positions() {
        // seq_len = 3, hidden_dim = 2; position 2 is padding
        let hidden = [1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let mask = [1i64, 1, 0];
        let pooled = masked_mean_pool(&hidden, &mask, 2);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn all_zero_mask_yields_zero_vector() {
        let hidden = [5.0, 5.0, 5.0, 5.0];
        let mask = [0i64, 0];
        let mut pooled = masked_mean_pool(&hidden, &mask, 2);
        assert_eq!(pooled, vec![0.0, 0.0]);
        l2_normalize(&mut pooled);
        assert_eq!(pooled, vec![0.0, 0.0]);
    }

    #[test]
    fn normalized_vectors_have_unit_norm() {
        let mut v = vec![3.0, 4.0, 0.0, 0.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn pooling_with_full_mask_matches_plain_mean() {
        let hidden = [1.0, 0.0, 3.0, 0.0];
        let mask = [1i64, 1];
        let pooled = masked_mean_pool(&hidden, &mask, 2);
        assert_eq!(pooled, vec![2.0, 0.0]);
    }
}
