//! Multi-stage query pipeline: expand, retrieve per variant, deduplicate,
//! rerank, assemble context, generate.

use crate::chunk_store::{ChunkRecord, ChunkStore};
use crate::config::RagConfig;
use crate::embedder::{Embedder, TextEmbedder};
use crate::error::{RagError, RagResult};
use crate::execution::ProviderStatus;
use crate::lexical::LexicalIndex;
use crate::llm::LlmClient;
use crate::reranker::Reranker;
use crate::retriever::Retriever;
use crate::vector_index;
use anyhow::anyhow;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PipelineAnswer {
    pub answer: String,
    pub sources: Vec<ChunkRecord>,
    pub variants: Vec<String>,
}

pub struct QueryPipeline {
    embedder: Arc<dyn TextEmbedder>,
    retriever: Arc<Retriever>,
    reranker: Arc<Reranker>,
    llm: Arc<LlmClient>,
    expansion_enabled: bool,
    expansion_count: usize,
    rerank_top_k: usize,
    default_top_k: usize,
}

impl QueryPipeline {
    /// Assemble a retrieval session over the persisted stores. The stores
    /// must exist; a missing chunk store or vector index means no ingest has
    /// run yet.
    pub async fn open(config: &RagConfig, provider: ProviderStatus) -> RagResult<Self> {
        if !config.chunk_store_path.exists() || !config.vector_index_path.exists() {
            return Err(RagError::Resource(format!(
                "no index found at {} / {}; run `ragline ingest <folder>` first",
                config.chunk_store_path.display(),
                config.vector_index_path.display()
            )));
        }

        let embedder: Arc<dyn TextEmbedder> = Arc::new(Embedder::new(config, provider)?);
        let store = ChunkStore::open(&config.chunk_store_path).await?;
        let vector =
            vector_index::open_vector_index(&config.vector_index_path, config.embedding_dimension)?;
        let lexical = Arc::new(LexicalIndex::open_or_create(&config.lexical_index_path)?);
        let retriever = Arc::new(Retriever::new(
            store,
            vector,
            lexical,
            config.enable_hybrid_search,
            config.hybrid_alpha,
        ));
        let reranker = Arc::new(Reranker::new(config, provider)?);
        let llm = Arc::new(LlmClient::new(config)?);

        if let Err(e) = llm.health_check().await {
            warn!(error = %e, endpoint = %config.llm_endpoint, "LLM collaborator unreachable; retrieval will work, generation will fail");
        }

        Ok(Self::new(embedder, retriever, reranker, llm, config))
    }

    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        retriever: Arc<Retriever>,
        reranker: Arc<Reranker>,
        llm: Arc<LlmClient>,
        config: &RagConfig,
    ) -> Self {
        Self {
            embedder,
            retriever,
            reranker,
            llm,
            expansion_enabled: config.enable_query_expansion,
            expansion_count: config.query_expansion_count,
            rerank_top_k: config.rerank_top_k,
            default_top_k: config.default_top_k,
        }
    }

    /// Stages 1-5: expand, retrieve per variant, union, rerank, slice.
    pub async fn retrieve(&self, question: &str, top_k: Option<usize>) -> RagResult<Vec<ChunkRecord>> {
        let variants = self.expand(question).await;
        self.retrieve_variants(question, &variants, top_k).await
    }

    /// Full pipeline including context assembly and answer generation.
    pub async fn answer(&self, question: &str, top_k: Option<usize>) -> RagResult<PipelineAnswer> {
        let variants = self.expand(question).await;
        let sources = self.retrieve_variants(question, &variants, top_k).await?;
        if sources.is_empty() {
            info!("No relevant chunks retrieved");
        }

        let context = build_context(&sources);
        let answer = self.llm.answer(question, &context).await?;
        Ok(PipelineAnswer {
            answer,
            sources,
            variants,
        })
    }

    async fn retrieve_variants(
        &self,
        question: &str,
        variants: &[String],
        top_k: Option<usize>,
    ) -> RagResult<Vec<ChunkRecord>> {
        let user_top_k = top_k.unwrap_or(self.default_top_k);
        debug!(count = variants.len(), "Retrieving for query variants");

        let searches = variants.iter().map(|variant| self.retrieve_variant(variant));
        let per_variant = futures::future::try_join_all(searches).await?;

        let mut candidates = dedup_by_id(per_variant);
        candidates.truncate(self.rerank_top_k);

        let reranker = self.reranker.clone();
        let query = question.to_string();
        let mut reranked = tokio::task::spawn_blocking(move || reranker.rerank(&query, candidates))
            .await
            .map_err(|e| anyhow!("rerank task failed: {e}"))??;

        reranked.truncate(user_top_k);
        Ok(reranked)
    }

    async fn expand(&self, question: &str) -> Vec<String> {
        if !self.expansion_enabled {
            return vec![question.to_string()];
        }
        self.llm.expand_query(question, self.expansion_count).await
    }

    async fn retrieve_variant(&self, variant: &str) -> RagResult<Vec<ChunkRecord>> {
        let embedder = self.embedder.clone();
        let text = variant.to_string();
        let query_vector = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| anyhow!("embed task failed: {e}"))??;
        self.retriever.search(&query_vector, variant, self.rerank_top_k).await
    }
}

/// Concatenate per-variant result lists, keeping the first occurrence of
/// every identifier.
pub fn dedup_by_id(lists: Vec<Vec<ChunkRecord>>) -> Vec<ChunkRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in lists.into_iter().flatten() {
        if seen.insert(record.id) {
            out.push(record);
        }
    }
    out
}

/// `"[Document i]\n<content>\nSource: <basename>\n\n"` per kept chunk.
pub fn build_context(records: &[ChunkRecord]) -> String {
    let mut context = String::new();
    for (i, record) in records.iter().enumerate() {
        context.push_str(&format!(
            "[Document {}]\n{}\nSource: {}\n\n",
            i + 1,
            record.content,
            basename(&record.source_uri)
        ));
    }
    context
}

fn basename(uri: &str) -> &str {
    uri.rsplit(['/', '\\']).next().unwrap_or(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, content: &str, uri: &str) -> ChunkRecord {
        ChunkRecord {
            id,
            content: content.to_string(),
            source_uri: uri.to_string(),
            source_type: "text".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            vector_digest: None,
        }
    }

    #[test]
    fn union_keeps_the_first_occurrence_of_each_identifier() {
        let lists = vec![
            vec![record(1, "a", "x.txt"), record(2, "b", "x.txt")],
            vec![record(2, "b-dup", "x.txt"), record(3, "c", "x.txt")],
            vec![record(1, "a-dup", "x.txt")],
        ];
        let merged = dedup_by_id(lists);
        let ids: Vec<i64> = merged.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged[1].content, "b");
    }

    #[test]
    fn context_layout_is_exact() {
        let records = vec![
            record(1, "alpha content", "corpus/notes/alpha.md"),
            record(2, "beta content", "beta.txt"),
        ];
        let context = build_context(&records);
        assert_eq!(
            context,
            "[Document 1]\nalpha content\nSource: alpha.md\n\n\
             [Document 2]\nbeta content\nSource: beta.txt\n\n"
        );
    }

    #[test]
    fn basename_handles_both_separators() {
        assert_eq!(basename("a/b/c.txt"), "c.txt");
        assert_eq!(basename("a\\b\\c.txt"), "c.txt");
        assert_eq!(basename("plain.txt"), "plain.txt");
    }

    #[tokio::test]
    async fn retrieval_stages_run_end_to_end_over_ingested_stores() {
        use crate::embedder::testing::HashEmbedder;
        use crate::execution::SelectedProvider;
        use crate::ingest::IngestSession;
        use tokio_util::sync::CancellationToken;

        let root = tempfile::tempdir().unwrap();
        let corpus = root.path().join("corpus");
        std::fs::create_dir_all(&corpus).unwrap();
        std::fs::write(corpus.join("solar.txt"), "Solar panels convert sunlight into power.")
            .unwrap();
        std::fs::write(corpus.join("wind.txt"), "Wind turbines harvest kinetic energy.").unwrap();

        let config = RagConfig {
            chunk_store_path: root.path().join("data/chunks.db"),
            vector_index_path: root.path().join("data/vectors.idx"),
            lexical_index_path: root.path().join("data/lexical"),
            embedding_dimension: 16,
            enable_query_expansion: false,
            enable_reranking: false,
            ..RagConfig::default()
        };

        let embedder = Arc::new(HashEmbedder { dimension: 16 });
        let mut session = IngestSession::open(config.clone(), embedder.clone()).await.unwrap();
        session
            .run(&corpus, false, &CancellationToken::new())
            .await
            .unwrap();
        drop(session);

        let store = ChunkStore::open(&config.chunk_store_path).await.unwrap();
        let vector = vector_index::open_vector_index(
            &config.vector_index_path,
            config.embedding_dimension,
        )
        .unwrap();
        let lexical = Arc::new(LexicalIndex::open_or_create(&config.lexical_index_path).unwrap());
        let retriever = Arc::new(Retriever::new(
            store,
            vector,
            lexical,
            config.enable_hybrid_search,
            config.hybrid_alpha,
        ));
        let provider = ProviderStatus {
            provider: SelectedProvider::Cpu,
            using_gpu: false,
            fallback_to_cpu: false,
        };
        let reranker = Arc::new(Reranker::new(&config, provider).unwrap());
        let llm = Arc::new(LlmClient::new(&config).unwrap());
        let pipeline = QueryPipeline::new(embedder, retriever, reranker, llm, &config);

        let results = pipeline
            .retrieve("Solar panels convert sunlight into power.", Some(2))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 2);
        assert!(results[0].content.contains("Solar"));

        let mut ids: Vec<i64> = results.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
    }
}
