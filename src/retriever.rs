//! Hybrid retrieval: vector and lexical sub-searches fused with Reciprocal
//! Rank Fusion, materialized into chunk records.

use crate::chunk_store::{ChunkRecord, ChunkStore};
use crate::error::RagResult;
use crate::lexical::LexicalIndex;
use crate::vector_index::{VectorIndex, VECTOR_ID_SENTINEL};
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fixed RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

pub struct Retriever {
    store: ChunkStore,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<LexicalIndex>,
    hybrid: bool,
    alpha: f64,
}

impl Retriever {
    pub fn new(
        store: ChunkStore,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<LexicalIndex>,
        hybrid: bool,
        alpha: f32,
    ) -> Self {
        Self {
            store,
            vector,
            lexical,
            hybrid,
            alpha: alpha as f64,
        }
    }

    /// Top-K retrieval for one query. Hybrid mode fans out vector and
    /// lexical sub-searches concurrently and fuses their rankings; otherwise
    /// vector-only.
    pub async fn search(
        &self,
        query_vector: &[f32],
        query_text: &str,
        top_k: usize,
    ) -> RagResult<Vec<ChunkRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if !self.hybrid {
            let ids = self.vector_sub_search(query_vector.to_vec(), top_k).await?;
            return self.store.get_many(&ids).await;
        }

        // Over-fetch both sides so fusion has candidates to promote.
        let fetch = top_k * 2;
        let vector_task = self.vector_sub_search(query_vector.to_vec(), fetch);
        let lexical_task = self.lexical_sub_search(query_text.to_string(), fetch);
        let (vector_ids, lexical_ids) = tokio::try_join!(vector_task, lexical_task)?;

        // Materialize both lists; identifiers deleted since retrieval simply
        // drop out here.
        let vector_records = self.store.get_many(&vector_ids).await?;
        let lexical_records = self.store.get_many(&lexical_ids).await?;

        let vector_ranked: Vec<i64> = vector_records.iter().map(|r| r.id).collect();
        let lexical_ranked: Vec<i64> = lexical_records.iter().map(|r| r.id).collect();
        let fused = rrf_fuse(&vector_ranked, &lexical_ranked, self.alpha, top_k);

        // Union by identifier, first occurrence wins for the record.
        let mut by_id: HashMap<i64, ChunkRecord> = HashMap::new();
        for record in vector_records.into_iter().chain(lexical_records) {
            by_id.entry(record.id).or_insert(record);
        }

        debug!(
            vector = vector_ranked.len(),
            lexical = lexical_ranked.len(),
            fused = fused.len(),
            "Hybrid search fused"
        );
        Ok(fused.into_iter().filter_map(|id| by_id.remove(&id)).collect())
    }

    async fn vector_sub_search(&self, query: Vec<f32>, top_k: usize) -> RagResult<Vec<i64>> {
        let index = self.vector.clone();
        let result = tokio::task::spawn_blocking(move || index.search(&[query], top_k))
            .await
            .map_err(|e| anyhow!("vector search task failed: {e}"))??;
        Ok(result
            .ids
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != VECTOR_ID_SENTINEL)
            .collect())
    }

    async fn lexical_sub_search(&self, query: String, top_k: usize) -> RagResult<Vec<i64>> {
        let index = self.lexical.clone();
        let hits = tokio::task::spawn_blocking(move || index.search(&query, top_k))
            .await
            .map_err(|e| anyhow!("lexical search task failed: {e}"))??;
        Ok(hits.into_iter().map(|(id, _)| id).collect())
    }
}

/// Reciprocal Rank Fusion over two ranked identifier lists:
/// `s(i) = alpha / (k + rank_v(i) + 1) + (1 - alpha) / (k + rank_l(i) + 1)`.
/// Identifiers whose fused score is zero (degenerate alpha) are dropped, so
/// `alpha = 1` collapses to the vector ranking and `alpha = 0` to the
/// lexical ranking with no special-casing.
pub fn rrf_fuse(vector_ranked: &[i64], lexical_ranked: &[i64], alpha: f64, top_k: usize) -> Vec<i64> {
    let mut scores: HashMap<i64, f64> = HashMap::new();
    for (rank, id) in vector_ranked.iter().enumerate() {
        *scores.entry(*id).or_default() += alpha / (RRF_K + rank as f64 + 1.0);
    }
    for (rank, id) in lexical_ranked.iter().enumerate() {
        *scores.entry(*id).or_default() += (1.0 - alpha) / (RRF_K + rank as f64 + 1.0);
    }

    let mut fused: Vec<(i64, f64)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.truncate(top_k);
    fused.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::NewChunk;
    use crate::vector_index::FlatVectorIndex;

    #[test]
    fn fusion_matches_the_worked_example() {
        // alpha = 0.7: s(1) = 0.7/61 + 0.3/63, s(3) = 0.7/63 + 0.3/61,
        // s(2) = 0.7/62, s(4) = 0.3/62 => [1, 3, 2]
        let fused = rrf_fuse(&[1, 2, 3], &[3, 4, 1], 0.7, 3);
        assert_eq!(fused, vec![1, 3, 2]);
    }

    #[test]
    fn alpha_one_is_exactly_the_vector_ranking() {
        let fused = rrf_fuse(&[5, 9, 2, 7], &[2, 8, 5], 1.0, 3);
        assert_eq!(fused, vec![5, 9, 2]);
    }

    #[test]
    fn alpha_zero_is_exactly_the_lexical_ranking() {
        let fused = rrf_fuse(&[5, 9, 2, 7], &[2, 8, 5], 0.0, 3);
        assert_eq!(fused, vec![2, 8, 5]);

        // Vector-only identifiers must not pad out a short lexical list.
        let fused = rrf_fuse(&[5, 9], &[2], 0.0, 3);
        assert_eq!(fused, vec![2]);
    }

    #[test]
    fn fused_results_never_repeat_an_identifier() {
        let fused = rrf_fuse(&[1, 2, 3], &[3, 2, 1], 0.5, 10);
        let mut unique = fused.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), fused.len());
    }

    async fn seeded_retriever(
        dir: &std::path::Path,
        hybrid: bool,
        alpha: f32,
        with_lexical_docs: bool,
    ) -> Retriever {
        let store = ChunkStore::open(&dir.join("chunks.db")).await.unwrap();
        let contents = ["solar power generation", "wind turbine output", "battery storage cells"];
        store
            .insert_batch(
                &contents
                    .iter()
                    .map(|c| NewChunk {
                        content: c.to_string(),
                        source_uri: "doc.txt".to_string(),
                        source_type: "text".to_string(),
                        chunk_index: 0,
                        total_chunks: 1,
                    })
                    .collect::<Vec<_>>(),
            )
            .await
            .unwrap();

        let vector = FlatVectorIndex::new(4);
        vector
            .add_with_ids(
                &[1, 2, 3],
                &[
                    vec![1.0, 0.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0, 0.0],
                    vec![0.0, 0.0, 1.0, 0.0],
                ],
            )
            .unwrap();

        let lexical = Arc::new(LexicalIndex::open_or_create(&dir.join("lexical")).unwrap());
        if with_lexical_docs {
            lexical
                .add_batch(
                    &contents
                        .iter()
                        .enumerate()
                        .map(|(i, c)| (i as i64 + 1, c.to_string()))
                        .collect::<Vec<_>>(),
                )
                .await
                .unwrap();
        }

        Retriever::new(store, Arc::new(vector), lexical, hybrid, alpha)
    }

    #[tokio::test]
    async fn hybrid_search_returns_materialized_records() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = seeded_retriever(dir.path(), true, 0.7, true).await;

        let records = retriever
            .search(&[0.0, 1.0, 0.0, 0.0], "wind turbine output", 2)
            .await
            .unwrap();
        assert!(!records.is_empty());
        assert!(records.len() <= 2);
        assert_eq!(records[0].id, 2);

        let mut ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), records.len());
    }

    #[tokio::test]
    async fn hybrid_with_empty_lexical_index_falls_back_to_vector_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = seeded_retriever(dir.path(), true, 0.7, false).await;

        let records = retriever
            .search(&[0.0, 0.0, 1.0, 0.0], "battery storage cells", 2)
            .await
            .unwrap();
        assert_eq!(records[0].id, 3);
    }

    #[tokio::test]
    async fn vector_only_mode_ignores_the_lexical_index() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = seeded_retriever(dir.path(), false, 0.7, true).await;

        let records = retriever
            .search(&[1.0, 0.0, 0.0, 0.0], "battery storage cells", 1)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 1);
    }

    #[tokio::test]
    async fn result_length_is_bounded_by_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = seeded_retriever(dir.path(), true, 0.5, true).await;

        let records = retriever
            .search(&[1.0, 0.0, 0.0, 0.0], "solar wind battery", 2)
            .await
            .unwrap();
        assert!(records.len() <= 2);
    }
}
