//! Cross-store append that keeps the chunk store, vector index, and lexical
//! index in identifier lockstep.

use crate::chunk_store::{ChunkStore, NewChunk};
use crate::config::RagConfig;
use crate::error::{RagError, RagResult};
use crate::lexical::LexicalIndex;
use crate::vector_index::{self, VectorIndex};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Single writer per ingest session. The three stores are written in strict
/// sequence inside `add_batch` so that every identifier present anywhere is
/// present everywhere.
pub struct IndexWriter {
    store: ChunkStore,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<LexicalIndex>,
    vector_index_path: PathBuf,
    lexical_index_path: PathBuf,
    dimension: usize,
}

impl IndexWriter {
    pub async fn open(config: &RagConfig) -> RagResult<Self> {
        let store = ChunkStore::open(&config.chunk_store_path).await?;
        let vector =
            vector_index::open_vector_index(&config.vector_index_path, config.embedding_dimension)?;
        let lexical = Arc::new(LexicalIndex::open_or_create(&config.lexical_index_path)?);

        Ok(Self {
            store,
            vector,
            lexical,
            vector_index_path: config.vector_index_path.clone(),
            lexical_index_path: config.lexical_index_path.clone(),
            dimension: config.embedding_dimension,
        })
    }

    pub fn vector_index(&self) -> Arc<dyn VectorIndex> {
        self.vector.clone()
    }

    pub fn lexical_index(&self) -> Arc<LexicalIndex> {
        self.lexical.clone()
    }

    /// Append a batch of chunks with their embeddings.
    ///
    /// Ordering discipline: chunk records first (identifiers materialize in
    /// caller order), then `(id, vector)` pairs, then lexical documents, then
    /// the lexical commit. Returns the assigned identifiers.
    pub async fn add_batch(&self, batch: Vec<(NewChunk, Vec<f32>)>) -> RagResult<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        for (_, vector) in &batch {
            if vector.len() != self.dimension {
                return Err(RagError::DataIntegrity(format!(
                    "embedding dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }

        let (chunks, vectors): (Vec<NewChunk>, Vec<Vec<f32>>) = batch.into_iter().unzip();

        let ids = self.store.insert_batch(&chunks).await?;
        self.vector.add_with_ids(&ids, &vectors)?;

        let docs: Vec<(i64, String)> = ids
            .iter()
            .zip(&chunks)
            .map(|(id, chunk)| (*id, chunk.content.clone()))
            .collect();
        self.lexical.add_batch(&docs).await?;

        debug!(count = ids.len(), first_id = ids.first(), "Batch appended to all three stores");
        Ok(ids)
    }

    /// Persist the vector index; called once at the end of an ingest session
    /// so the on-disk ordering matches identifier order.
    pub fn save_vector_index(&self) -> RagResult<()> {
        self.vector.save(&self.vector_index_path)?;
        info!(path = %self.vector_index_path.display(), count = self.vector.len(), "Vector index saved");
        Ok(())
    }

    /// Replace the in-memory vector index with the persisted state.
    pub fn load_vector_index(&mut self) -> RagResult<()> {
        self.vector =
            vector_index::open_vector_index(&self.vector_index_path, self.dimension)?;
        Ok(())
    }

    pub async fn size(&self) -> RagResult<i64> {
        self.store.count().await
    }

    /// Fresh rebuild: delete the chunk-store file, the vector-index file, and
    /// the lexical directory, then reinitialize empty stores. Identifier
    /// allocation restarts at 1.
    pub async fn reset(&mut self) -> RagResult<()> {
        self.store.reset().await?;

        if self.vector_index_path.exists() {
            std::fs::remove_file(&self.vector_index_path)?;
        }
        self.vector = vector_index::create_vector_index(self.dimension);

        if self.lexical_index_path.exists() {
            std::fs::remove_dir_all(&self.lexical_index_path)?;
        }
        self.lexical = Arc::new(LexicalIndex::open_or_create(&self.lexical_index_path)?);

        info!("All stores reset for fresh rebuild");
        Ok(())
    }
}
