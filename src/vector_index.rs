//! Identifier-keyed dense vector index behind a single interface.
//!
//! Two variants: the native HNSW index (usearch, inner-product metric) and a
//! portable exhaustive flat index with a versioned little-endian file format.
//! The two on-disk formats are incompatible; switching variants requires a
//! fresh rebuild.

use crate::error::{RagError, RagResult};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Identifier used to pad result slots when fewer than K records match.
pub const VECTOR_ID_SENTINEL: i64 = -1;

/// Top-K results per query: `scores[q][k]` / `ids[q][k]`, descending by
/// inner product, padded with score 0.0 and the sentinel id.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchResult {
    pub scores: Vec<Vec<f32>>,
    pub ids: Vec<Vec<i64>>,
}

pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Exclusive append of `(id, vector)` pairs.
    fn add_with_ids(&self, ids: &[i64], vectors: &[Vec<f32>]) -> RagResult<()>;
    fn search(&self, queries: &[Vec<f32>], top_k: usize) -> RagResult<VectorSearchResult>;
    /// Total replacement of the on-disk state; concurrent searches keep
    /// seeing the pre-save in-memory state.
    fn save(&self, path: &Path) -> RagResult<()>;
}

fn check_batch(dimension: usize, ids: &[i64], vectors: &[Vec<f32>]) -> RagResult<()> {
    if ids.len() != vectors.len() {
        return Err(RagError::DataIntegrity(format!(
            "id/vector count mismatch: {} ids, {} vectors",
            ids.len(),
            vectors.len()
        )));
    }
    for v in vectors {
        if v.len() != dimension {
            return Err(RagError::DataIntegrity(format!(
                "vector dimension {} does not match index dimension {}",
                v.len(),
                dimension
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Portable variant: exhaustive inner product over a dense in-memory list
// ---------------------------------------------------------------------------

const FLAT_FORMAT_VERSION: u32 = 1;

#[derive(Default)]
struct FlatState {
    ids: Vec<i64>,
    // Dense row-major storage, `ids.len() * dimension` components.
    vectors: Vec<f32>,
}

pub struct FlatVectorIndex {
    dimension: usize,
    state: RwLock<FlatState>,
}

impl FlatVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(FlatState::default()),
        }
    }

    /// Parse the versioned binary format:
    /// `u32 version=1 | u32 dimension | u32 count | count x (i64 id, f32[dim])`.
    pub fn load(path: &Path) -> RagResult<Self> {
        let bytes = std::fs::read(path)?;
        let mut cursor = 0usize;
        let mut read_u32 = |bytes: &[u8]| -> RagResult<u32> {
            let end = cursor + 4;
            let slice = bytes.get(cursor..end).ok_or_else(|| {
                RagError::DataIntegrity(format!("truncated vector index file: {}", path.display()))
            })?;
            cursor = end;
            Ok(u32::from_le_bytes(slice.try_into().unwrap()))
        };

        let version = read_u32(&bytes)?;
        if version != FLAT_FORMAT_VERSION {
            return Err(RagError::DataIntegrity(format!(
                "{}: unsupported vector index format version {} (expected {}); \
                 delete the file and rebuild with a fresh ingest",
                path.display(),
                version,
                FLAT_FORMAT_VERSION
            )));
        }
        let dimension = read_u32(&bytes)? as usize;
        let count = read_u32(&bytes)? as usize;

        let record_len = 8 + dimension * 4;
        let expected = 12 + count * record_len;
        if bytes.len() != expected {
            return Err(RagError::DataIntegrity(format!(
                "{}: expected {} bytes for {} records, found {}",
                path.display(),
                expected,
                count,
                bytes.len()
            )));
        }

        let mut ids = Vec::with_capacity(count);
        let mut vectors = Vec::with_capacity(count * dimension);
        let mut offset = 12usize;
        for _ in 0..count {
            ids.push(i64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()));
            offset += 8;
            for _ in 0..dimension {
                vectors.push(f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()));
                offset += 4;
            }
        }

        Ok(Self {
            dimension,
            state: RwLock::new(FlatState { ids, vectors }),
        })
    }
}

impl VectorIndex for FlatVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.state.read().ids.len()
    }

    fn add_with_ids(&self, ids: &[i64], vectors: &[Vec<f32>]) -> RagResult<()> {
        check_batch(self.dimension, ids, vectors)?;
        let mut state = self.state.write();
        state.ids.extend_from_slice(ids);
        for v in vectors {
            state.vectors.extend_from_slice(v);
        }
        Ok(())
    }

    fn search(&self, queries: &[Vec<f32>], top_k: usize) -> RagResult<VectorSearchResult> {
        let state = self.state.read();
        let mut scores = Vec::with_capacity(queries.len());
        let mut ids = Vec::with_capacity(queries.len());

        for query in queries {
            if query.len() != self.dimension {
                return Err(RagError::DataIntegrity(format!(
                    "query dimension {} does not match index dimension {}",
                    query.len(),
                    self.dimension
                )));
            }
            if state.ids.is_empty() {
                scores.push(Vec::new());
                ids.push(Vec::new());
                continue;
            }

            let mut scored: Vec<(f32, i64)> = state
                .ids
                .iter()
                .enumerate()
                .map(|(row, &id)| {
                    let base = row * self.dimension;
                    let dot = state.vectors[base..base + self.dimension]
                        .iter()
                        .zip(query.iter())
                        .map(|(a, b)| a * b)
                        .sum::<f32>();
                    (dot, id)
                })
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            let mut q_scores: Vec<f32> = scored.iter().map(|(s, _)| *s).collect();
            let mut q_ids: Vec<i64> = scored.iter().map(|(_, id)| *id).collect();
            q_scores.resize(top_k, 0.0);
            q_ids.resize(top_k, VECTOR_ID_SENTINEL);
            scores.push(q_scores);
            ids.push(q_ids);
        }

        Ok(VectorSearchResult { scores, ids })
    }

    fn save(&self, path: &Path) -> RagResult<()> {
        let state = self.state.write();
        let count = state.ids.len();

        let mut bytes = Vec::with_capacity(12 + count * (8 + self.dimension * 4));
        bytes.extend_from_slice(&FLAT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(count as u32).to_le_bytes());
        for (row, id) in state.ids.iter().enumerate() {
            bytes.extend_from_slice(&id.to_le_bytes());
            let base = row * self.dimension;
            for component in &state.vectors[base..base + self.dimension] {
                bytes.extend_from_slice(&component.to_le_bytes());
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crashed save never leaves a torn file.
        let tmp = path.with_extension("idx.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Native variant: usearch HNSW with inner-product metric
// ---------------------------------------------------------------------------

#[cfg(feature = "hnsw")]
mod hnsw {
    use super::*;
    use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

    const INITIAL_CAPACITY: usize = 65_536;

    pub struct HnswVectorIndex {
        dimension: usize,
        inner: RwLock<usearch::Index>,
    }

    impl HnswVectorIndex {
        pub fn try_new(dimension: usize) -> RagResult<Self> {
            let options = IndexOptions {
                dimensions: dimension,
                metric: MetricKind::IP,
                quantization: ScalarKind::F32,
                connectivity: 16,
                expansion_add: 128,
                expansion_search: 64,
                multi: false,
            };
            let index = usearch::Index::new(&options).map_err(|e| {
                RagError::Resource(format!("failed to initialize native vector index: {}", e))
            })?;
            index.reserve(INITIAL_CAPACITY).map_err(|e| {
                RagError::Resource(format!("failed to reserve native index capacity: {}", e))
            })?;
            Ok(Self {
                dimension,
                inner: RwLock::new(index),
            })
        }

        pub fn load(path: &Path, dimension: usize) -> RagResult<Self> {
            // A file written by the portable variant must not be fed to the
            // native loader; its layout begins with the flat format magic.
            if is_flat_format_file(path)? {
                return Err(RagError::DataIntegrity(format!(
                    "{}: file was written by the portable vector index; \
                     delete it (with the chunk store and lexical index) and rebuild fresh",
                    path.display()
                )));
            }
            let index = Self::try_new(dimension)?;
            {
                let guard = index.inner.write();
                guard
                    .load(path.to_string_lossy().as_ref())
                    .map_err(|e| RagError::DataIntegrity(format!("{}: {}", path.display(), e)))?;
            }
            Ok(index)
        }
    }

    fn is_flat_format_file(path: &Path) -> RagResult<bool> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 12 {
            return Ok(false);
        }
        let version = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let dimension = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        Ok(version == FLAT_FORMAT_VERSION && bytes.len() == 12 + count * (8 + dimension * 4))
    }

    impl VectorIndex for HnswVectorIndex {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn len(&self) -> usize {
            self.inner.read().size()
        }

        fn add_with_ids(&self, ids: &[i64], vectors: &[Vec<f32>]) -> RagResult<()> {
            check_batch(self.dimension, ids, vectors)?;
            let index = self.inner.write();
            let needed = index.size() + ids.len();
            if needed > index.capacity() {
                index
                    .reserve((needed * 2).max(INITIAL_CAPACITY))
                    .map_err(|e| RagError::Resource(format!("vector index reserve failed: {}", e)))?;
            }
            for (id, vector) in ids.iter().zip(vectors) {
                if *id < 0 {
                    return Err(RagError::DataIntegrity(format!(
                        "negative identifier {} cannot be stored in the native index",
                        id
                    )));
                }
                index
                    .add(*id as u64, vector)
                    .map_err(|e| RagError::DataIntegrity(format!("vector add failed: {}", e)))?;
            }
            Ok(())
        }

        fn search(&self, queries: &[Vec<f32>], top_k: usize) -> RagResult<VectorSearchResult> {
            let index = self.inner.read();
            let mut scores = Vec::with_capacity(queries.len());
            let mut ids = Vec::with_capacity(queries.len());

            for query in queries {
                if query.len() != self.dimension {
                    return Err(RagError::DataIntegrity(format!(
                        "query dimension {} does not match index dimension {}",
                        query.len(),
                        self.dimension
                    )));
                }
                let matches = index
                    .search(query, top_k)
                    .map_err(|e| RagError::DataIntegrity(format!("vector search failed: {}", e)))?;

                // usearch reports IP distance; convert back to similarity so
                // both variants rank identically on unit vectors.
                let mut q_scores: Vec<f32> =
                    matches.distances.iter().map(|d| 1.0 - d).collect();
                let mut q_ids: Vec<i64> = matches.keys.iter().map(|k| *k as i64).collect();
                q_scores.resize(top_k, 0.0);
                q_ids.resize(top_k, VECTOR_ID_SENTINEL);
                scores.push(q_scores);
                ids.push(q_ids);
            }

            Ok(VectorSearchResult { scores, ids })
        }

        fn save(&self, path: &Path) -> RagResult<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let index = self.inner.write();
            index
                .save(path.to_string_lossy().as_ref())
                .map_err(|e| RagError::TransientIo(format!("vector index save failed: {}", e)))
        }
    }
}

#[cfg(feature = "hnsw")]
pub use hnsw::HnswVectorIndex;

// ---------------------------------------------------------------------------
// Startup resolver
// ---------------------------------------------------------------------------

/// Create an empty index, preferring the native variant and falling back to
/// the portable one when the native bindings cannot initialize.
pub fn create_vector_index(dimension: usize) -> Arc<dyn VectorIndex> {
    #[cfg(feature = "hnsw")]
    {
        match HnswVectorIndex::try_new(dimension) {
            Ok(index) => {
                info!(dimension, backend = "hnsw", "Created vector index");
                return Arc::new(index);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Native vector index unavailable, using portable flat index");
            }
        }
    }
    info!(dimension, backend = "flat", "Created vector index");
    Arc::new(FlatVectorIndex::new(dimension))
}

/// Open an existing index file with the resolved variant, or create an empty
/// index when no file exists yet.
pub fn open_vector_index(path: &Path, dimension: usize) -> RagResult<Arc<dyn VectorIndex>> {
    if !path.exists() {
        return Ok(create_vector_index(dimension));
    }

    #[cfg(feature = "hnsw")]
    {
        match HnswVectorIndex::load(path, dimension) {
            Ok(index) => {
                info!(path = %path.display(), count = index.len(), backend = "hnsw", "Loaded vector index");
                return Ok(Arc::new(index));
            }
            Err(e @ RagError::DataIntegrity(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Native vector index unavailable, trying portable loader");
            }
        }
    }

    let index = FlatVectorIndex::load(path)?;
    if index.dimension() != dimension {
        return Err(RagError::DataIntegrity(format!(
            "{}: index dimension {} does not match configured embedding_dimension {}",
            path.display(),
            index.dimension(),
            dimension
        )));
    }
    info!(path = %path.display(), count = index.len(), backend = "flat", "Loaded vector index");
    Ok(Arc::new(index))
}
