//! Folder ingest session: walk the corpus, chunk, embed, and append to the
//! three stores in lockstep. Per-file failures are reported as progress
//! events and the session continues; cancellation and configuration errors
//! abort it.

use crate::chunk_store::NewChunk;
use crate::chunker::chunk_text;
use crate::config::{self, RagConfig};
use crate::embedder::TextEmbedder;
use crate::error::{RagError, RagResult};
use crate::index_writer::IndexWriter;
use anyhow::anyhow;
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Progress events consumed by the CLI front end.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum IngestEvent {
    #[serde(rename = "started")]
    Started { total_files: usize },
    #[serde(rename = "file_indexed")]
    FileIndexed { path: String, chunks: usize },
    #[serde(rename = "file_skipped")]
    FileSkipped { path: String, reason: String },
    #[serde(rename = "completed")]
    Completed {
        files: usize,
        chunks: usize,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub chunks_indexed: usize,
    pub duration_ms: u64,
}

pub struct IngestSession {
    config: RagConfig,
    embedder: Arc<dyn TextEmbedder>,
    writer: IndexWriter,
    event_tx: broadcast::Sender<IngestEvent>,
}

impl IngestSession {
    pub async fn open(config: RagConfig, embedder: Arc<dyn TextEmbedder>) -> RagResult<Self> {
        let writer = IndexWriter::open(&config).await?;
        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            embedder,
            writer,
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.event_tx.subscribe()
    }

    /// Ingest every file under `folder`. `fresh` wipes all three stores
    /// first. The cancellation token is checked between files and before
    /// each batch commit; in-flight work completes.
    pub async fn run(
        &mut self,
        folder: &Path,
        fresh: bool,
        cancel: &CancellationToken,
    ) -> RagResult<IngestSummary> {
        if !folder.is_dir() {
            return Err(RagError::Config(format!(
                "ingest folder does not exist: {}",
                folder.display()
            )));
        }
        if fresh {
            info!("Fresh ingest requested, rebuilding all stores");
            self.writer.reset().await?;
        }

        let start = std::time::Instant::now();
        let files = collect_corpus_files(folder);
        info!(total = files.len(), folder = %folder.display(), "Ingest session started");
        let _ = self.event_tx.send(IngestEvent::Started {
            total_files: files.len(),
        });

        // Read + chunk in parallel; embedding and store writes stay
        // sequential so identifier order follows file order.
        let chunk_size = self.config.chunk_size;
        let chunk_overlap = self.config.chunk_overlap;
        let semantic = self.config.enable_semantic_chunking;
        let prepared: Vec<(PathBuf, RagResult<Vec<NewChunk>>)> = files
            .par_iter()
            .map(|path| {
                (
                    path.clone(),
                    prepare_file(path, chunk_size, chunk_overlap, semantic),
                )
            })
            .collect();

        let mut summary = IngestSummary::default();
        for (path, result) in prepared {
            if cancel.is_cancelled() {
                warn!("Ingest cancelled between files");
                return Err(RagError::Cancelled);
            }

            let chunks = match result {
                Ok(chunks) => chunks,
                Err(e) => {
                    summary.files_skipped += 1;
                    warn!(path = %path.display(), error = %e, "Skipping file");
                    let _ = self.event_tx.send(IngestEvent::FileSkipped {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let embedder = self.embedder.clone();
            let vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&contents))
                .await
                .map_err(|e| anyhow!("embedding task failed: {e}"))??;

            if cancel.is_cancelled() {
                warn!("Ingest cancelled before batch commit");
                return Err(RagError::Cancelled);
            }

            let count = chunks.len();
            self.writer
                .add_batch(chunks.into_iter().zip(vectors).collect())
                .await?;

            summary.files_indexed += 1;
            summary.chunks_indexed += count;
            let _ = self.event_tx.send(IngestEvent::FileIndexed {
                path: path.display().to_string(),
                chunks: count,
            });
        }

        // One big commit of the vector index at end of session so the
        // on-disk ordering matches identifier order.
        self.writer.save_vector_index()?;

        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            files = summary.files_indexed,
            skipped = summary.files_skipped,
            chunks = summary.chunks_indexed,
            duration_ms = summary.duration_ms,
            "Ingest session complete"
        );
        let _ = self.event_tx.send(IngestEvent::Completed {
            files: summary.files_indexed,
            chunks: summary.chunks_indexed,
            duration_ms: summary.duration_ms,
        });
        Ok(summary)
    }

    pub async fn size(&self) -> RagResult<i64> {
        self.writer.size().await
    }
}

/// Walk the corpus folder, honoring .gitignore, returning files in a stable
/// order so identifier assignment is reproducible.
fn collect_corpus_files(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkBuilder::new(folder)
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .max_depth(Some(20))
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Read and chunk one corpus file. Formats that need an external extractor
/// (pdf, html, images) and unknown extensions are per-file errors; the
/// session reports them and moves on.
fn prepare_file(
    path: &Path,
    chunk_size: usize,
    chunk_overlap: usize,
    semantic: bool,
) -> RagResult<Vec<NewChunk>> {
    let extension = path
        .extension()
        .unwrap_or_default()
        .to_string_lossy()
        .to_lowercase();

    if config::needs_extractor(&extension) {
        return Err(RagError::UserContent(format!(
            "no extractor available for .{} files",
            extension
        )));
    }
    if !config::is_text_extension(&extension) {
        return Err(RagError::UserContent(format!(
            "unsupported file extension: .{}",
            extension
        )));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| RagError::UserContent(format!("failed to read file: {}", e)))?;
    let pieces = chunk_text(&content, chunk_size, chunk_overlap, semantic);
    if pieces.is_empty() {
        return Err(RagError::UserContent("empty extracted text".into()));
    }

    let total = pieces.len() as i64;
    let source_uri = path.display().to_string();
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, content)| NewChunk {
            content,
            source_uri: source_uri.clone(),
            source_type: extension.clone(),
            chunk_index: i as i64,
            total_chunks: total,
        })
        .collect())
}
