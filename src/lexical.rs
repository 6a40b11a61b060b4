//! BM25 inverted index over chunk content, keyed by chunk identifier.

use crate::error::{RagError, RagResult};
use std::path::{Path, PathBuf};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TantivyDocument, TextFieldIndexing, TextOptions, Value,
    INDEXED, STORED,
};
use tantivy::tokenizer::{Language, LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter};
use tracing::{debug, info};

const ANALYZER_NAME: &str = "chunk_text";
const WRITER_BUFFER_BYTES: usize = 50_000_000;

#[derive(Debug, Clone)]
pub struct LexicalSchema {
    pub chunk_id: Field,
    pub content: Field,
    schema: Schema,
}

impl LexicalSchema {
    fn build() -> Self {
        let mut builder = Schema::builder();

        let chunk_id = builder.add_i64_field("chunk_id", INDEXED | STORED);
        let content_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(ANALYZER_NAME)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();
        let content = builder.add_text_field("content", content_options);

        let schema = builder.build();
        Self {
            chunk_id,
            content,
            schema,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    schema: LexicalSchema,
    /// Serializes writer creation; tantivy allows one writer per index.
    writer_lock: tokio::sync::Mutex<()>,
    dir: PathBuf,
}

impl LexicalIndex {
    pub fn open_or_create(dir: &Path) -> RagResult<Self> {
        let schema_def = LexicalSchema::build();
        std::fs::create_dir_all(dir)?;

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            Index::create_in_dir(dir, schema_def.schema().clone())?
        };
        register_analyzer(&index)?;

        let reader = index.reader()?;
        info!(dir = %dir.display(), docs = reader.searcher().num_docs(), "Opened lexical index");

        Ok(Self {
            index,
            reader,
            schema: schema_def,
            writer_lock: tokio::sync::Mutex::new(()),
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Append one document per `(chunk_id, content)` pair and commit, making
    /// the batch visible to readers. Called once per ingest batch.
    pub async fn add_batch(&self, docs: &[(i64, String)]) -> RagResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let _guard = self.writer_lock.lock().await;

        let mut writer: IndexWriter = self.index.writer(WRITER_BUFFER_BYTES)?;
        for (chunk_id, content) in docs {
            let mut doc = TantivyDocument::new();
            doc.add_i64(self.schema.chunk_id, *chunk_id);
            doc.add_text(self.schema.content, content);
            writer.add_document(doc)?;
        }
        writer.commit()?;
        self.reader.reload()?;
        debug!(count = docs.len(), "Committed lexical batch");
        Ok(())
    }

    /// Top-K BM25 search returning `(chunk_id, score)` pairs. A query that
    /// parses to nothing (stopwords only, empty) yields an empty list.
    pub fn search(&self, query_text: &str, top_k: usize) -> RagResult<Vec<(i64, f32)>> {
        if query_text.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.schema.content]);
        let (query, errors) = parser.parse_query_lenient(query_text);
        if !errors.is_empty() {
            debug!(?errors, "Lenient query parse dropped fragments");
        }

        let hits = searcher.search(&query, &TopDocs::with_limit(top_k))?;
        let mut results = Vec::with_capacity(hits.len());
        for (score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            let chunk_id = doc
                .get_first(self.schema.chunk_id)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    RagError::DataIntegrity("lexical document is missing its chunk_id field".into())
                })?;
            results.push((chunk_id, score));
        }
        Ok(results)
    }
}

fn register_analyzer(index: &Index) -> RagResult<()> {
    let stop_words = StopWordFilter::new(Language::English).ok_or_else(|| {
        RagError::Config("English stopword list unavailable in this tantivy build".into())
    })?;
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(stop_words)
        .build();
    index.tokenizers().register(ANALYZER_NAME, analyzer);
    Ok(())
}
