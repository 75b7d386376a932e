//! Lexical BM25 retrieval over the docstore's leaf text.
//!
//! Uses an in-memory tantivy index with the English stemming tokenizer. The
//! index is rebuilt from the docstore on construction, so nothing extra is
//! persisted.

use super::{QueryBundle, Retriever};
use crate::index::DocumentStore;
use crate::node::Candidate;
use async_trait::async_trait;
use ragweave_core::RagError;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{Index, IndexReader, IndexWriter, doc};
use tracing::{debug, warn};

pub struct Bm25Retriever {
    index: Index,
    reader: IndexReader,
    id_field: Field,
    text_field: Field,
    docstore: Arc<DocumentStore>,
    top_k: usize,
}

fn index_err(context: &str, e: tantivy::TantivyError) -> RagError {
    RagError::index(format!("{}: {}", context, e))
}

impl Bm25Retriever {
    pub fn new(docstore: Arc<DocumentStore>, top_k: usize) -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let text_indexing = TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let text_field = schema_builder.add_text_field(
            "text",
            TextOptions::default().set_indexing_options(text_indexing),
        );
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer: IndexWriter = index
            .writer(50_000_000) // 50MB heap
            .map_err(|e| index_err("Failed to create BM25 writer", e))?;
        let mut count = 0;
        for node in docstore.leaves() {
            writer
                .add_document(doc!(
                    id_field => node.id.as_str(),
                    text_field => node.text.as_str(),
                ))
                .map_err(|e| index_err("Failed to add document", e))?;
            count += 1;
        }
        writer
            .commit()
            .map_err(|e| index_err("Failed to commit BM25 index", e))?;
        let reader = index
            .reader()
            .map_err(|e| index_err("Failed to create BM25 reader", e))?;
        debug!(documents = count, "Built BM25 index");

        Ok(Self {
            index,
            reader,
            id_field,
            text_field,
            docstore,
            top_k,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

/// Keep only lowercased words so user text never hits query syntax
/// (`AND`, `OR`, quotes, field prefixes).
fn sanitize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Retriever for Bm25Retriever {
    fn name(&self) -> &str {
        "bm25"
    }

    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Candidate>, RagError> {
        let sanitized = sanitize_query(&query.query_str);
        if sanitized.is_empty() {
            debug!("BM25 query has no searchable terms");
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let (parsed, errors) = parser.parse_query_lenient(&sanitized);
        if !errors.is_empty() {
            debug!(errors = errors.len(), "BM25 query parsed leniently");
        }
        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(self.top_k))
            .map_err(|e| index_err("BM25 search failed", e))?;

        let mut candidates = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| index_err("Failed to retrieve BM25 doc", e))?;
            let id = doc
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match self.docstore.get(id) {
                Some(node) => candidates.push(Candidate {
                    node,
                    score,
                    source: self.name().to_string(),
                }),
                None => warn!(node_id = id, "BM25 hit missing from the docstore"),
            }
        }
        debug!(retriever = "bm25", hits = candidates.len(), "Retrieved candidates");
        Ok(candidates)
    }
}
