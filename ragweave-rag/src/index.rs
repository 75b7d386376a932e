//! Vector index, document store, and snapshot persistence.
//!
//! A snapshot is three JSON files in the persist directory. The manifest is
//! written last, so a directory without one holds no usable snapshot.

use crate::chunk::Chunker;
use crate::document::Document;
use crate::node::Node;
use chrono::{DateTime, Utc};
use ragweave_core::{ConfigError, Embedder, PipelineStage, RagError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MANIFEST_FILE: &str = "index_manifest.json";
const DOCSTORE_FILE: &str = "docstore.json";
const VECTORS_FILE: &str = "vector_index.json";
const SNAPSHOT_VERSION: u32 = 1;

/// Flat exhaustive L2 index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dimension: usize,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn add(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Result<(), RagError> {
        if vector.len() != self.dimension {
            return Err(RagError::index(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        self.ids.push(id.into());
        self.vectors.push(vector);
        Ok(())
    }

    /// The `k` nearest ids by L2 distance, closest first. Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(&str, f32)>, RagError> {
        if query.len() != self.dimension {
            return Err(RagError::index(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        let mut hits: Vec<(&str, f32)> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .map(|(id, v)| (id.as_str(), l2_distance(query, v)))
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// All nodes of the index, addressable by id.
#[derive(Debug, Default)]
pub struct DocumentStore {
    nodes: Vec<Arc<Node>>,
    by_id: HashMap<String, usize>,
}

impl DocumentStore {
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        let by_id = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Self { nodes, by_id }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.by_id.get(id).map(|&i| self.nodes[i].clone())
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Nodes that are embedded and searched directly.
    pub fn leaves(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    pub fn children(&self, id: &str) -> Vec<Arc<Node>> {
        self.get(id)
            .and_then(|n| n.hierarchy.as_ref().map(|h| h.child_ids.clone()))
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.get(c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Describes what a snapshot was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    pub fingerprint: String,
    pub embedder: String,
    pub dimension: usize,
    pub node_count: usize,
    pub built_at: DateTime<Utc>,
}

/// What to do when a snapshot's fingerprint no longer matches the inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    #[default]
    Rebuild,
    /// Serve the old snapshot and log a warning.
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub persist_dir: PathBuf,
    pub on_stale: StalePolicy,
    /// Leaf texts sent per embedding request.
    pub embed_batch_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            persist_dir: PathBuf::from("./storage"),
            on_stale: StalePolicy::Rebuild,
            embed_batch_size: 32,
        }
    }
}

/// Hash of everything that determines index content.
pub fn fingerprint(
    documents: &[Document],
    chunker: &Chunker,
    embedder: &dyn Embedder,
) -> Result<String, RagError> {
    let mut hasher = Sha256::new();
    for doc in documents {
        hasher.update(doc.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(doc.text.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(serde_json::to_string(chunker.strategy())?.as_bytes());
    hasher.update(embedder.model_id().as_bytes());
    hasher.update(embedder.dimensions().to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// A built or loaded index, shared read-only by the retrievers.
#[derive(Debug, Clone)]
pub struct IndexStore {
    pub index: Arc<VectorIndex>,
    pub docstore: Arc<DocumentStore>,
    pub manifest: IndexManifest,
    /// True when served from an existing snapshot.
    pub loaded: bool,
}

impl IndexStore {
    /// Load the snapshot in `settings.persist_dir` if it matches the inputs,
    /// otherwise chunk, embed, persist and return a fresh index.
    pub async fn build_or_load(
        documents: &[Document],
        dimension: usize,
        chunker: &Chunker,
        embedder: Arc<dyn Embedder>,
        settings: &IndexSettings,
    ) -> Result<Self, RagError> {
        if dimension != embedder.dimensions() {
            return Err(ConfigError::invalid(format!(
                "index dimension {} does not match embedder dimension {}",
                dimension,
                embedder.dimensions()
            ))
            .into());
        }
        let fp = fingerprint(documents, chunker, embedder.as_ref())?;
        let dir = &settings.persist_dir;

        if let Some(manifest) = read_manifest(dir).await? {
            if manifest.dimension != dimension {
                return Err(ConfigError::invalid(format!(
                    "persisted index at {} has dimension {}, expected {}",
                    dir.display(),
                    manifest.dimension,
                    dimension
                ))
                .into());
            }
            if manifest.fingerprint == fp {
                info!(dir = %dir.display(), nodes = manifest.node_count, "Loading persisted index");
                return Self::load(dir, manifest).await;
            }
            match settings.on_stale {
                StalePolicy::Rebuild => {
                    info!(dir = %dir.display(), "Persisted index is stale; rebuilding");
                }
                StalePolicy::Warn => {
                    warn!(
                        dir = %dir.display(),
                        built_at = %manifest.built_at,
                        "Persisted index is stale; serving it anyway"
                    );
                    return Self::load(dir, manifest).await;
                }
                StalePolicy::Error => {
                    return Err(RagError::index(format!(
                        "persisted index at {} does not match the current documents or settings",
                        dir.display()
                    )));
                }
            }
        }

        Self::build(documents, chunker, embedder, settings, fp).await
    }

    async fn build(
        documents: &[Document],
        chunker: &Chunker,
        embedder: Arc<dyn Embedder>,
        settings: &IndexSettings,
        fingerprint: String,
    ) -> Result<Self, RagError> {
        let nodes = chunker.split(documents).await?;
        let docstore = DocumentStore::from_nodes(nodes);
        let leaves: Vec<&Arc<Node>> = docstore.leaves().collect();
        info!(
            documents = documents.len(),
            nodes = docstore.len(),
            leaves = leaves.len(),
            "Building index"
        );

        let mut index = VectorIndex::new(embedder.dimensions());
        for batch in leaves.chunks(settings.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|n| n.text.clone()).collect();
            let vectors = embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| RagError::external(PipelineStage::Embedding, e))?;
            if vectors.len() != batch.len() {
                return Err(RagError::index(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (node, vector) in batch.iter().zip(vectors) {
                index.add(node.id.clone(), vector)?;
            }
        }

        let manifest = IndexManifest {
            version: SNAPSHOT_VERSION,
            fingerprint,
            embedder: embedder.model_id(),
            dimension: embedder.dimensions(),
            node_count: docstore.len(),
            built_at: Utc::now(),
        };
        persist(&settings.persist_dir, &index, &docstore, &manifest).await?;

        Ok(Self {
            index: Arc::new(index),
            docstore: Arc::new(docstore),
            manifest,
            loaded: false,
        })
    }

    async fn load(dir: &Path, manifest: IndexManifest) -> Result<Self, RagError> {
        let nodes: Vec<Node> = serde_json::from_slice(&tokio::fs::read(dir.join(DOCSTORE_FILE)).await?)?;
        let index: VectorIndex =
            serde_json::from_slice(&tokio::fs::read(dir.join(VECTORS_FILE)).await?)?;
        if nodes.len() != manifest.node_count {
            return Err(RagError::index(format!(
                "snapshot at {} is corrupt: manifest lists {} nodes, docstore holds {}",
                dir.display(),
                manifest.node_count,
                nodes.len()
            )));
        }
        Ok(Self {
            index: Arc::new(index),
            docstore: Arc::new(DocumentStore::from_nodes(nodes)),
            manifest,
            loaded: true,
        })
    }
}

async fn read_manifest(dir: &Path) -> Result<Option<IndexManifest>, RagError> {
    let path = dir.join(MANIFEST_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn persist(
    dir: &Path,
    index: &VectorIndex,
    docstore: &DocumentStore,
    manifest: &IndexManifest,
) -> Result<(), RagError> {
    tokio::fs::create_dir_all(dir).await?;
    // Drop the old manifest first so a crash mid-write never pairs it with new files.
    match tokio::fs::remove_file(dir.join(MANIFEST_FILE)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let nodes: Vec<&Node> = docstore.nodes().iter().map(|n| n.as_ref()).collect();
    write_atomic(&dir.join(DOCSTORE_FILE), &serde_json::to_vec(&nodes)?).await?;
    write_atomic(&dir.join(VECTORS_FILE), &serde_json::to_vec(index)?).await?;
    write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(manifest)?,
    )
    .await?;
    info!(dir = %dir.display(), nodes = manifest.node_count, "Persisted index");
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RagError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkingStrategy;
    use ragweave_core::LocalHashEmbedder;

    fn docs() -> Vec<Document> {
        vec![
            Document::new("paris.txt", "Paris is the capital of France."),
            Document::new("tokyo.txt", "Tokyo is the capital of Japan."),
        ]
    }

    fn chunker() -> Chunker {
        Chunker::new(ChunkingStrategy::default(), None).unwrap()
    }

    fn settings(dir: &Path, on_stale: StalePolicy) -> IndexSettings {
        IndexSettings {
            persist_dir: dir.to_path_buf(),
            on_stale,
            embed_batch_size: 1,
        }
    }

    #[test]
    fn test_vector_index_orders_by_distance() {
        let mut index = VectorIndex::new(2);
        index.add("far", vec![5.0, 5.0]).unwrap();
        index.add("near", vec![1.0, 0.0]).unwrap();
        index.add("exact", vec![0.0, 0.0]).unwrap();
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0], ("exact", 0.0));
        assert_eq!(hits[1], ("near", 1.0));
    }

    #[test]
    fn test_vector_index_rejects_wrong_dimension() {
        let mut index = VectorIndex::new(3);
        assert!(matches!(index.add("x", vec![1.0]), Err(RagError::Index { .. })));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_docstore_children() {
        let nodes = vec![
            Node {
                id: "p".into(),
                document_id: "d".into(),
                text: "ab".into(),
                start_offset: 0,
                end_offset: 2,
                metadata: Default::default(),
                hierarchy: Some(crate::node::Hierarchy {
                    level: 0,
                    parent_id: None,
                    child_ids: vec!["c".into()],
                }),
            },
            Node {
                id: "c".into(),
                document_id: "d".into(),
                text: "a".into(),
                start_offset: 0,
                end_offset: 1,
                metadata: Default::default(),
                hierarchy: Some(crate::node::Hierarchy {
                    level: 1,
                    parent_id: Some("p".into()),
                    child_ids: vec![],
                }),
            },
        ];
        let store = DocumentStore::from_nodes(nodes);
        assert_eq!(store.children("p")[0].id, "c");
        assert_eq!(store.leaves().count(), 1);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let embedder = LocalHashEmbedder::new(64);
        let base = fingerprint(&docs(), &chunker(), &embedder).unwrap();
        assert_eq!(base, fingerprint(&docs(), &chunker(), &embedder).unwrap());

        let mut changed = docs();
        changed[0].text.push_str(" It is large.");
        assert_ne!(base, fingerprint(&changed, &chunker(), &embedder).unwrap());

        let window = Chunker::new(ChunkingStrategy::Window { window_size: 3 }, None).unwrap();
        assert_ne!(base, fingerprint(&docs(), &window, &embedder).unwrap());
        assert_ne!(
            base,
            fingerprint(&docs(), &chunker(), &LocalHashEmbedder::new(32)).unwrap()
        );
    }

    #[tokio::test]
    async fn test_build_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(64));
        let settings = settings(dir.path(), StalePolicy::Rebuild);

        let built = IndexStore::build_or_load(&docs(), 64, &chunker(), embedder.clone(), &settings)
            .await
            .unwrap();
        assert!(!built.loaded);
        assert_eq!(built.index.len(), 2);
        assert!(dir.path().join(MANIFEST_FILE).exists());

        let loaded = IndexStore::build_or_load(&docs(), 64, &chunker(), embedder, &settings)
            .await
            .unwrap();
        assert!(loaded.loaded);
        assert_eq!(loaded.manifest, built.manifest);
        assert_eq!(loaded.docstore.len(), built.docstore.len());
    }

    #[tokio::test]
    async fn test_stale_snapshot_policies() {
        let dir = tempfile::tempdir().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(64));
        IndexStore::build_or_load(
            &docs(),
            64,
            &chunker(),
            embedder.clone(),
            &settings(dir.path(), StalePolicy::Rebuild),
        )
        .await
        .unwrap();

        let mut more = docs();
        more.push(Document::new("rome.txt", "Rome is the capital of Italy."));

        let err = IndexStore::build_or_load(
            &more,
            64,
            &chunker(),
            embedder.clone(),
            &settings(dir.path(), StalePolicy::Error),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Index { .. }));

        let warned = IndexStore::build_or_load(
            &more,
            64,
            &chunker(),
            embedder.clone(),
            &settings(dir.path(), StalePolicy::Warn),
        )
        .await
        .unwrap();
        assert!(warned.loaded);
        assert_eq!(warned.docstore.len(), 2);

        let rebuilt = IndexStore::build_or_load(
            &more,
            64,
            &chunker(),
            embedder,
            &settings(dir.path(), StalePolicy::Rebuild),
        )
        .await
        .unwrap();
        assert!(!rebuilt.loaded);
        assert_eq!(rebuilt.docstore.len(), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(64));
        let err = IndexStore::build_or_load(
            &docs(),
            128,
            &chunker(),
            embedder,
            &settings(dir.path(), StalePolicy::Rebuild),
        )
        .await
        .unwrap_err();
        assert!(err.is_config());
    }
}
