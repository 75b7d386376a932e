//! Document chunking strategies.
//!
//! Every node a strategy produces covers a contiguous byte range of exactly one
//! document, recorded in `start_offset..end_offset`. Sizes are measured in
//! characters.

use crate::document::Document;
use crate::node::{Hierarchy, Node, ORIGINAL_TEXT_KEY, WINDOW_KEY};
use ragweave_core::embeddings::cosine_similarity;
use ragweave_core::{ConfigError, Embedder, PipelineStage, RagError};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Chunking strategy, selected by its `strategy` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Greedy sentence packing. Both fields are required.
    Sentence {
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
    },
    /// One node per sentence, carrying its surrounding window as metadata.
    Window {
        /// Total sentences in the window, pivot included. Must be odd.
        #[serde(default = "default_window_size")]
        window_size: usize,
    },
    /// Breaks where embedding distance between neighbouring sentence groups spikes.
    Semantic {
        #[serde(default = "default_buffer_size")]
        buffer_size: usize,
        #[serde(default = "default_breakpoint_percentile")]
        breakpoint_percentile_threshold: f32,
    },
    /// Nested levels of decreasing size with parent/child links.
    #[serde(alias = "hiearchical")]
    Hierarchical {
        #[serde(default = "default_hierarchy_sizes")]
        chunk_sizes: Vec<usize>,
        #[serde(default)]
        chunk_overlap: usize,
    },
}

fn default_window_size() -> usize {
    3
}

fn default_buffer_size() -> usize {
    1
}

fn default_breakpoint_percentile() -> f32 {
    95.0
}

fn default_hierarchy_sizes() -> Vec<usize> {
    vec![2048, 512, 128]
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Sentence {
            chunk_size: Some(512),
            chunk_overlap: Some(50),
        }
    }
}

impl ChunkingStrategy {
    /// The strategy for a tag, with default parameters.
    pub fn from_tag(tag: &str) -> Result<Self, ConfigError> {
        match tag.to_ascii_lowercase().as_str() {
            "sentence" => Ok(Self::default()),
            "window" => Ok(Self::Window {
                window_size: default_window_size(),
            }),
            "semantic" => Ok(Self::Semantic {
                buffer_size: default_buffer_size(),
                breakpoint_percentile_threshold: default_breakpoint_percentile(),
            }),
            "hierarchical" | "hiearchical" => Ok(Self::Hierarchical {
                chunk_sizes: default_hierarchy_sizes(),
                chunk_overlap: 0,
            }),
            _ => Err(ConfigError::unknown_strategy("chunking", tag)),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sentence { .. } => "sentence",
            Self::Window { .. } => "window",
            Self::Semantic { .. } => "semantic",
            Self::Hierarchical { .. } => "hierarchical",
        }
    }

    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Self::Hierarchical { .. })
    }
}

/// Validated parameters.
enum Plan {
    Sentence {
        size: usize,
        overlap: usize,
    },
    Window {
        half: usize,
    },
    Semantic {
        buffer: usize,
        percentile: f32,
        embedder: Arc<dyn Embedder>,
    },
    Hierarchical {
        sizes: Vec<usize>,
        overlap: usize,
    },
}

/// Splits documents into nodes under one validated strategy.
pub struct Chunker {
    strategy: ChunkingStrategy,
    plan: Plan,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl Chunker {
    /// Validate `strategy`. The semantic strategy needs an embedder.
    pub fn new(
        strategy: ChunkingStrategy,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self, ConfigError> {
        let plan = match &strategy {
            ChunkingStrategy::Sentence {
                chunk_size,
                chunk_overlap,
            } => {
                let size = chunk_size.ok_or_else(|| ConfigError::missing_field("chunking.chunk_size"))?;
                let overlap =
                    chunk_overlap.ok_or_else(|| ConfigError::missing_field("chunking.chunk_overlap"))?;
                if size == 0 {
                    return Err(ConfigError::invalid("chunking.chunk_size must be greater than 0"));
                }
                if overlap >= size {
                    return Err(ConfigError::invalid(format!(
                        "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                        overlap, size
                    )));
                }
                Plan::Sentence { size, overlap }
            }
            ChunkingStrategy::Window { window_size } => {
                if *window_size == 0 || window_size % 2 == 0 {
                    return Err(ConfigError::invalid(format!(
                        "chunking.window_size must be a positive odd number, got {}",
                        window_size
                    )));
                }
                Plan::Window {
                    half: window_size / 2,
                }
            }
            ChunkingStrategy::Semantic {
                buffer_size,
                breakpoint_percentile_threshold,
            } => {
                if !(0.0..=100.0).contains(breakpoint_percentile_threshold) {
                    return Err(ConfigError::invalid(format!(
                        "chunking.breakpoint_percentile_threshold must be within 0-100, got {}",
                        breakpoint_percentile_threshold
                    )));
                }
                let embedder = embedder.ok_or_else(|| {
                    ConfigError::missing_dependency("semantic chunking", "an embedder")
                })?;
                Plan::Semantic {
                    buffer: *buffer_size,
                    percentile: *breakpoint_percentile_threshold,
                    embedder,
                }
            }
            ChunkingStrategy::Hierarchical {
                chunk_sizes,
                chunk_overlap,
            } => {
                if chunk_sizes.is_empty() || chunk_sizes.contains(&0) {
                    return Err(ConfigError::invalid(
                        "chunking.chunk_sizes must list at least one positive size",
                    ));
                }
                if chunk_sizes.windows(2).any(|w| w[1] >= w[0]) {
                    return Err(ConfigError::invalid(format!(
                        "chunking.chunk_sizes must be strictly decreasing, got {:?}",
                        chunk_sizes
                    )));
                }
                let smallest = chunk_sizes[chunk_sizes.len() - 1];
                if *chunk_overlap >= smallest {
                    return Err(ConfigError::invalid(format!(
                        "chunking.chunk_overlap ({}) must be smaller than the smallest chunk size ({})",
                        chunk_overlap, smallest
                    )));
                }
                Plan::Hierarchical {
                    sizes: chunk_sizes.clone(),
                    overlap: *chunk_overlap,
                }
            }
        };
        Ok(Self { strategy, plan })
    }

    pub fn strategy(&self) -> &ChunkingStrategy {
        &self.strategy
    }

    /// Split every document, preserving document order.
    pub async fn split(&self, documents: &[Document]) -> Result<Vec<Node>, RagError> {
        let mut nodes = Vec::new();
        for doc in documents {
            let before = nodes.len();
            match &self.plan {
                Plan::Sentence { size, overlap } => {
                    let spans = pack(&doc.text, &pieces(&doc.text, 0, doc.text.len(), *size), *size, *overlap);
                    nodes.extend(flat_nodes(doc, spans));
                }
                Plan::Window { half } => nodes.extend(window_nodes(doc, *half)),
                Plan::Semantic {
                    buffer,
                    percentile,
                    embedder,
                } => {
                    let spans = semantic_spans(&doc.text, *buffer, *percentile, embedder.as_ref()).await?;
                    nodes.extend(flat_nodes(doc, spans));
                }
                Plan::Hierarchical { sizes, overlap } => {
                    nodes.extend(hierarchical_nodes(doc, sizes, *overlap));
                }
            }
            debug!(
                document = %doc.id,
                strategy = self.strategy.tag(),
                nodes = nodes.len() - before,
                "Chunked document"
            );
        }
        Ok(nodes)
    }
}

fn char_len(text: &str, start: usize, end: usize) -> usize {
    text[start..end].chars().count()
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '}' | '\u{201d}' | '\u{2019}')
}

/// Byte spans of the sentences in `text[from..to]`, surrounding whitespace excluded.
///
/// A sentence ends at `.`, `!` or `?` (plus any closing quotes or brackets)
/// followed by whitespace or the end of the text, or at a blank line.
pub fn sentence_spans(text: &str, from: usize, to: usize) -> Vec<(usize, usize)> {
    let slice = &text[from..to];
    let chars: Vec<(usize, char)> = slice.char_indices().collect();
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            if c == '\n' && start.is_some() && blank_line_follows(&chars, i) {
                if let Some(s) = start.take() {
                    spans.push((from + s, from + slice[..pos].trim_end().len()));
                }
            }
            i += 1;
            continue;
        }
        if start.is_none() {
            start = Some(pos);
        }
        if is_terminator(c) {
            let mut j = i + 1;
            while j < chars.len() && (is_terminator(chars[j].1) || is_closer(chars[j].1)) {
                j += 1;
            }
            if j == chars.len() || chars[j].1.is_whitespace() {
                let end = if j == chars.len() { slice.len() } else { chars[j].0 };
                if let Some(s) = start.take() {
                    spans.push((from + s, from + end));
                }
            }
            i = j;
            continue;
        }
        i += 1;
    }

    if let Some(s) = start {
        spans.push((from + s, from + slice.trim_end().len()));
    }
    spans
}

fn blank_line_follows(chars: &[(usize, char)], newline_idx: usize) -> bool {
    chars[newline_idx + 1..]
        .iter()
        .take_while(|(_, c)| c.is_whitespace())
        .any(|(_, c)| *c == '\n')
}

/// Sentence spans, with any sentence longer than `max_chars` split at
/// whitespace (or hard-cut when a single word is too long).
fn pieces(text: &str, from: usize, to: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for (start, end) in sentence_spans(text, from, to) {
        if char_len(text, start, end) <= max_chars {
            out.push((start, end));
        } else {
            split_long(text, start, end, max_chars, &mut out);
        }
    }
    out
}

fn split_long(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<(usize, usize)>) {
    let mut words = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text[start..end].char_indices() {
        let at = start + i;
        match (c.is_whitespace(), word_start) {
            (true, Some(ws)) => {
                words.push((ws, at));
                word_start = None;
            }
            (false, None) => word_start = Some(at),
            _ => {}
        }
    }
    if let Some(ws) = word_start {
        words.push((ws, end));
    }

    let mut current: Option<(usize, usize)> = None;
    for (ws, we) in words {
        if char_len(text, ws, we) > max_chars {
            if let Some(piece) = current.take() {
                out.push(piece);
            }
            hard_cut(text, ws, we, max_chars, out);
            continue;
        }
        current = match current {
            Some((ps, _)) if char_len(text, ps, we) <= max_chars => Some((ps, we)),
            Some(piece) => {
                out.push(piece);
                Some((ws, we))
            }
            None => Some((ws, we)),
        };
    }
    if let Some(piece) = current {
        out.push(piece);
    }
}

fn hard_cut(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<(usize, usize)>) {
    let mut piece_start = start;
    let mut count = 0;
    for (i, _) in text[start..end].char_indices() {
        if count == max_chars {
            out.push((piece_start, start + i));
            piece_start = start + i;
            count = 0;
        }
        count += 1;
    }
    if piece_start < end {
        out.push((piece_start, end));
    }
}

/// Greedily pack pieces into chunks of at most `size` characters.
///
/// The next chunk starts at the earliest piece of the previous chunk (after
/// its first) whose distance to that chunk's end fits in `overlap`.
fn pack(text: &str, pieces: &[(usize, usize)], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        let start = pieces[i].0;
        let mut j = i;
        while j + 1 < pieces.len() && char_len(text, start, pieces[j + 1].1) <= size {
            j += 1;
        }
        let end = pieces[j].1;
        chunks.push((start, end));
        if j + 1 >= pieces.len() {
            break;
        }
        i = (i + 1..=j)
            .find(|&k| char_len(text, pieces[k].0, end) <= overlap)
            .unwrap_or(j + 1);
    }
    chunks
}

fn make_node(doc: &Document, id: String, start: usize, end: usize) -> Node {
    Node {
        id,
        document_id: doc.id.clone(),
        text: doc.text[start..end].to_string(),
        start_offset: start,
        end_offset: end,
        metadata: doc.metadata.clone(),
        hierarchy: None,
    }
}

fn flat_nodes(doc: &Document, spans: Vec<(usize, usize)>) -> Vec<Node> {
    spans
        .into_iter()
        .enumerate()
        .map(|(idx, (s, e))| make_node(doc, format!("{}-chunk-{}", doc.id, idx), s, e))
        .collect()
}

fn window_nodes(doc: &Document, half: usize) -> Vec<Node> {
    let spans = sentence_spans(&doc.text, 0, doc.text.len());
    spans
        .iter()
        .enumerate()
        .map(|(idx, &(s, e))| {
            let lo = idx.saturating_sub(half);
            let hi = (idx + half).min(spans.len() - 1);
            let window = &doc.text[spans[lo].0..spans[hi].1];
            let mut node = make_node(doc, format!("{}-chunk-{}", doc.id, idx), s, e);
            node.metadata.insert(WINDOW_KEY.to_string(), window.to_string());
            node.metadata
                .insert(ORIGINAL_TEXT_KEY.to_string(), node.text.clone());
            node
        })
        .collect()
}

/// Linear-interpolated percentile of `values` (`p` in 0..=100).
pub fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f32)
}

async fn semantic_spans(
    text: &str,
    buffer: usize,
    percentile_threshold: f32,
    embedder: &dyn Embedder,
) -> Result<Vec<(usize, usize)>, RagError> {
    let sentences = sentence_spans(text, 0, text.len());
    if sentences.len() <= 1 {
        return Ok(sentences);
    }

    let groups: Vec<String> = (0..sentences.len())
        .map(|i| {
            let lo = i.saturating_sub(buffer);
            let hi = (i + buffer).min(sentences.len() - 1);
            sentences[lo..=hi]
                .iter()
                .map(|&(s, e)| &text[s..e])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    let embeddings = embedder
        .embed_batch(&groups)
        .await
        .map_err(|e| RagError::external(PipelineStage::Chunking, e))?;

    let distances: Vec<f32> = embeddings
        .windows(2)
        .map(|w| 1.0 - cosine_similarity(&w[0], &w[1]))
        .collect();
    let threshold = percentile(&distances, percentile_threshold);

    let mut spans = Vec::new();
    let mut first = 0;
    for (i, distance) in distances.iter().enumerate() {
        if *distance > threshold {
            spans.push((sentences[first].0, sentences[i].1));
            first = i + 1;
        }
    }
    spans.push((sentences[first].0, sentences[sentences.len() - 1].1));
    Ok(spans)
}

fn hierarchical_nodes(doc: &Document, sizes: &[usize], overlap: usize) -> Vec<Node> {
    let mut all: Vec<Node> = Vec::new();
    let mut parents: Vec<usize> = Vec::new();

    for (level, &size) in sizes.iter().enumerate() {
        let mut idx = 0;
        let mut current = Vec::new();
        let ranges: Vec<(Option<usize>, usize, usize)> = if level == 0 {
            vec![(None, 0, doc.text.len())]
        } else {
            parents
                .iter()
                .map(|&p| (Some(p), all[p].start_offset, all[p].end_offset))
                .collect()
        };

        for (parent, from, to) in ranges {
            for (s, e) in pack(&doc.text, &pieces(&doc.text, from, to, size), size, overlap) {
                let mut node = make_node(doc, format!("{}-L{}-{}", doc.id, level, idx), s, e);
                node.hierarchy = Some(Hierarchy {
                    level,
                    parent_id: parent.map(|p| all[p].id.clone()),
                    child_ids: Vec::new(),
                });
                node.metadata.insert("level".into(), level.to_string());
                if let Some(p) = parent {
                    let child_id = node.id.clone();
                    if let Some(h) = all[p].hierarchy.as_mut() {
                        h.child_ids.push(child_id);
                    }
                }
                current.push(all.len());
                all.push(node);
                idx += 1;
            }
        }
        parents = current;
    }
    all
}

/// Group nodes by document, for callers that need per-document views.
pub fn nodes_by_document<N: Borrow<Node>>(nodes: &[N]) -> BTreeMap<&str, Vec<&N>> {
    let mut map: BTreeMap<&str, Vec<&N>> = BTreeMap::new();
    for node in nodes {
        map.entry(node.borrow().document_id.as_str())
            .or_default()
            .push(node);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ragweave_core::LocalHashEmbedder;

    fn doc(text: &str) -> Document {
        Document::new("doc.txt", text)
    }

    fn sentence(size: usize, overlap: usize) -> Chunker {
        Chunker::new(
            ChunkingStrategy::Sentence {
                chunk_size: Some(size),
                chunk_overlap: Some(overlap),
            },
            None,
        )
        .unwrap()
    }

    fn texts(text: &str, spans: &[(usize, usize)]) -> Vec<String> {
        spans.iter().map(|&(s, e)| text[s..e].to_string()).collect()
    }

    #[test]
    fn test_sentence_spans_basic() {
        let text = "Paris is in France. Tokyo is in Japan!  Where is Rome?";
        assert_eq!(
            texts(text, &sentence_spans(text, 0, text.len())),
            vec!["Paris is in France.", "Tokyo is in Japan!", "Where is Rome?"]
        );
    }

    #[test]
    fn test_sentence_spans_keeps_decimals_and_quotes() {
        let text = "Pi is 3.14 roughly. He said \"stop.\" Then left";
        assert_eq!(
            texts(text, &sentence_spans(text, 0, text.len())),
            vec!["Pi is 3.14 roughly.", "He said \"stop.\"", "Then left"]
        );
    }

    #[test]
    fn test_sentence_spans_blank_line_breaks() {
        let text = "# Title\n\nBody text here";
        assert_eq!(
            texts(text, &sentence_spans(text, 0, text.len())),
            vec!["# Title", "Body text here"]
        );
    }

    #[test]
    fn test_from_tag() {
        assert!(matches!(
            ChunkingStrategy::from_tag("hiearchical").unwrap(),
            ChunkingStrategy::Hierarchical { .. }
        ));
        let err = ChunkingStrategy::from_tag("paragraph").unwrap_err();
        assert_eq!(err.to_string(), "Unknown chunking strategy: 'paragraph'");
    }

    #[test]
    fn test_sentence_requires_both_fields() {
        let err = Chunker::new(
            ChunkingStrategy::Sentence {
                chunk_size: Some(100),
                chunk_overlap: None,
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "chunking.chunk_overlap"));

        let err = Chunker::new(
            ChunkingStrategy::Sentence {
                chunk_size: None,
                chunk_overlap: Some(10),
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_overlap_not_smaller_than_size_rejected() {
        let result = Chunker::new(
            ChunkingStrategy::Sentence {
                chunk_size: Some(50),
                chunk_overlap: Some(50),
            },
            None,
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_even_window_rejected() {
        let result = Chunker::new(ChunkingStrategy::Window { window_size: 4 }, None);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_semantic_requires_embedder() {
        let result = Chunker::new(ChunkingStrategy::from_tag("semantic").unwrap(), None);
        assert!(matches!(result, Err(ConfigError::MissingDependency { .. })));
    }

    #[test]
    fn test_hierarchical_sizes_must_decrease() {
        let result = Chunker::new(
            ChunkingStrategy::Hierarchical {
                chunk_sizes: vec![128, 512],
                chunk_overlap: 0,
            },
            None,
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_sentence_packing_respects_size() {
        let text = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let nodes = sentence(32, 0).split(&[doc(text)]).await.unwrap();
        let got: Vec<&str> = nodes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(
            got,
            vec![
                "One two three. Four five six.",
                "Seven eight nine.",
                "Ten eleven twelve."
            ]
        );
        for node in &nodes {
            assert!(node.text.chars().count() <= 32);
            assert_eq!(&text[node.start_offset..node.end_offset], node.text);
        }
        assert_eq!(nodes[0].id, "doc.txt-chunk-0");
    }

    #[tokio::test]
    async fn test_sentence_packing_overlaps_trailing_sentence() {
        let text = "Aaaa bbbb. Cccc dddd. Eeee ffff. Gggg hhhh.";
        let nodes = sentence(32, 12).split(&[doc(text)]).await.unwrap();
        let got: Vec<&str> = nodes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(
            got,
            vec![
                "Aaaa bbbb. Cccc dddd. Eeee ffff.",
                "Eeee ffff. Gggg hhhh."
            ]
        );
    }

    #[tokio::test]
    async fn test_long_sentence_is_split_at_whitespace() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let nodes = sentence(12, 0).split(&[doc(text)]).await.unwrap();
        assert!(nodes.len() > 1);
        for node in &nodes {
            assert!(node.text.chars().count() <= 12, "too long: {:?}", node.text);
            assert!(!node.text.trim().is_empty());
        }
    }

    #[tokio::test]
    async fn test_huge_word_is_hard_cut() {
        let text = "x".repeat(25);
        let nodes = sentence(10, 0).split(&[doc(&text)]).await.unwrap();
        let lens: Vec<usize> = nodes.iter().map(|n| n.text.len()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_empty_document_yields_no_nodes() {
        let nodes = sentence(100, 10).split(&[doc("   \n ")]).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_window_nodes_carry_context() {
        let text = "First one. Second one. Third one. Fourth one.";
        let chunker = Chunker::new(ChunkingStrategy::Window { window_size: 3 }, None).unwrap();
        let nodes = chunker.split(&[doc(text)]).await.unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].text, "First one.");
        assert_eq!(nodes[0].metadata[WINDOW_KEY], "First one. Second one.");
        assert_eq!(nodes[1].metadata[WINDOW_KEY], "First one. Second one. Third one.");
        assert_eq!(nodes[3].metadata[WINDOW_KEY], "Third one. Fourth one.");
        assert_eq!(nodes[2].metadata[ORIGINAL_TEXT_KEY], "Third one.");
    }

    #[test]
    fn test_percentile_linear() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 100.0), 5.0);
        assert!((percentile(&values, 95.0) - 4.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_semantic_breaks_on_topic_shift() {
        let text = "Cats purr softly. Cats purr loudly. Cats purr often. \
                    Rockets launch fast. Rockets launch high. Rockets launch today.";
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(256));
        let chunker = Chunker::new(
            ChunkingStrategy::Semantic {
                buffer_size: 0,
                breakpoint_percentile_threshold: 70.0,
            },
            Some(embedder),
        )
        .unwrap();
        let nodes = chunker.split(&[doc(text)]).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].text.ends_with("Cats purr often."));
        assert!(nodes[1].text.starts_with("Rockets launch fast."));
    }

    #[tokio::test]
    async fn test_hierarchical_links_levels() {
        let text = "Aaaa bbbb. Cccc dddd. Eeee ffff. Gggg hhhh.";
        let chunker = Chunker::new(
            ChunkingStrategy::Hierarchical {
                chunk_sizes: vec![64, 22, 10],
                chunk_overlap: 0,
            },
            None,
        )
        .unwrap();
        let nodes = chunker.split(&[doc(text)]).await.unwrap();

        let roots: Vec<&Node> = nodes.iter().filter(|n| n.parent_id().is_none()).collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, "doc.txt-L0-0");

        let mid: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.hierarchy.as_ref().map(|h| h.level) == Some(1))
            .collect();
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].text, "Aaaa bbbb. Cccc dddd.");

        let leaves: Vec<&Node> = nodes.iter().filter(|n| n.is_leaf()).collect();
        assert_eq!(leaves.len(), 4);
        for leaf in &leaves {
            let parent = nodes
                .iter()
                .find(|n| Some(n.id.as_str()) == leaf.parent_id())
                .unwrap();
            assert!(parent.start_offset <= leaf.start_offset);
            assert!(leaf.end_offset <= parent.end_offset);
            assert!(parent.hierarchy.as_ref().unwrap().child_ids.contains(&leaf.id));
        }
    }

    #[test]
    fn test_strategy_deserializes_from_toml() {
        let strategy: ChunkingStrategy = toml::from_str(
            r#"
            strategy = "sentence"
            chunk_size = 256
            "#,
        )
        .unwrap();
        assert_eq!(
            strategy,
            ChunkingStrategy::Sentence {
                chunk_size: Some(256),
                chunk_overlap: None
            }
        );
        let window: ChunkingStrategy = toml::from_str(r#"strategy = "window""#).unwrap();
        assert_eq!(window, ChunkingStrategy::Window { window_size: 3 });
    }

    #[test]
    fn test_nodes_by_document() {
        let a = make_node(&Document::new("a", "xy"), "a-0".into(), 0, 1);
        let b = make_node(&Document::new("b", "xy"), "b-0".into(), 0, 1);
        let nodes = [a, b];
        let grouped = nodes_by_document(&nodes);
        assert_eq!(grouped.len(), 2);
    }
}
