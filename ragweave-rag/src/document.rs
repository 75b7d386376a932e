//! Document loading from a directory tree.

use ragweave_core::RagError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// A raw ingested document. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Path relative to the source directory, with `/` separators.
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Load every regular file under `dir` as one document, sorted by id.
///
/// Files that are not valid UTF-8 are decoded lossily with a warning.
pub async fn load_documents(dir: &Path) -> Result<Vec<Document>, RagError> {
    let meta = tokio::fs::metadata(dir).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RagError::NotFound {
            path: dir.to_path_buf(),
        },
        _ => RagError::Io(e),
    })?;
    if !meta.is_dir() {
        return Err(RagError::NotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut documents = Vec::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let bytes = tokio::fs::read(path).await?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), "File is not valid UTF-8; decoding lossily");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };

        let relative = path.strip_prefix(dir).unwrap_or(path);
        let id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mut document = Document::new(id, text);
        document
            .metadata
            .insert("file_path".into(), path.display().to_string());
        if let Some(name) = path.file_name() {
            document
                .metadata
                .insert("file_name".into(), name.to_string_lossy().into_owned());
        }
        document
            .metadata
            .insert("file_size".into(), document.text.len().to_string());
        debug!(id = %document.id, chars = document.text.len(), "Loaded document");
        documents.push(document);
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    info!(dir = %dir.display(), count = documents.len(), "Loaded documents");
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_documents_recurses_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "Tokyo is the capital of Japan.").unwrap();
        std::fs::write(dir.path().join("a.txt"), "Paris is the capital of France.").unwrap();
        std::fs::write(dir.path().join("sub").join("c.md"), "# Notes").unwrap();

        let docs = load_documents(dir.path()).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.txt", "sub/c.md"]);
        assert_eq!(docs[0].text, "Paris is the capital of France.");
        assert_eq!(docs[0].metadata["file_name"], "a.txt");
    }

    #[tokio::test]
    async fn test_load_documents_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = load_documents(&missing).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_documents_other_io_errors_are_not_not_found() {
        // A NUL byte makes the metadata call fail with InvalidInput.
        let err = load_documents(Path::new("docs\0dir")).await.unwrap_err();
        match err {
            RagError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_documents_file_is_not_a_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let err = load_documents(&file).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_documents_lossy_utf8() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bin.dat"), [0x66, 0x6f, 0xff, 0x6f]).unwrap();
        let docs = load_documents(dir.path()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].text.starts_with("fo"));
    }
}
