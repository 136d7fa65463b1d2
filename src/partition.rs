//! Processing collaborator: downloaded file → JSON array of elements.
//!
//! Real document partitioning lives outside this crate. The pipeline only
//! depends on the [`Partitioner`] contract; [`BasicPartitioner`] covers
//! plain text and already-structured JSON so the framework runs end to end
//! without an external service.
//!
//! Every element has the shape
//!
//! ```json
//! { "type": "NarrativeText", "element_id": "…", "text": "…",
//!   "metadata": { "filename": "…", "data_source": { "url": "…", … } } }
//! ```

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::models::{DownloadResponse, FileData};

/// Turns one downloaded file into an elements file.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Write a JSON array of element records to `output_path` and return it.
    async fn partition(&self, download: &DownloadResponse, output_path: &Path) -> Result<PathBuf>;
}

/// Approximate chars-per-token ratio used to size text elements.
const CHARS_PER_TOKEN: usize = 4;

/// Paragraph splitter for text, passthrough for JSON arrays and JSON lines.
#[derive(Debug, Clone)]
pub struct BasicPartitioner {
    max_chars: usize,
}

impl Default for BasicPartitioner {
    fn default() -> Self {
        Self::new(500)
    }
}

impl BasicPartitioner {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
        }
    }

    pub fn partition_file(&self, path: &Path, file_data: &FileData) -> Result<Vec<Value>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Value(format!("cannot read {} as text: {}", path.display(), e))
        })?;
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let records = match ext.as_str() {
            "json" => match serde_json::from_str::<Value>(&content)? {
                Value::Array(items) => items,
                other => vec![other],
            },
            "ndjson" | "jsonl" => content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(serde_json::from_str::<Value>)
                .collect::<std::result::Result<Vec<_>, _>>()?,
            _ => {
                return Ok(split_paragraphs(&content, self.max_chars)
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| text_element(file_data, i, &text))
                    .collect())
            }
        };

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| record_element(file_data, i, record))
            .collect())
    }
}

#[async_trait]
impl Partitioner for BasicPartitioner {
    async fn partition(&self, download: &DownloadResponse, output_path: &Path) -> Result<PathBuf> {
        let partitioner = self.clone();
        let download = download.clone();
        let output_path = output_path.to_path_buf();
        tokio::task::spawn_blocking(move || partitioner.write_elements(&download, &output_path))
            .await?
    }
}

impl BasicPartitioner {
    fn write_elements(&self, download: &DownloadResponse, output_path: &Path) -> Result<PathBuf> {
        let elements = self.partition_file(&download.path, &download.file_data)?;
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output_path, serde_json::to_vec(&elements)?)?;
        tracing::debug!(
            connector_type = %download.file_data.connector_type,
            identifier = %download.file_data.identifier,
            elements = elements.len(),
            "partitioned"
        );
        Ok(output_path.to_path_buf())
    }
}

/// Split on blank lines, packing paragraphs up to `max_chars` and
/// hard-splitting paragraphs longer than that at whitespace.
pub fn split_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let mut split_at = remaining.len().min(max_chars);
                while !remaining.is_char_boundary(split_at) {
                    split_at -= 1;
                }
                let actual = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind(char::is_whitespace)
                        .filter(|&pos| pos > 0)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let actual = if actual == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    actual
                };
                let piece = remaining[..actual].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn element_id(file_data: &FileData, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_data.identifier.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

fn base_metadata(file_data: &FileData) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(ids) = &file_data.source_identifiers {
        metadata.insert("filename".into(), json!(ids.filename));
        metadata.insert("file_directory".into(), json!(parent_dir(&ids.fullpath)));
    }
    let source = &file_data.metadata;
    let mut data_source = Map::new();
    data_source.insert("connector_type".into(), json!(file_data.connector_type));
    if let Some(url) = &source.url {
        data_source.insert("url".into(), json!(url));
    }
    if let Some(version) = &source.version {
        data_source.insert("version".into(), json!(version));
    }
    if let Some(created) = &source.date_created {
        data_source.insert("date_created".into(), json!(created.to_rfc3339()));
    }
    if let Some(modified) = &source.date_modified {
        data_source.insert("date_modified".into(), json!(modified.to_rfc3339()));
    }
    if let Some(locator) = &source.record_locator {
        data_source.insert("record_locator".into(), Value::Object(locator.clone()));
    }
    metadata.insert("data_source".into(), Value::Object(data_source));
    metadata
}

fn parent_dir(fullpath: &str) -> String {
    Path::new(fullpath)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn text_element(file_data: &FileData, index: usize, text: &str) -> Value {
    json!({
        "type": "NarrativeText",
        "element_id": element_id(file_data, index, text),
        "text": text,
        "metadata": Value::Object(base_metadata(file_data)),
    })
}

/// Structured records keep their own fields; missing `text`/`metadata`
/// are filled in, existing ones win.
fn record_element(file_data: &FileData, index: usize, record: Value) -> Value {
    let mut obj = match record {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("text".into(), Value::String(value_text(&other)));
            map
        }
    };
    let text = obj
        .get("text")
        .map(value_text)
        .unwrap_or_else(|| Value::Object(obj.clone()).to_string());
    obj.entry("type").or_insert_with(|| json!("Record"));
    obj.entry("element_id")
        .or_insert_with(|| json!(element_id(file_data, index, &text)));
    obj.entry("text").or_insert_with(|| json!(text));

    let mut metadata = base_metadata(file_data);
    if let Some(Value::Object(existing)) = obj.remove("metadata") {
        metadata.extend(existing);
    }
    obj.insert("metadata".into(), Value::Object(metadata));
    Value::Object(obj)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceIdentifiers;

    fn file_data() -> FileData {
        FileData::new("doc-1", "local")
            .unwrap()
            .with_source_identifiers(SourceIdentifiers::new("a.txt", "/in/a.txt"))
    }

    #[test]
    fn paragraphs_pack_under_limit() {
        let pieces = split_paragraphs("First.\n\nSecond.\n\nThird.", 100);
        assert_eq!(pieces, vec!["First.\n\nSecond.\n\nThird."]);
        let pieces = split_paragraphs("This is paragraph one.\n\nThis is paragraph two.", 25);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn long_paragraph_is_hard_split() {
        let text = "word ".repeat(100);
        let pieces = split_paragraphs(&text, 20);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 20));
        assert!(split_paragraphs("", 20).is_empty());
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(50);
        let pieces = split_paragraphs(&text, 7);
        assert_eq!(pieces.concat(), text);
    }

    #[tokio::test]
    async fn text_files_become_elements_with_stable_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("a.txt");
        std::fs::write(&input, "Alpha.\n\nBeta.").unwrap();
        let download = DownloadResponse::fetched(file_data(), input);

        let out = tmp.path().join("out").join("doc-1.json");
        let partitioner = BasicPartitioner::new(2);
        partitioner.partition(&download, &out).await.unwrap();
        let first: Vec<Value> = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        partitioner.partition(&download, &out).await.unwrap();
        let second: Vec<Value> = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0]["text"], "Alpha.");
        assert_eq!(first[0]["metadata"]["filename"], "a.txt");
        assert_eq!(first[0]["metadata"]["data_source"]["connector_type"], "local");
    }

    #[test]
    fn json_records_keep_their_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("batch.json");
        std::fs::write(
            &input,
            r#"[{"id": 1, "text": "hello", "metadata": {"filename": "override"}}, {"id": 2}]"#,
        )
        .unwrap();
        let elements = BasicPartitioner::default()
            .partition_file(&input, &file_data())
            .unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["text"], "hello");
        assert_eq!(elements[0]["metadata"]["filename"], "override");
        assert_eq!(elements[1]["type"], "Record");
        assert!(elements[1]["element_id"].is_string());
        assert_eq!(elements[1]["text"], r#"{"id":2}"#);
    }
}
