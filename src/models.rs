//! Core data models threaded through the ingest pipeline.
//!
//! [`FileData`] is the unit-of-work record: an indexer produces one per
//! discovered document (or per batch of ids), and every later stage reads
//! it back. It round-trips losslessly through JSON so that runs can be
//! persisted between stages and resumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Where a unit lives at its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentifiers {
    pub filename: String,
    pub fullpath: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
}

impl SourceIdentifiers {
    pub fn new(filename: impl Into<String>, fullpath: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            fullpath: fullpath.into(),
            rel_path: None,
        }
    }

    pub fn with_rel_path(mut self, rel_path: impl Into<String>) -> Self {
        self.rel_path = Some(rel_path.into());
        self
    }

    /// File name without its final extension (`"report.final.pdf"` → `"report.final"`).
    pub fn filename_stem(&self) -> String {
        Path::new(&self.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Explicit relative path, falling back to the full path.
    pub fn relative_path(&self) -> &str {
        self.rel_path.as_deref().unwrap_or(&self.fullpath)
    }
}

/// Whether a [`FileData`] describes one document or a batch of source ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    #[default]
    File,
    Batch,
}

/// Source-side metadata captured at indexing time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDataSourceMetadata {
    /// `false` when the object vanished between indexing and download.
    /// This is a terminal state, not an error.
    #[serde(default = "default_exists")]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_processed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize_bytes: Option<u64>,
    /// Connector-specific pointer back to the record (bucket/key, table/row, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_locator: Option<Map<String, Value>>,
}

fn default_exists() -> bool {
    true
}

impl Default for FileDataSourceMetadata {
    fn default() -> Self {
        Self {
            exists: true,
            url: None,
            version: None,
            date_created: None,
            date_modified: None,
            date_processed: None,
            filesize_bytes: None,
            record_locator: None,
        }
    }
}

/// The unit-of-work record that flows through every pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub identifier: String,
    pub connector_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_identifiers: Option<SourceIdentifiers>,
    #[serde(default)]
    pub doc_type: DocType,
    #[serde(default)]
    pub metadata: FileDataSourceMetadata,
    #[serde(default)]
    pub additional_metadata: Map<String, Value>,
    /// Redo this unit even if its output already exists.
    #[serde(default)]
    pub reprocess: bool,
}

impl FileData {
    /// Build a record, rejecting blank identifiers or connector types.
    pub fn new(identifier: impl Into<String>, connector_type: impl Into<String>) -> Result<Self> {
        let file_data = Self {
            identifier: identifier.into(),
            connector_type: connector_type.into(),
            source_identifiers: None,
            doc_type: DocType::File,
            metadata: FileDataSourceMetadata::default(),
            additional_metadata: Map::new(),
            reprocess: false,
        };
        file_data.validate()?;
        Ok(file_data)
    }

    pub fn with_source_identifiers(mut self, ids: SourceIdentifiers) -> Self {
        self.source_identifiers = Some(ids);
        self
    }

    pub fn with_metadata(mut self, metadata: FileDataSourceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_doc_type(mut self, doc_type: DocType) -> Self {
        self.doc_type = doc_type;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(IngestError::Value("file data identifier is empty".into()));
        }
        if self.connector_type.trim().is_empty() {
            return Err(IngestError::Value(format!(
                "file data {} has an empty connector_type",
                self.identifier
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Strict parse: malformed JSON or a missing `identifier` /
    /// `connector_type` is a [`IngestError::Value`].
    pub fn from_json(json: &str) -> Result<Self> {
        let file_data: FileData = serde_json::from_str(json)
            .map_err(|e| IngestError::Value(format!("invalid file data document: {}", e)))?;
        file_data.validate()?;
        Ok(file_data)
    }

    /// Write the record to `path`, creating parent directories.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(IngestError::Value(format!(
                "file data path not valid: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// How a download request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// Content was fetched from the source.
    Fetched,
    /// The staging path already existed and the fetch was skipped.
    Cached,
    /// The source object no longer exists; nothing was written.
    Absent,
}

/// Result of a single download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResponse {
    pub file_data: FileData,
    pub path: PathBuf,
    pub outcome: DownloadOutcome,
}

impl DownloadResponse {
    pub fn fetched(file_data: FileData, path: PathBuf) -> Self {
        Self {
            file_data,
            path,
            outcome: DownloadOutcome::Fetched,
        }
    }

    pub fn cached(file_data: FileData, path: PathBuf) -> Self {
        Self {
            file_data,
            path,
            outcome: DownloadOutcome::Cached,
        }
    }

    pub fn absent(file_data: FileData, path: PathBuf) -> Self {
        Self {
            file_data,
            path,
            outcome: DownloadOutcome::Absent,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.outcome == DownloadOutcome::Absent
    }
}

/// A staged file ready for upload, paired with the unit it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadContent {
    pub path: PathBuf,
    pub file_data: FileData,
}
