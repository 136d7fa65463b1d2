//! Newline-delimited JSON batch source.
//!
//! Treats one `.ndjson` file as a table of records keyed by `id_field`.
//! The indexer reads the file line by line on the blocking pool and emits
//! one batch [`FileData`] as soon as `batch_size` ids have accumulated, with
//! the ids carried in `additional_metadata.ids`. The downloader re-reads the
//! file and writes the matching records as a JSON array, optionally
//! projected to a subset of `fields`.
//!
//! ```toml
//! [source]
//! type = "ndjson"
//! connection = { path = "./records.ndjson" }
//! indexer = { id_field = "id", batch_size = 50 }
//! downloader = { fields = ["id", "text"] }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::download::unit_stem;
use crate::error::{IngestError, Result};
use crate::models::{DocType, DownloadResponse, FileData, FileDataSourceMetadata};
use crate::registry::SourceConnector;
use crate::secret::{ConnectionConfig, NoAccess};
use crate::traits::{blocking_stream, Downloader, FileDataStream, Indexer};

pub const CONNECTOR_TYPE: &str = "ndjson";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdjsonConnection {
    pub path: PathBuf,
    #[serde(default)]
    pub access: NoAccess,
}

impl ConnectionConfig for NdjsonConnection {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NdjsonIndexerConfig {
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for NdjsonIndexerConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_id_field() -> String {
    "id".to_string()
}
fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NdjsonDownloaderConfig {
    /// Keep only these fields of each record. All fields when unset.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

pub struct NdjsonSource;

impl SourceConnector for NdjsonSource {
    const CONNECTOR_TYPE: &'static str = CONNECTOR_TYPE;

    type Connection = NdjsonConnection;
    type IndexerConfig = NdjsonIndexerConfig;
    type DownloaderConfig = NdjsonDownloaderConfig;
    type Indexer = NdjsonIndexer;
    type Downloader = NdjsonDownloader;

    fn indexer(connection: NdjsonConnection, config: NdjsonIndexerConfig) -> Result<NdjsonIndexer> {
        if config.batch_size == 0 {
            return Err(IngestError::Config("ndjson indexer batch_size must be > 0".into()));
        }
        Ok(NdjsonIndexer { connection, config })
    }

    fn downloader(
        connection: NdjsonConnection,
        config: NdjsonDownloaderConfig,
        download_dir: PathBuf,
    ) -> Result<NdjsonDownloader> {
        Ok(NdjsonDownloader {
            connection,
            config,
            download_dir,
        })
    }
}

fn check_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(IngestError::SourceConnection(format!(
            "ndjson source file not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Lazily parse every non-blank line. Each item is `(line number, record)`;
/// iteration ends after the first read error.
fn read_lines(path: &Path) -> Result<impl Iterator<Item = (usize, Result<Value>)>> {
    let file = std::fs::File::open(path)
        .map_err(|e| IngestError::from_source_io(e, &path.display().to_string()))?;
    let display = path.display().to_string();
    let mut failed = false;
    Ok(BufReader::new(file)
        .lines()
        .enumerate()
        .map_while(move |(i, line)| {
            if failed {
                return None;
            }
            let line_no = i + 1;
            let parsed = match line {
                Ok(line) if line.trim().is_empty() => return Some(None),
                Ok(line) => serde_json::from_str::<Value>(&line).map_err(|e| {
                    IngestError::Value(format!("{} line {}: {}", display, line_no, e))
                }),
                Err(e) => {
                    failed = true;
                    Err(IngestError::from_source_io(
                        e,
                        &format!("{} line {}", display, line_no),
                    ))
                }
            };
            Some(Some((line_no, parsed)))
        })
        .flatten())
}

fn record_id(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct NdjsonIndexer {
    connection: NdjsonConnection,
    config: NdjsonIndexerConfig,
}

impl NdjsonIndexer {
    /// Feed batches to `emit` while reading; stops when `emit` returns false.
    fn scan(&self, emit: &mut dyn FnMut(Result<FileData>) -> bool) {
        let path = &self.connection.path;
        let lines = match read_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                emit(Err(e));
                return;
            }
        };

        let mut units = 0usize;
        let mut ids = Vec::with_capacity(self.config.batch_size);
        for (line, parsed) in lines {
            let id = parsed.and_then(|record| {
                record_id(&record, &self.config.id_field).ok_or_else(|| {
                    IngestError::Value(format!(
                        "{} line {}: missing '{}'",
                        path.display(),
                        line,
                        self.config.id_field
                    ))
                })
            });
            let item = match id {
                Ok(id) => {
                    ids.push(id);
                    if ids.len() < self.config.batch_size {
                        continue;
                    }
                    self.batch_file_data(&std::mem::take(&mut ids))
                }
                Err(e) => Err(e),
            };
            if !emit(item) {
                return;
            }
            units += 1;
        }

        if !ids.is_empty() && emit(self.batch_file_data(&ids)) {
            units += 1;
        }
        tracing::debug!(path = %path.display(), units, "ndjson index complete");
    }

    fn batch_file_data(&self, ids: &[String]) -> Result<FileData> {
        let mut hasher = Sha256::new();
        hasher.update(self.connection.path.to_string_lossy().as_bytes());
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([0]);
        }
        let identifier = hex::encode(hasher.finalize())[..32].to_string();

        let mut locator = Map::new();
        locator.insert("path".into(), json!(self.connection.path.to_string_lossy()));
        locator.insert("id_field".into(), json!(self.config.id_field));

        let metadata = FileDataSourceMetadata {
            url: Some(format!("file://{}", self.connection.path.display())),
            record_locator: Some(locator),
            ..FileDataSourceMetadata::default()
        };
        let mut file_data = FileData::new(identifier, CONNECTOR_TYPE)?
            .with_doc_type(DocType::Batch)
            .with_metadata(metadata);
        file_data
            .additional_metadata
            .insert("ids".into(), json!(ids));
        file_data
            .additional_metadata
            .insert("id_field".into(), json!(self.config.id_field));
        Ok(file_data)
    }
}

#[async_trait]
impl Indexer for NdjsonIndexer {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    async fn precheck(&self) -> Result<()> {
        check_file(&self.connection.path)
    }

    fn run(&self) -> FileDataStream<'_> {
        let indexer = self.clone();
        blocking_stream(move |emit| indexer.scan(emit))
    }
}

pub struct NdjsonDownloader {
    connection: NdjsonConnection,
    config: NdjsonDownloaderConfig,
    download_dir: PathBuf,
}

impl NdjsonDownloader {
    fn batch_ids(file_data: &FileData) -> Result<(String, HashSet<String>)> {
        let ids = file_data
            .additional_metadata
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                IngestError::Value(format!(
                    "batch {} has no additional_metadata.ids",
                    file_data.identifier
                ))
            })?;
        let id_field = file_data
            .additional_metadata
            .get("id_field")
            .and_then(Value::as_str)
            .unwrap_or("id")
            .to_string();
        let ids = ids
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        Ok((id_field, ids))
    }

    fn project(&self, record: Value) -> Value {
        match (&self.config.fields, record) {
            (Some(fields), Value::Object(map)) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == k))
                    .collect(),
            ),
            (_, record) => record,
        }
    }
}

#[async_trait]
impl Downloader for NdjsonDownloader {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn download_path(&self, file_data: &FileData) -> PathBuf {
        self.download_dir
            .join(CONNECTOR_TYPE)
            .join(format!("{}.json", unit_stem(&file_data.identifier)))
    }

    async fn precheck(&self) -> Result<()> {
        check_file(&self.connection.path)
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        let (id_field, wanted) = Self::batch_ids(file_data)?;
        let mut records = Vec::with_capacity(wanted.len());
        for (_, parsed) in read_lines(&self.connection.path)? {
            let record = match parsed {
                Ok(record) => record,
                Err(IngestError::Value(_)) => continue,
                Err(e) => return Err(e),
            };
            if record_id(&record, &id_field).is_some_and(|id| wanted.contains(&id)) {
                records.push(self.project(record));
            }
        }

        let path = self.download_path(file_data);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec(&records)?)?;
        tracing::debug!(
            identifier = %file_data.identifier,
            records = records.len(),
            "ndjson batch downloaded"
        );
        Ok(DownloadResponse::fetched(file_data.clone(), path))
    }
}
