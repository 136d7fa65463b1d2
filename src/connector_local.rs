//! Local filesystem connector.
//!
//! As a source it walks a directory tree, applies include/exclude globs,
//! and emits one [`FileData`] per matching file as the walk reaches it.
//! Entries are visited in file-name order within each directory.
//! As a destination it copies each unit's output under an output
//! directory, mirroring the source's relative layout.
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! type = "local"
//! connection = { root = "./docs" }
//! indexer = { include_globs = ["**/*.md"], exclude_globs = ["drafts/**"] }
//!
//! [destination]
//! type = "local"
//! connection = { output_dir = "./out" }
//! ```
//!
//! `.git`, `target` and `node_modules` directories are always excluded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::download::unit_stem;
use crate::error::{IngestError, Result};
use crate::models::{DownloadResponse, FileData, FileDataSourceMetadata, SourceIdentifiers, UploadContent};
use crate::registry::{DestinationConnector, SourceConnector};
use crate::secret::{ConnectionConfig, NoAccess};
use crate::traits::{blocking_stream, Downloader, FileDataStream, Indexer, NoStager, Uploader};

pub const CONNECTOR_TYPE: &str = "local";

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConnection {
    pub root: PathBuf,
    #[serde(default)]
    pub access: NoAccess,
}

impl ConnectionConfig for LocalConnection {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalIndexerConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for LocalIndexerConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

pub struct LocalSource;

impl SourceConnector for LocalSource {
    const CONNECTOR_TYPE: &'static str = CONNECTOR_TYPE;

    type Connection = LocalConnection;
    type IndexerConfig = LocalIndexerConfig;
    type DownloaderConfig = IgnoredAny;
    type Indexer = LocalIndexer;
    type Downloader = LocalDownloader;

    fn indexer(connection: LocalConnection, config: LocalIndexerConfig) -> Result<LocalIndexer> {
        LocalIndexer::new(connection, config)
    }

    fn downloader(
        connection: LocalConnection,
        _config: IgnoredAny,
        download_dir: PathBuf,
    ) -> Result<LocalDownloader> {
        Ok(LocalDownloader::new(connection, download_dir))
    }
}

#[derive(Clone)]
pub struct LocalIndexer {
    connection: LocalConnection,
    config: LocalIndexerConfig,
    include: GlobSet,
    exclude: GlobSet,
}

impl LocalIndexer {
    pub fn new(connection: LocalConnection, config: LocalIndexerConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;
        Ok(Self {
            connection,
            config,
            include,
            exclude,
        })
    }

    /// Walk the tree, handing each unit to `emit` as it is found. Stops
    /// early when `emit` returns false.
    fn scan(&self, emit: &mut dyn FnMut(Result<FileData>) -> bool) {
        let root = &self.connection.root;
        let mut units = 0usize;
        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let item = match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let path = entry.path();
                    let relative = path.strip_prefix(root).unwrap_or(path);
                    let rel_str = relative.to_string_lossy().replace('\\', "/");
                    if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                        continue;
                    }
                    file_data_for(path, &rel_str)
                }
                Err(e) => Err(IngestError::Value(format!(
                    "cannot walk {}: {}",
                    root.display(),
                    e
                ))),
            };
            if !emit(item) {
                return;
            }
            units += 1;
        }
        tracing::debug!(root = %root.display(), units, "local scan complete");
    }
}

#[async_trait]
impl Indexer for LocalIndexer {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    async fn precheck(&self) -> Result<()> {
        check_root(&self.connection.root)
    }

    fn run(&self) -> FileDataStream<'_> {
        let indexer = self.clone();
        blocking_stream(move |emit| indexer.scan(emit))
    }
}

fn check_root(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(IngestError::SourceConnection(format!(
            "local source root is not a directory: {}",
            root.display()
        )));
    }
    Ok(())
}

fn file_data_for(path: &Path, relative_path: &str) -> Result<FileData> {
    let stat = std::fs::metadata(path)?;
    let modified: Option<DateTime<Utc>> = stat.modified().ok().map(DateTime::from);
    let created: Option<DateTime<Utc>> = stat.created().ok().map(DateTime::from);
    let fullpath = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut locator = serde_json::Map::new();
    locator.insert("path".into(), fullpath.to_string_lossy().into());

    let metadata = FileDataSourceMetadata {
        url: Some(format!("file://{}", fullpath.display())),
        version: modified.map(|m| m.timestamp_millis().to_string()),
        date_created: created,
        date_modified: modified,
        filesize_bytes: Some(stat.len()),
        record_locator: Some(locator),
        ..FileDataSourceMetadata::default()
    };

    let identifier = hex::encode(Sha256::digest(relative_path.as_bytes()));
    Ok(FileData::new(identifier, CONNECTOR_TYPE)?
        .with_source_identifiers(
            SourceIdentifiers::new(filename, fullpath.to_string_lossy()).with_rel_path(relative_path),
        )
        .with_metadata(metadata))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IngestError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IngestError::Config(format!("invalid glob set: {}", e)))
}

/// Copies the source file into the download area.
pub struct LocalDownloader {
    connection: LocalConnection,
    download_dir: PathBuf,
}

impl LocalDownloader {
    pub fn new(connection: LocalConnection, download_dir: PathBuf) -> Self {
        Self {
            connection,
            download_dir,
        }
    }

    fn source_path(&self, file_data: &FileData) -> Result<PathBuf> {
        let ids = file_data.source_identifiers.as_ref().ok_or_else(|| {
            IngestError::Value(format!("unit {} has no source path", file_data.identifier))
        })?;
        match &ids.rel_path {
            Some(rel) => Ok(self.connection.root.join(rel)),
            None => Ok(PathBuf::from(&ids.fullpath)),
        }
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn precheck(&self) -> Result<()> {
        check_root(&self.connection.root)
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        let source = self.source_path(file_data)?;
        let target = self.download_path(file_data);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target)
            .map_err(|e| IngestError::from_source_io(e, &source.display().to_string()))?;
        Ok(DownloadResponse::fetched(file_data.clone(), target))
    }

    fn is_async(&self) -> bool {
        true
    }

    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        let source = self.source_path(file_data)?;
        let target = self.download_path(file_data);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| IngestError::from_source_io(e, &source.display().to_string()))?;
        Ok(DownloadResponse::fetched(file_data.clone(), target))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Destination
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDestinationConnection {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub access: NoAccess,
}

impl ConnectionConfig for LocalDestinationConnection {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }
}

pub struct LocalDestination;

impl DestinationConnector for LocalDestination {
    const CONNECTOR_TYPE: &'static str = CONNECTOR_TYPE;

    type Connection = LocalDestinationConnection;
    type UploaderConfig = IgnoredAny;
    type StagerConfig = IgnoredAny;
    type Uploader = LocalUploader;
    type Stager = NoStager;

    fn uploader(connection: LocalDestinationConnection, _config: IgnoredAny) -> Result<LocalUploader> {
        Ok(LocalUploader::new(connection))
    }

    fn stager(_config: IgnoredAny) -> Result<Option<NoStager>> {
        Ok(None)
    }
}

pub struct LocalUploader {
    connection: LocalDestinationConnection,
}

impl LocalUploader {
    pub fn new(connection: LocalDestinationConnection) -> Self {
        Self { connection }
    }

    /// `<output_dir>/<relative source path>.json`, or the unit's stem when
    /// the relative path would escape the output directory.
    pub fn destination_path(&self, file_data: &FileData) -> PathBuf {
        let relative = file_data
            .source_identifiers
            .as_ref()
            .map(|ids| PathBuf::from(ids.relative_path()))
            .filter(|p| p.components().all(|c| matches!(c, Component::Normal(_))))
            .filter(|p| p.components().next().is_some());
        let mut name = match relative {
            Some(rel) => rel.into_os_string(),
            None => unit_stem(&file_data.identifier).into(),
        };
        name.push(".json");
        self.connection.output_dir.join(name)
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn is_batch(&self) -> bool {
        false
    }

    async fn precheck(&self) -> Result<()> {
        let dir = &self.connection.output_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            IngestError::DestinationConnection(format!(
                "cannot create output directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let meta = tokio::fs::metadata(dir).await.map_err(|e| {
            IngestError::DestinationConnection(format!("{}: {}", dir.display(), e))
        })?;
        if meta.permissions().readonly() {
            return Err(IngestError::DestinationConnection(format!(
                "output directory is read-only: {}",
                dir.display()
            )));
        }
        Ok(())
    }

    async fn run(&self, contents: &[UploadContent]) -> Result<()> {
        for content in contents {
            let target = self.destination_path(&content.file_data);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&content.path, &target)
                .await
                .map_err(|e| IngestError::Write(format!("{}: {}", target.display(), e)))?;
            tracing::debug!(path = %target.display(), "uploaded");
        }
        Ok(())
    }
}
