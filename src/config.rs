//! TOML run configuration.
//!
//! ```toml
//! [processor]
//! work_dir = ".ingest"
//! concurrency = 8
//! batch_size = 100
//!
//! [retry]
//! max_attempts = 3
//! timeout_secs = 30
//!
//! [source]
//! type = "local"
//! [source.connection]
//! root = "./docs"
//!
//! [destination]
//! type = "sqlite"
//! [destination.connection]
//! table = "elements"
//! [destination.access]
//! url = "sqlite:./out/elements.db"
//! ```
//!
//! The `[source.*]` and `[destination.*]` tables are opaque here; the
//! registry entry for the selected `type` deserializes them into the
//! connector's own typed configs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::logging::LogConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LogConfig,
    pub source: ConnectorSection,
    pub destination: ConnectorSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fetch again even when the staging path already exists.
    #[serde(default)]
    pub re_download: bool,
    /// Redo every unit even when its output already exists.
    #[serde(default)]
    pub reprocess: bool,
    #[serde(default)]
    pub uncompress: bool,
    /// Fail the run on the first unit error instead of reporting it.
    #[serde(default)]
    pub raise_on_error: bool,
    #[serde(default = "default_true")]
    pub persist_file_data: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            download_dir: None,
            output_dir: None,
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            re_download: false,
            reprocess: false,
            uncompress: false,
            raise_on_error: false,
            persist_file_data: true,
        }
    }
}

impl ProcessorConfig {
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("download"))
    }

    /// Where partitioned element files land.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("partitioned"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staged")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.work_dir.join("index")
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".ingest")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Retry policy applied to every network call made by a connector.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// A source or destination selection: registry tag plus option tables.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorSection {
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default = "empty_table")]
    pub connection: serde_json::Value,
    #[serde(default = "empty_table")]
    pub access: serde_json::Value,
    #[serde(default = "empty_table")]
    pub indexer: serde_json::Value,
    #[serde(default = "empty_table")]
    pub downloader: serde_json::Value,
    #[serde(default = "empty_table")]
    pub uploader: serde_json::Value,
    #[serde(default = "empty_table")]
    pub stager: serde_json::Value,
}

fn empty_table() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ConnectorSection {
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            connection: empty_table(),
            access: empty_table(),
            indexer: empty_table(),
            downloader: empty_table(),
            uploader: empty_table(),
            stager: empty_table(),
        }
    }

    /// Connection table with the access table nested under `access`.
    pub fn connection_with_access(&self) -> serde_json::Value {
        let mut connection = match &self.connection {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        connection.insert("access".to_string(), self.access.clone());
        serde_json::Value::Object(connection)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.processor.concurrency == 0 {
        bail!("processor.concurrency must be > 0");
    }
    if config.processor.batch_size == 0 {
        bail!("processor.batch_size must be > 0");
    }

    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        bail!("retry.initial_backoff_ms must be <= retry.max_backoff_ms");
    }
    if config.retry.timeout_secs == 0 {
        bail!("retry.timeout_secs must be > 0");
    }

    if config.source.connector_type.trim().is_empty() {
        bail!("source.type must be set");
    }
    if config.destination.connector_type.trim().is_empty() {
        bail!("destination.type must be set");
    }

    for (name, section) in [("source", &config.source), ("destination", &config.destination)] {
        for (table, value) in [
            ("connection", &section.connection),
            ("access", &section.access),
            ("indexer", &section.indexer),
            ("downloader", &section.downloader),
            ("uploader", &section.uploader),
            ("stager", &section.stager),
        ] {
            if !value.is_object() {
                bail!("{}.{} must be a table", name, table);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[source]
type = "local"

[destination]
type = "local"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.processor.batch_size, 100);
        assert!(config.processor.concurrency >= 1);
        assert!(!config.processor.re_download);
        assert!(config.processor.persist_file_data);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.processor.download_dir(),
            PathBuf::from(".ingest/download")
        );
        assert_eq!(config.source.connector_type, "local");
        assert!(config.source.indexer.as_object().unwrap().is_empty());
    }

    #[test]
    fn connector_tables_are_kept_opaque() {
        let config = parse_config(
            r#"
[source]
type = "ndjson"
[source.indexer]
path = "records.ndjson"
batch_size = 25

[destination]
type = "sqlite"
[destination.connection]
table = "elements"
[destination.access]
url = "sqlite::memory:"
"#,
        )
        .unwrap();
        assert_eq!(config.source.indexer["batch_size"], 25);
        let merged = config.destination.connection_with_access();
        assert_eq!(merged["table"], "elements");
        assert_eq!(merged["access"]["url"], "sqlite::memory:");
    }

    #[test]
    fn rejects_invalid_values() {
        let bad = format!("[processor]\nconcurrency = 0\n{}", MINIMAL);
        assert!(parse_config(&bad).is_err());

        let bad = format!("[processor]\nbatch_size = 0\n{}", MINIMAL);
        assert!(parse_config(&bad).is_err());

        let bad = format!("[retry]\nmax_attempts = 0\n{}", MINIMAL);
        assert!(parse_config(&bad).is_err());

        let bad = format!(
            "[retry]\ninitial_backoff_ms = 10\nmax_backoff_ms = 5\n{}",
            MINIMAL
        );
        assert!(parse_config(&bad).is_err());

        assert!(parse_config("[source]\ntype = \"\"\n[destination]\ntype = \"x\"").is_err());
        assert!(parse_config("[destination]\ntype = \"x\"").is_err());
    }
}
