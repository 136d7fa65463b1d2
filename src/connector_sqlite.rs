//! SQLite destination.
//!
//! The stager conforms every element to one row shape:
//!
//! ```text
//! { "id": <element_id>, "record_id": <unit identifier>, "text": <text>, "metadata": { flattened } }
//! ```
//!
//! The uploader creates the table on first connect and upserts staged rows
//! in transactions of `batch_size` rows, keyed on `id`, so re-running the
//! same input never duplicates rows.
//!
//! ```toml
//! [destination]
//! type = "sqlite"
//! connection = { path = "./out/elements.db", table = "elements" }
//! # or supply the full URL as a secret:
//! access = { url = "sqlite:/var/lib/ingest/elements.db" }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::client::ClientHandle;
use crate::error::{IngestError, Result};
use crate::models::{FileData, UploadContent};
use crate::registry::DestinationConnector;
use crate::secret::{ConnectionConfig, Sensitive};
use crate::stage::{flatten_metadata, read_elements, stable_element_id, write_elements};
use crate::traits::{UploadStager, Uploader};
use crate::upload::{read_staged_records, write_batches};

pub const CONNECTOR_TYPE: &str = "sqlite";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqliteAccess {
    /// Full connection URL. Takes precedence over `path`.
    #[serde(default)]
    pub url: Option<Sensitive<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConnection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub access: SqliteAccess,
}

fn default_table() -> String {
    "elements".to_string()
}

impl ConnectionConfig for SqliteConnection {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }
}

impl SqliteConnection {
    fn validate(&self) -> Result<()> {
        let mut chars = self.table.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(IngestError::Config(format!(
                "invalid sqlite table name '{}'",
                self.table
            )));
        }
        if self.access.url.is_none() && self.path.is_none() {
            return Err(IngestError::Config(
                "sqlite destination needs connection.path or access.url".into(),
            ));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<SqlitePool> {
        let url = match (&self.access.url, &self.path) {
            (Some(url), _) => url.expose().clone(),
            (None, Some(path)) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                format!("sqlite:{}", path.display())
            }
            (None, None) => {
                return Err(IngestError::Config(
                    "sqlite destination needs connection.path or access.url".into(),
                ))
            }
        };

        // The URL may carry credentials; never echo it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|_| IngestError::DestinationConnection("invalid sqlite connection url".into()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| IngestError::DestinationConnection(format!("sqlite connect failed: {}", e)))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                text TEXT,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                updated_at INTEGER NOT NULL
            )
            "#,
            self.table
        ))
        .execute(&pool)
        .await
        .map_err(|e| IngestError::DestinationConnection(format!("cannot create table: {}", e)))?;

        tracing::debug!(table = %self.table, "sqlite pool ready");
        Ok(pool)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stager
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteStagerConfig {
    #[serde(default = "default_separator")]
    pub metadata_separator: String,
}

impl Default for SqliteStagerConfig {
    fn default() -> Self {
        Self {
            metadata_separator: default_separator(),
        }
    }
}

fn default_separator() -> String {
    "-".to_string()
}

pub struct SqliteStager {
    config: SqliteStagerConfig,
}

impl SqliteStager {
    pub fn new(config: SqliteStagerConfig) -> Self {
        Self { config }
    }

    /// One row per element. The element's own `element_id` becomes the row
    /// id; every field except `text` is flattened into `metadata`.
    pub fn conform(&self, file_data: &FileData, index: usize, element: &Value) -> Value {
        let id = element
            .get("element_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| stable_element_id(file_data, index, element));
        let mut rest = element.clone();
        let text = rest
            .as_object_mut()
            .and_then(|obj| obj.remove("text"))
            .unwrap_or(Value::Null);
        let metadata = match &rest {
            Value::Object(_) => flatten_metadata(&rest, &self.config.metadata_separator),
            _ => Default::default(),
        };
        json!({
            "id": id,
            "record_id": file_data.identifier,
            "text": text,
            "metadata": Value::Object(metadata),
        })
    }
}

impl UploadStager for SqliteStager {
    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn run(
        &self,
        elements_path: &Path,
        file_data: &FileData,
        output_dir: &Path,
        output_filename: &str,
    ) -> Result<PathBuf> {
        let rows: Vec<Value> = read_elements(elements_path)?
            .iter()
            .enumerate()
            .map(|(i, element)| self.conform(file_data, i, element))
            .collect();
        let path = output_dir.join(format!("{}.json", output_filename));
        write_elements(&path, &rows)?;
        Ok(path)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Uploader
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteUploaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SqliteUploaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SqliteUploader {
    connection: SqliteConnection,
    config: SqliteUploaderConfig,
    #[serde(default = "ClientHandle::detached")]
    client: ClientHandle<SqlitePool>,
}

#[derive(Deserialize)]
struct StagedRow {
    id: String,
    record_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl SqliteUploader {
    pub fn new(connection: SqliteConnection, config: SqliteUploaderConfig) -> Result<Self> {
        connection.validate()?;
        if config.batch_size == 0 {
            return Err(IngestError::Config("sqlite uploader batch_size must be > 0".into()));
        }
        Ok(Self {
            connection,
            config,
            client: ClientHandle::new(),
        })
    }

    /// Shared pool, connected on first use.
    pub async fn pool(&self) -> Result<&SqlitePool> {
        self.client.get_or_connect(|| self.connection.connect()).await
    }

    /// Drop the pool so the next use reconnects.
    pub fn reconnect(&mut self) {
        self.client.reconnect();
    }

    pub fn table(&self) -> &str {
        &self.connection.table
    }
}

#[async_trait]
impl Uploader for SqliteUploader {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    async fn precheck(&self) -> Result<()> {
        let pool = self.pool().await.map_err(|e| match e {
            IngestError::DestinationConnection(msg) => IngestError::DestinationConnection(msg),
            other => IngestError::DestinationConnection(other.to_string()),
        })?;
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| IngestError::DestinationConnection(format!("sqlite precheck failed: {}", e)))?;
        Ok(())
    }

    async fn run(&self, contents: &[UploadContent]) -> Result<()> {
        let records = read_staged_records(contents)?;
        let total = records.len();
        let pool = self.pool().await?;
        let sql = format!(
            "INSERT INTO {} (id, record_id, text, metadata, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET record_id = excluded.record_id, text = excluded.text, \
             metadata = excluded.metadata, updated_at = excluded.updated_at",
            self.connection.table
        );
        let sql = sql.as_str();
        let now = chrono::Utc::now().timestamp();

        let batches = write_batches(records, self.config.batch_size, move |_, batch| async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| IngestError::Write(e.to_string()))?;
            for record in batch {
                let row: StagedRow = serde_json::from_value(record)
                    .map_err(|e| IngestError::Write(format!("staged row has wrong shape: {}", e)))?;
                sqlx::query(sql)
                    .bind(row.id)
                    .bind(row.record_id)
                    .bind(row.text)
                    .bind(Value::Object(row.metadata).to_string())
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| IngestError::Write(e.to_string()))?;
            }
            tx.commit()
                .await
                .map_err(|e| IngestError::Write(e.to_string()))
        })
        .await?;

        tracing::info!(
            table = %self.connection.table,
            rows = total,
            batches,
            "sqlite upload complete"
        );
        Ok(())
    }
}

pub struct SqliteDestination;

impl DestinationConnector for SqliteDestination {
    const CONNECTOR_TYPE: &'static str = CONNECTOR_TYPE;

    type Connection = SqliteConnection;
    type UploaderConfig = SqliteUploaderConfig;
    type StagerConfig = SqliteStagerConfig;
    type Uploader = SqliteUploader;
    type Stager = SqliteStager;

    fn uploader(connection: SqliteConnection, config: SqliteUploaderConfig) -> Result<SqliteUploader> {
        SqliteUploader::new(connection, config)
    }

    fn stager(config: SqliteStagerConfig) -> Result<Option<SqliteStager>> {
        Ok(Some(SqliteStager::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceIdentifiers;
    use tempfile::TempDir;

    fn connection(dir: &Path) -> SqliteConnection {
        SqliteConnection {
            path: Some(dir.join("db").join("out.db")),
            table: "elements".into(),
            access: SqliteAccess::default(),
        }
    }

    fn staged(dir: &Path, name: &str, rows: &[Value]) -> UploadContent {
        let path = dir.join(format!("{}.json", name));
        write_elements(&path, rows).unwrap();
        UploadContent {
            path,
            file_data: FileData::new(name, "local").unwrap(),
        }
    }

    async fn count(uploader: &SqliteUploader) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM elements")
            .fetch_one(uploader.pool().await.unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn stager_conforms_elements() {
        let tmp = TempDir::new().unwrap();
        let elements = tmp.path().join("doc.json");
        write_elements(
            &elements,
            &[json!({"text": "hi", "metadata": {"data_source": {"url": "file:///a"}, "page": null}})],
        )
        .unwrap();
        let fd = FileData::new("doc", "local")
            .unwrap()
            .with_source_identifiers(SourceIdentifiers::new("a", "/a"));

        let stager = SqliteStager::new(SqliteStagerConfig::default());
        let out = stager.run(&elements, &fd, tmp.path(), "abc").unwrap();
        let rows = read_elements(&out).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["record_id"], "doc");
        assert_eq!(rows[0]["text"], "hi");
        assert_eq!(
            rows[0]["metadata"],
            json!({"metadata-data_source-url": "file:///a"})
        );
        assert!(uuid::Uuid::parse_str(rows[0]["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn stager_keeps_existing_element_ids() {
        let fd = FileData::new("doc", "local").unwrap();
        let stager = SqliteStager::new(SqliteStagerConfig::default());

        let row = stager.conform(
            &fd,
            0,
            &json!({"element_id": "abc123", "type": "Title", "text": "hi", "metadata": {"page": 2}}),
        );
        assert_eq!(row["id"], "abc123");
        assert_eq!(row["text"], "hi");
        assert_eq!(
            row["metadata"],
            json!({"element_id": "abc123", "type": "Title", "metadata-page": 2})
        );

        let generated = stager.conform(&fd, 0, &json!({"text": "hi"}));
        let again = stager.conform(&fd, 0, &json!({"text": "hi"}));
        assert_ne!(generated["id"], "abc123");
        assert_eq!(generated["id"], again["id"]);
        assert!(uuid::Uuid::parse_str(generated["id"].as_str().unwrap()).is_ok());
        assert_eq!(generated["metadata"], json!({}));
    }

    #[tokio::test]
    async fn upload_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let uploader = SqliteUploader::new(connection(tmp.path()), SqliteUploaderConfig { batch_size: 2 }).unwrap();
        uploader.precheck().await.unwrap();

        let rows: Vec<Value> = (0..5)
            .map(|i| json!({"id": format!("row-{}", i), "record_id": "doc", "text": format!("t{}", i), "metadata": {}}))
            .collect();
        let contents = vec![staged(tmp.path(), "doc", &rows)];
        uploader.run(&contents).await.unwrap();
        assert_eq!(count(&uploader).await, 5);
        uploader.run(&contents).await.unwrap();
        assert_eq!(count(&uploader).await, 5);
    }

    #[tokio::test]
    async fn malformed_row_fails_its_batch_only() {
        let tmp = TempDir::new().unwrap();
        let uploader = SqliteUploader::new(connection(tmp.path()), SqliteUploaderConfig { batch_size: 2 }).unwrap();
        let rows = vec![
            json!({"id": "a", "record_id": "doc", "text": "a"}),
            json!({"id": "b", "record_id": "doc", "text": "b"}),
            json!({"text": "no id"}),
        ];
        let err = uploader
            .run(&[staged(tmp.path(), "doc", &rows)])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Write(_)));
        assert_eq!(count(&uploader).await, 2);
    }

    #[tokio::test]
    async fn precheck_reports_unreachable_database() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let conn = SqliteConnection {
            path: None,
            table: "elements".into(),
            access: SqliteAccess {
                url: Some(Sensitive::new(format!("sqlite:{}/nested/out.db", blocker.display()))),
            },
        };
        let uploader = SqliteUploader::new(conn, SqliteUploaderConfig::default()).unwrap();
        let err = uploader.precheck().await.unwrap_err();
        assert!(matches!(err, IngestError::DestinationConnection(_)));
        assert!(!err.to_string().contains("nested/out.db"));
    }

    #[test]
    fn invalid_table_and_missing_target_are_config_errors() {
        let tmp = TempDir::new().unwrap();
        let mut conn = connection(tmp.path());
        conn.table = "elements; DROP TABLE x".into();
        assert!(matches!(
            SqliteUploader::new(conn, SqliteUploaderConfig::default()).unwrap_err(),
            IngestError::Config(_)
        ));

        let conn = SqliteConnection {
            path: None,
            table: "elements".into(),
            access: SqliteAccess::default(),
        };
        assert!(matches!(
            SqliteUploader::new(conn, SqliteUploaderConfig::default()).unwrap_err(),
            IngestError::Config(_)
        ));
    }

    #[tokio::test]
    async fn snapshot_hides_secret_and_client() {
        let tmp = TempDir::new().unwrap();
        let secret = format!("sqlite:{}/secret-name.db", tmp.path().display());
        let conn = SqliteConnection {
            path: None,
            table: "elements".into(),
            access: SqliteAccess {
                url: Some(Sensitive::new(secret.clone())),
            },
        };
        let uploader = SqliteUploader::new(conn, SqliteUploaderConfig::default()).unwrap();
        uploader.precheck().await.unwrap();
        assert!(uploader.client.is_connected());

        let snapshot = serde_json::to_string(&uploader).unwrap();
        assert!(!snapshot.contains("secret-name"));
        assert!(!format!("{:?}", uploader).contains("secret-name"));
        let value: Value = serde_json::from_str(&snapshot).unwrap();
        assert!(value["client"].is_null());

        let mut restored: SqliteUploader = serde_json::from_str(&snapshot).unwrap();
        assert!(restored.client.is_detached());
        assert!(restored.pool().await.is_err());
        restored.reconnect();
        assert!(!restored.client.is_detached());
    }
}
