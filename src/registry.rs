//! Connector registries: connector-type tag → concrete type bindings.
//!
//! A connector declares its full set of types once, by implementing
//! [`SourceConnector`] or [`DestinationConnector`] on a marker struct. The
//! compiler checks that the indexer, downloader, uploader and stager agree
//! with the connection config they are built from. The registry stores
//! only a type-erased [`SourceRegistryEntry`] / [`DestinationRegistryEntry`]
//! per tag; it never instantiates anything itself. The pipeline builder
//! looks a tag up and asks the entry to build components from options.
//!
//! ```text
//!  "local"  ──▶ SourceRegistryEntry::of::<LocalSource>()
//!  "ndjson" ──▶ SourceRegistryEntry::of::<NdjsonSource>()
//!
//!  "local"  ──▶ DestinationRegistryEntry::of::<LocalDestination>()
//!  "sqlite" ──▶ DestinationRegistryEntry::of::<SqliteDestination>()
//! ```
//!
//! Registries are built once at startup ([`Registries::builtin`]) and then
//! shared read-only for the rest of the process.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ConnectorSection;
use crate::connector_local::{LocalDestination, LocalSource};
use crate::connector_ndjson::NdjsonSource;
use crate::connector_sqlite::SqliteDestination;
use crate::error::{IngestError, Result};
use crate::secret::{ConnectionConfig, REDACTED};
use crate::traits::{Downloader, Indexer, UploadStager, Uploader};

// ═══════════════════════════════════════════════════════════════════════
// Type bindings
// ═══════════════════════════════════════════════════════════════════════

/// The complete type set of a source connector.
pub trait SourceConnector: 'static {
    const CONNECTOR_TYPE: &'static str;

    type Connection: ConnectionConfig;
    type IndexerConfig: DeserializeOwned;
    type DownloaderConfig: DeserializeOwned;
    type Indexer: Indexer + 'static;
    type Downloader: Downloader + 'static;

    fn indexer(connection: Self::Connection, config: Self::IndexerConfig) -> Result<Self::Indexer>;

    fn downloader(
        connection: Self::Connection,
        config: Self::DownloaderConfig,
        download_dir: PathBuf,
    ) -> Result<Self::Downloader>;
}

/// The complete type set of a destination connector.
pub trait DestinationConnector: 'static {
    const CONNECTOR_TYPE: &'static str;

    type Connection: ConnectionConfig;
    type UploaderConfig: DeserializeOwned;
    type StagerConfig: DeserializeOwned;
    type Uploader: Uploader + 'static;
    /// Use [`NoStager`](crate::traits::NoStager) when output is uploaded as-is.
    type Stager: UploadStager + 'static;

    fn uploader(connection: Self::Connection, config: Self::UploaderConfig) -> Result<Self::Uploader>;

    fn stager(config: Self::StagerConfig) -> Result<Option<Self::Stager>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Entries
// ═══════════════════════════════════════════════════════════════════════

/// Built source components, ready for the pipeline.
pub struct SourceComponents {
    pub indexer: Box<dyn Indexer>,
    pub downloader: Box<dyn Downloader>,
    /// Redacted connection snapshot, safe to log.
    pub connection: Value,
}

/// Built destination components, ready for the pipeline.
pub struct DestinationComponents {
    pub uploader: Box<dyn Uploader>,
    pub stager: Option<Box<dyn UploadStager>>,
    /// Redacted connection snapshot, safe to log.
    pub connection: Value,
}

type SourceBuildFn = fn(&ConnectorSection, &Path) -> Result<SourceComponents>;
type DestinationBuildFn = fn(&ConnectorSection) -> Result<DestinationComponents>;

pub struct SourceRegistryEntry {
    connector_type: &'static str,
    build: SourceBuildFn,
}

impl SourceRegistryEntry {
    pub fn of<C: SourceConnector>() -> Self {
        Self {
            connector_type: C::CONNECTOR_TYPE,
            build: build_source::<C>,
        }
    }

    pub fn connector_type(&self) -> &'static str {
        self.connector_type
    }

    /// Deserialize the section's option tables and construct the indexer
    /// and downloader. Invalid options fail with [`IngestError::Config`].
    pub fn build(&self, section: &ConnectorSection, download_dir: &Path) -> Result<SourceComponents> {
        (self.build)(section, download_dir)
    }
}

pub struct DestinationRegistryEntry {
    connector_type: &'static str,
    build: DestinationBuildFn,
}

impl DestinationRegistryEntry {
    pub fn of<C: DestinationConnector>() -> Self {
        Self {
            connector_type: C::CONNECTOR_TYPE,
            build: build_destination::<C>,
        }
    }

    pub fn connector_type(&self) -> &'static str {
        self.connector_type
    }

    pub fn build(&self, section: &ConnectorSection) -> Result<DestinationComponents> {
        (self.build)(section)
    }
}

fn build_source<C: SourceConnector>(
    section: &ConnectorSection,
    download_dir: &Path,
) -> Result<SourceComponents> {
    let connection: C::Connection =
        parse_options(C::CONNECTOR_TYPE, "connection", section.connection_with_access(), section)?;
    let indexer_config: C::IndexerConfig =
        parse_options(C::CONNECTOR_TYPE, "indexer", section.indexer.clone(), section)?;
    let downloader_config: C::DownloaderConfig =
        parse_options(C::CONNECTOR_TYPE, "downloader", section.downloader.clone(), section)?;

    let redacted = connection.redacted();
    tracing::info!(
        connector_type = C::CONNECTOR_TYPE,
        connection = %redacted,
        "building source connector"
    );

    let indexer = C::indexer(connection.clone(), indexer_config)?;
    let downloader = C::downloader(connection, downloader_config, download_dir.to_path_buf())?;
    Ok(SourceComponents {
        indexer: Box::new(indexer),
        downloader: Box::new(downloader),
        connection: redacted,
    })
}

fn build_destination<C: DestinationConnector>(
    section: &ConnectorSection,
) -> Result<DestinationComponents> {
    let connection: C::Connection =
        parse_options(C::CONNECTOR_TYPE, "connection", section.connection_with_access(), section)?;
    let uploader_config: C::UploaderConfig =
        parse_options(C::CONNECTOR_TYPE, "uploader", section.uploader.clone(), section)?;
    let stager_config: C::StagerConfig =
        parse_options(C::CONNECTOR_TYPE, "stager", section.stager.clone(), section)?;

    let redacted = connection.redacted();
    tracing::info!(
        connector_type = C::CONNECTOR_TYPE,
        connection = %redacted,
        "building destination connector"
    );

    let uploader = C::uploader(connection, uploader_config)?;
    let stager = C::stager(stager_config)?;
    Ok(DestinationComponents {
        uploader: Box::new(uploader),
        stager: stager.map(|s| Box::new(s) as Box<dyn UploadStager>),
        connection: redacted,
    })
}

fn parse_options<T: DeserializeOwned>(
    connector_type: &str,
    table: &str,
    value: Value,
    section: &ConnectorSection,
) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        IngestError::Config(format!(
            "invalid {} options for connector '{}': {}",
            table,
            connector_type,
            scrub_secrets(&e.to_string(), &section.access)
        ))
    })
}

/// Mask every string found in the access table. Deserialization errors
/// quote offending values verbatim.
fn scrub_secrets(message: &str, access: &Value) -> String {
    let mut secrets = Vec::new();
    collect_strings(access, &mut secrets);
    secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    secrets
        .into_iter()
        .filter(|s| !s.is_empty())
        .fold(message.to_string(), |msg, secret| msg.replace(&secret, REDACTED))
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        Value::Number(n) => out.push(n.to_string()),
        Value::Null | Value::Bool(_) => {}
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registries
// ═══════════════════════════════════════════════════════════════════════

/// Tag → entry map. Registering a tag twice is a configuration error.
pub struct Registry<E> {
    kind: &'static str,
    entries: HashMap<String, E>,
}

impl<E> Registry<E> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, tag: impl Into<String>, entry: E) -> Result<()> {
        let tag = tag.into();
        if self.entries.contains_key(&tag) {
            return Err(IngestError::Config(format!(
                "{} connector '{}' is already registered",
                self.kind, tag
            )));
        }
        self.entries.insert(tag, entry);
        Ok(())
    }

    /// The entry for `tag`. Returns the same entry on every call.
    pub fn lookup(&self, tag: &str) -> Result<&E> {
        self.entries.get(tag).ok_or_else(|| {
            IngestError::Config(format!(
                "unknown {} connector '{}'. Available: {}",
                self.kind,
                tag,
                self.tags().join(", ")
            ))
        })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SourceRegistry = Registry<SourceRegistryEntry>;
pub type DestinationRegistry = Registry<DestinationRegistryEntry>;

/// The source-side and destination-side registries of one process.
pub struct Registries {
    pub sources: SourceRegistry,
    pub destinations: DestinationRegistry,
}

impl Registries {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            sources: Registry::new("source"),
            destinations: Registry::new("destination"),
        }
    }

    /// Registries holding every built-in connector.
    pub fn builtin() -> Result<Self> {
        let mut registries = Self::new();
        registries.register_source::<LocalSource>()?;
        registries.register_source::<NdjsonSource>()?;
        registries.register_destination::<LocalDestination>()?;
        registries.register_destination::<SqliteDestination>()?;
        Ok(registries)
    }

    pub fn register_source<C: SourceConnector>(&mut self) -> Result<()> {
        self.sources
            .register(C::CONNECTOR_TYPE, SourceRegistryEntry::of::<C>())
    }

    pub fn register_destination<C: DestinationConnector>(&mut self) -> Result<()> {
        self.destinations
            .register(C::CONNECTOR_TYPE, DestinationRegistryEntry::of::<C>())
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_returns_the_same_entry() {
        let registries = Registries::builtin().unwrap();
        let a = registries.sources.lookup("local").unwrap();
        let b = registries.sources.lookup("local").unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.connector_type(), "local");
        assert_eq!(registries.sources.tags(), vec!["local", "ndjson"]);
        assert_eq!(registries.destinations.tags(), vec!["local", "sqlite"]);
    }

    #[test]
    fn duplicate_and_unknown_tags_are_config_errors() {
        let mut registries = Registries::builtin().unwrap();
        let err = registries.register_source::<LocalSource>().unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
        let err = registries
            .destinations
            .register("sqlite", DestinationRegistryEntry::of::<SqliteDestination>())
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));

        let err = registries.sources.lookup("mongodb").err().unwrap();
        assert!(matches!(err, IngestError::Config(_)));
        assert!(err.to_string().contains("local, ndjson"));
    }

    #[test]
    fn option_errors_do_not_echo_secrets() {
        let registries = Registries::builtin().unwrap();
        let mut section = ConnectorSection::new("sqlite");
        section.connection = json!({"table": "elements"});
        section.access = json!({"url": 12345678});
        let err = registries
            .destinations
            .lookup("sqlite")
            .unwrap()
            .build(&section)
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Config(_)));
        assert!(!err.to_string().contains("12345678"), "{}", err);
    }

    #[test]
    fn scrub_masks_longest_secrets_first() {
        let msg = scrub_secrets(
            "bad value `abc-token-xyz`",
            &json!({"token": "abc-token-xyz", "short": "abc"}),
        );
        assert_eq!(msg, format!("bad value `{}`", REDACTED));
    }
}
