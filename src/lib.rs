//! # Ingest Harness
//!
//! A connector orchestration framework for document ingestion.
//!
//! Ingest Harness turns a source's document listing into bounded,
//! concurrent download → partition → stage → upload units, with retry for
//! transient failures and per-unit failure isolation. Connectors plug in
//! through four small contracts and a type-checked registry; the pipeline
//! never sees vendor types.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌──────────────┐
//! │   Source     │   │         Pipeline          │   │ Destination  │
//! │ Indexer      │──▶│ batch · fan-out · retry   │──▶│ UploadStager │
//! │ Downloader   │   │ partition · uncompress    │   │ Uploader     │
//! └──────────────┘   └───────────────────────────┘   └──────────────┘
//!        ▲                                                  ▲
//!        └──────────── Registries (tag → types) ────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ingest_harness::config::load_config;
//! use ingest_harness::logging::init_logging;
//! use ingest_harness::pipeline::Pipeline;
//! use ingest_harness::registry::Registries;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("ingest.toml"))?;
//! init_logging(&config.logging)?;
//! let registries = Registries::builtin()?;
//! let pipeline = Pipeline::from_config(&config, &registries)?;
//! let summary = pipeline.run().await?;
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | `FileData` and stage payloads |
//! | [`traits`] | Indexer / Downloader / UploadStager / Uploader contracts |
//! | [`registry`] | Connector-type tag → type bindings |
//! | [`pipeline`] | Batching, fan-out and run summary |
//! | [`download`] | Path conventions and downloader decorators |
//! | [`partition`] | Downloaded file → elements |
//! | [`stage`] | Upload staging step and stager helpers |
//! | [`upload`] | Batched writes for uploaders |
//! | [`uncompress`] | Archive expansion |
//! | [`retry`] | Centralized retry and timeout policy |
//! | [`client`] | Lazily created, non-serialized client handles |
//! | [`secret`] | Redacted secrets and connection configs |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`progress`] | Run progress on stderr |
//! | [`connector_local`] | Local filesystem source and destination |
//! | [`connector_ndjson`] | JSON-lines batch source |
//! | [`connector_sqlite`] | SQLite destination |

pub mod client;
pub mod config;
pub mod connector_local;
pub mod connector_ndjson;
pub mod connector_sqlite;
pub mod download;
pub mod error;
pub mod logging;
pub mod models;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod secret;
pub mod stage;
pub mod traits;
pub mod uncompress;
pub mod upload;
