//! Stage contracts every connector implements.
//!
//! ```text
//!  Indexer ──FileData──▶ Downloader ──file──▶ Partitioner ──elements──▶ UploadStager ──staged──▶ Uploader
//!  (source)              (source)             (processing)             (destination)            (destination)
//! ```
//!
//! The pipeline only ever sees these traits; vendor clients stay behind
//! them. Each connector owns its configuration and, where it talks to a
//! remote system, one lazily created [`ClientHandle`](crate::client::ClientHandle).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use futures::stream::{self, StreamExt};
//! use ingest_harness::error::Result;
//! use ingest_harness::models::FileData;
//! use ingest_harness::traits::{FileDataStream, Indexer};
//!
//! struct FixedIndexer {
//!     ids: Vec<String>,
//! }
//!
//! #[async_trait]
//! impl Indexer for FixedIndexer {
//!     fn connector_type(&self) -> &str { "fixed" }
//!
//!     fn run(&self) -> FileDataStream<'_> {
//!         stream::iter(self.ids.clone())
//!             .map(|id| FileData::new(id, "fixed"))
//!             .boxed()
//!     }
//! }
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::download::default_download_path;
use crate::error::{IngestError, Result};
use crate::models::{DownloadResponse, FileData, UploadContent};

/// Lazy stream of indexed units. An `Err` item is a failure attributable
/// to one unit; it does not end the stream.
pub type FileDataStream<'a> = BoxStream<'a, Result<FileData>>;

const BLOCKING_STREAM_BUFFER: usize = 64;

/// Run a synchronous producer on the blocking pool and expose what it emits
/// as a [`FileDataStream`]. The producer starts on first poll. Its sink
/// returns `false` once the stream has been dropped; the producer should
/// stop there.
pub fn blocking_stream<F>(produce: F) -> FileDataStream<'static>
where
    F: FnOnce(&mut dyn FnMut(Result<FileData>) -> bool) + Send + 'static,
{
    stream::once(async move {
        let (tx, rx) = tokio::sync::mpsc::channel(BLOCKING_STREAM_BUFFER);
        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = |item: Result<FileData>| tx.blocking_send(item).is_ok();
            produce(&mut sink);
        });
        (rx, Some(handle))
    })
    .flat_map(|state| {
        stream::unfold(state, |(mut rx, handle)| async move {
            if let Some(item) = rx.recv().await {
                return Some((item, (rx, handle)));
            }
            // A panicking producer surfaces as one final error.
            match handle?.await {
                Ok(()) => None,
                Err(e) => Some((Err(IngestError::from(e)), (rx, None))),
            }
        })
    })
    .boxed()
}

// ═══════════════════════════════════════════════════════════════════════
// Source side
// ═══════════════════════════════════════════════════════════════════════

/// Lists the units available at a source.
#[async_trait]
pub trait Indexer: Send + Sync {
    fn connector_type(&self) -> &str;

    /// Validate connectivity before any indexing starts.
    ///
    /// Fails with [`SourceConnection`](crate::error::IngestError::SourceConnection).
    async fn precheck(&self) -> Result<()> {
        Ok(())
    }

    /// Produce a fresh, independent stream of units.
    ///
    /// Paginated sources page inside the stream; callers never see page
    /// boundaries. Calling `run` again restarts the listing.
    fn run(&self) -> FileDataStream<'_>;
}

/// Fetches one unit's content into the local staging area.
#[async_trait]
pub trait Downloader: Send + Sync {
    fn connector_type(&self) -> &str;

    fn download_dir(&self) -> &Path;

    /// Deterministic staging path for a unit, so repeated runs land on
    /// the same file.
    fn download_path(&self, file_data: &FileData) -> PathBuf {
        default_download_path(self.download_dir(), file_data)
    }

    async fn precheck(&self) -> Result<()> {
        Ok(())
    }

    /// Blocking download.
    fn run(&self, file_data: &FileData) -> Result<DownloadResponse>;

    /// Suspend-capable download. Must produce the same response and the
    /// same error classification as [`run`](Downloader::run).
    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        self.run(file_data)
    }

    /// Whether [`run_async`](Downloader::run_async) yields instead of
    /// blocking. The pipeline moves downloaders that answer `false` onto
    /// the blocking thread pool.
    fn is_async(&self) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Destination side
// ═══════════════════════════════════════════════════════════════════════

/// Reshapes a partitioned elements file into the destination's format.
///
/// Pure and deterministic: identical input yields identical output, and
/// the elements file is never modified.
pub trait UploadStager: Send + Sync {
    /// Stager settings, hashed into the staged file name.
    fn config(&self) -> Value {
        Value::Null
    }

    /// Write the conformed records to `output_dir/output_filename.json`
    /// and return that path.
    fn run(
        &self,
        elements_path: &Path,
        file_data: &FileData,
        output_dir: &Path,
        output_filename: &str,
    ) -> Result<PathBuf>;
}

/// Writes staged content to a destination.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn connector_type(&self) -> &str;

    /// Batch uploaders receive many units per call; others one at a time.
    fn is_batch(&self) -> bool {
        true
    }

    /// Validate destination connectivity.
    ///
    /// Fails with [`DestinationConnection`](crate::error::IngestError::DestinationConnection);
    /// the run aborts before any upload.
    async fn precheck(&self) -> Result<()>;

    /// Upload every staged file. A failing write batch returns
    /// [`Write`](crate::error::IngestError::Write); batches written
    /// before it stay written. No internal retries.
    async fn run(&self, contents: &[UploadContent]) -> Result<()>;
}

/// Stager type for destinations that upload partitioned output as-is.
///
/// Uninhabited: a destination declaring `type Stager = NoStager` never
/// builds one.
pub enum NoStager {}

impl UploadStager for NoStager {
    fn run(&self, _: &Path, _: &FileData, _: &Path, _: &str) -> Result<PathBuf> {
        match *self {}
    }
}
