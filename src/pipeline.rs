//! Batching / fan-out pipeline.
//!
//! Coordinates one run: precheck → index → (per unit) download →
//! uncompress → partition → stage → upload. The indexer stream is consumed
//! in groups of `batch_size`; units of a group run concurrently under a
//! bound of `concurrency`. A failing unit is logged and recorded in the
//! [`RunSummary`], never propagated to its siblings.
//!
//! ```text
//! indexer.run() ──chunks(batch_size)──▶ group ──buffer_unordered(concurrency)──▶ units
//!                                                                                 │
//!                      batch uploader: one call per group ◀── staged contents ◀──┘
//!                      other uploaders: one call per unit
//! ```
//!
//! Precheck failures abort before any unit is dispatched. Blocking
//! connector and file work runs on tokio's blocking pool so it neither
//! stalls sibling units nor escapes the retry timeout.

use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, ProcessorConfig};
use crate::download::{decorate, output_path, unit_stem, KeyedLocks};
use crate::error::{IngestError, Result};
use crate::models::{DownloadResponse, FileData, UploadContent};
use crate::partition::{BasicPartitioner, Partitioner};
use crate::progress::{NoProgress, ProgressEvent, ProgressMode, ProgressReporter};
use crate::registry::{DestinationComponents, Registries, SourceComponents};
use crate::retry::RetryPolicy;
use crate::stage::stage_unit;
use crate::traits::{Downloader, Indexer, UploadStager, Uploader};
use crate::uncompress::uncompress;

// ═══════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════

/// Pipeline step a unit failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Index,
    Download,
    Uncompress,
    Partition,
    Stage,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Index => "index",
            Stage::Download => "download",
            Stage::Uncompress => "uncompress",
            Stage::Partition => "partition",
            Stage::Stage => "stage",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct UnitFailure {
    /// `None` when the indexer failed before producing a record.
    pub identifier: Option<String>,
    pub stage: Stage,
    pub error: IngestError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure,
    TotalFailure,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub succeeded: Vec<String>,
    /// Units that needed no work: absent at the source or already processed.
    pub skipped: Vec<String>,
    pub failed: Vec<UnitFailure>,
    /// The run was cancelled before the indexer stream was exhausted.
    pub cancelled: bool,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        match (self.succeeded.len(), self.failed.len()) {
            (_, 0) => RunStatus::Success,
            (0, _) => RunStatus::TotalFailure,
            _ => RunStatus::PartialFailure,
        }
    }

    /// 0 when nothing failed, 1 on partial failure, 2 when no unit succeeded.
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 1,
            RunStatus::TotalFailure => 2,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }
}

enum UnitReport {
    /// Staged and waiting for the group's batch upload.
    Ready {
        identifier: String,
        contents: Vec<UploadContent>,
    },
    Succeeded(String),
    Skipped(String),
    Failed(UnitFailure),
    NotDispatched,
}

// ═══════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════

pub struct PipelineBuilder {
    processor: ProcessorConfig,
    retry: RetryPolicy,
    indexer: Option<Box<dyn Indexer>>,
    downloader: Option<Box<dyn Downloader>>,
    partitioner: Box<dyn Partitioner>,
    stager: Option<Arc<dyn UploadStager>>,
    uploader: Option<Box<dyn Uploader>>,
    progress: Box<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    fn new() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            retry: RetryPolicy::default(),
            indexer: None,
            downloader: None,
            partitioner: Box::new(BasicPartitioner::default()),
            stager: None,
            uploader: None,
            progress: Box::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn indexer(mut self, indexer: impl Indexer + 'static) -> Self {
        self.indexer = Some(Box::new(indexer));
        self
    }

    /// Undecorated connector downloader; the builder adds the standard
    /// skip and retry layers.
    pub fn downloader(mut self, downloader: impl Downloader + 'static) -> Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    pub fn partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Box::new(partitioner);
        self
    }

    pub fn stager(mut self, stager: impl UploadStager + 'static) -> Self {
        self.stager = Some(Arc::new(stager));
        self
    }

    pub fn uploader(mut self, uploader: impl Uploader + 'static) -> Self {
        self.uploader = Some(Box::new(uploader));
        self
    }

    pub fn source(mut self, source: SourceComponents) -> Self {
        self.indexer = Some(source.indexer);
        self.downloader = Some(source.downloader);
        self
    }

    pub fn destination(mut self, destination: DestinationComponents) -> Self {
        self.uploader = Some(destination.uploader);
        self.stager = destination.stager.map(Arc::from);
        self
    }

    pub fn progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let indexer = self
            .indexer
            .ok_or_else(|| IngestError::Config("pipeline has no indexer".into()))?;
        let downloader = self
            .downloader
            .ok_or_else(|| IngestError::Config("pipeline has no downloader".into()))?;
        let uploader = self
            .uploader
            .ok_or_else(|| IngestError::Config("pipeline has no uploader".into()))?;
        if self.processor.concurrency == 0 || self.processor.batch_size == 0 {
            return Err(IngestError::Config(
                "concurrency and batch_size must be > 0".into(),
            ));
        }
        let downloader = decorate(downloader, &self.processor, self.retry);
        Ok(Pipeline {
            processor: self.processor,
            indexer,
            downloader,
            partitioner: self.partitioner,
            stager: self.stager,
            uploader,
            progress: self.progress,
            cancel: self.cancel,
            locks: KeyedLocks::new(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════

pub struct Pipeline {
    processor: ProcessorConfig,
    indexer: Box<dyn Indexer>,
    downloader: Box<dyn Downloader>,
    partitioner: Box<dyn Partitioner>,
    stager: Option<Arc<dyn UploadStager>>,
    uploader: Box<dyn Uploader>,
    progress: Box<dyn ProgressReporter>,
    cancel: CancellationToken,
    locks: KeyedLocks,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Resolve `[source]` and `[destination]` through the registries and
    /// build a pipeline from the resulting components.
    pub fn from_config(config: &Config, registries: &Registries) -> Result<Pipeline> {
        Self::builder_from_config(config, registries)?.build()
    }

    /// Like [`from_config`](Self::from_config), leaving the builder open
    /// for a custom partitioner, progress reporter or cancellation token.
    pub fn builder_from_config(config: &Config, registries: &Registries) -> Result<PipelineBuilder> {
        let source = registries
            .sources
            .lookup(&config.source.connector_type)?
            .build(&config.source, &config.processor.download_dir())?;
        let destination = registries
            .destinations
            .lookup(&config.destination.connector_type)?
            .build(&config.destination)?;
        Ok(Pipeline::builder()
            .processor(config.processor.clone())
            .retry(RetryPolicy::from(&config.retry))
            .progress(ProgressMode::default_for_tty().reporter())
            .source(source)
            .destination(destination))
    }

    /// Token that stops the run from dispatching further units.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validate every component's connectivity. Any failure aborts the run.
    pub async fn precheck(&self) -> Result<()> {
        self.indexer.precheck().await?;
        self.downloader.precheck().await?;
        self.uploader.precheck().await?;
        Ok(())
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "ingest_run",
            %run_id,
            source = self.indexer.connector_type(),
            destination = self.uploader.connector_type()
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let connector = self.indexer.connector_type().to_string();
        tracing::info!(
            concurrency = self.processor.concurrency,
            batch_size = self.processor.batch_size,
            "starting run"
        );
        self.precheck().await?;

        let mut summary = RunSummary {
            run_id,
            ..RunSummary::default()
        };
        let mut indexed = 0u64;
        let mut groups = self.indexer.run().chunks(self.processor.batch_size);

        loop {
            let group = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                group = groups.next() => group,
            };
            let Some(group) = group else { break };

            indexed += group.len() as u64;
            self.progress.report(ProgressEvent::Indexed {
                connector: connector.clone(),
                total: indexed,
            });

            let reports: Vec<UnitReport> = stream::iter(group)
                .map(|item| self.dispatch(item))
                .buffer_unordered(self.processor.concurrency)
                .collect()
                .await;
            self.collect_group(reports, &mut summary).await;

            self.progress.report(ProgressEvent::Processed {
                connector: connector.clone(),
                n: summary.processed() as u64,
                failed: summary.failed.len() as u64,
            });

            if self.processor.raise_on_error && !summary.failed.is_empty() {
                let failure = summary.failed.swap_remove(0);
                return Err(failure.error);
            }
        }
        summary.cancelled = self.cancel.is_cancelled();

        self.progress.report(ProgressEvent::Finished {
            connector,
            succeeded: summary.succeeded.len() as u64,
            failed: summary.failed.len() as u64,
            skipped: summary.skipped.len() as u64,
        });
        tracing::info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            cancelled = summary.cancelled,
            status = ?summary.status(),
            "run complete"
        );
        Ok(summary)
    }

    /// Upload a group's staged contents (batch uploaders) and fold every
    /// report into the summary.
    async fn collect_group(&self, reports: Vec<UnitReport>, summary: &mut RunSummary) {
        let mut ready = Vec::new();
        let mut contents = Vec::new();
        for report in reports {
            match report {
                UnitReport::Ready {
                    identifier,
                    contents: unit_contents,
                } => {
                    ready.push(identifier);
                    contents.extend(unit_contents);
                }
                UnitReport::Succeeded(id) => summary.succeeded.push(id),
                UnitReport::Skipped(id) => summary.skipped.push(id),
                UnitReport::Failed(failure) => summary.failed.push(failure),
                UnitReport::NotDispatched => {}
            }
        }
        if ready.is_empty() {
            return;
        }

        match self.uploader.run(&contents).await {
            Ok(()) => summary.succeeded.extend(ready),
            Err(error) => {
                tracing::error!(
                    connector_type = self.uploader.connector_type(),
                    units = ready.len(),
                    error = %error,
                    "batch upload failed"
                );
                self.forget_outputs(&contents);
                summary.failed.extend(ready.into_iter().map(|identifier| UnitFailure {
                    identifier: Some(identifier),
                    stage: Stage::Upload,
                    error: upload_error(&error),
                }));
            }
        }
    }

    /// Remove partitioned output of units whose upload failed so the next
    /// run redoes them instead of skipping them.
    fn forget_outputs(&self, contents: &[UploadContent]) {
        for content in contents {
            let path = output_path(&self.processor.output_dir(), &content.file_data);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove output");
            }
        }
    }

    async fn dispatch(&self, item: Result<FileData>) -> UnitReport {
        if self.cancel.is_cancelled() {
            return UnitReport::NotDispatched;
        }
        let file_data = match item {
            Ok(file_data) => file_data,
            Err(error) => {
                tracing::error!(
                    connector_type = self.indexer.connector_type(),
                    stage = %Stage::Index,
                    kind = error.kind(),
                    error = %error,
                    "unit failed"
                );
                return UnitReport::Failed(UnitFailure {
                    identifier: None,
                    stage: Stage::Index,
                    error,
                });
            }
        };

        let identifier = file_data.identifier.clone();
        let connector_type = file_data.connector_type.clone();
        match self.process(file_data).await {
            Ok(report) => report,
            Err((stage, error)) => {
                tracing::error!(
                    connector_type = %connector_type,
                    identifier = %identifier,
                    stage = %stage,
                    kind = error.kind(),
                    error = %error,
                    "unit failed"
                );
                UnitReport::Failed(UnitFailure {
                    identifier: Some(identifier),
                    stage,
                    error,
                })
            }
        }
    }

    async fn process(&self, file_data: FileData) -> std::result::Result<UnitReport, (Stage, IngestError)> {
        let identifier = file_data.identifier.clone();
        let at = |stage: Stage| move |error: IngestError| (stage, error);

        if self.processor.persist_file_data {
            file_data
                .to_file(&self.index_path(&file_data))
                .map_err(at(Stage::Index))?;
        }
        if self.already_processed(&file_data) {
            tracing::debug!(identifier = %identifier, "output exists, skipping");
            return Ok(UnitReport::Skipped(identifier));
        }

        let download = {
            let _guard = self.locks.lock(&identifier).await;
            self.downloader
                .run_async(&file_data)
                .await
                .map_err(at(Stage::Download))?
        };
        if download.is_absent() {
            return Ok(UnitReport::Skipped(identifier));
        }

        let units = if self.processor.uncompress {
            blocking(move || uncompress(&download))
                .await
                .map_err(at(Stage::Uncompress))?
        } else {
            vec![download]
        };

        let mut contents = Vec::new();
        let mut skipped_children = 0;
        for unit in units {
            if unit.file_data.identifier != identifier {
                if self.processor.persist_file_data {
                    unit.file_data
                        .to_file(&self.index_path(&unit.file_data))
                        .map_err(at(Stage::Uncompress))?;
                }
                if self.already_processed(&unit.file_data) {
                    skipped_children += 1;
                    continue;
                }
            }
            contents.push(self.partition_and_stage(unit).await?);
        }

        if contents.is_empty() {
            return Ok(if skipped_children > 0 {
                UnitReport::Skipped(identifier)
            } else {
                UnitReport::Succeeded(identifier)
            });
        }
        if self.uploader.is_batch() {
            return Ok(UnitReport::Ready {
                identifier,
                contents,
            });
        }
        if let Err(error) = self.uploader.run(&contents).await {
            self.forget_outputs(&contents);
            return Err((Stage::Upload, error));
        }
        Ok(UnitReport::Succeeded(identifier))
    }

    async fn partition_and_stage(
        &self,
        download: DownloadResponse,
    ) -> std::result::Result<UploadContent, (Stage, IngestError)> {
        let elements_path = output_path(&self.processor.output_dir(), &download.file_data);
        self.partitioner
            .partition(&download, &elements_path)
            .await
            .map_err(|e| (Stage::Partition, e))?;

        let path = match &self.stager {
            Some(stager) => {
                let stager = Arc::clone(stager);
                let file_data = download.file_data.clone();
                let staging_dir = self.staging_dir(&file_data);
                blocking(move || {
                    stage_unit(stager.as_ref(), &elements_path, &file_data, &staging_dir)
                })
                .await
                .map_err(|e| (Stage::Stage, e))?
            }
            None => elements_path,
        };
        Ok(UploadContent {
            path,
            file_data: download.file_data,
        })
    }

    fn already_processed(&self, file_data: &FileData) -> bool {
        !(self.processor.reprocess || file_data.reprocess)
            && output_path(&self.processor.output_dir(), file_data).exists()
    }

    fn index_path(&self, file_data: &FileData) -> PathBuf {
        self.processor
            .index_dir()
            .join(unit_stem(&file_data.connector_type))
            .join(format!("{}.json", unit_stem(&file_data.identifier)))
    }

    fn staging_dir(&self, file_data: &FileData) -> PathBuf {
        self.processor
            .staging_dir()
            .join(unit_stem(&file_data.connector_type))
            .join(unit_stem(&file_data.identifier))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.processor.output_dir()
    }

    pub fn work_dir(&self) -> &Path {
        &self.processor.work_dir
    }
}

/// Run synchronous file work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// One batch error, recorded against every unit of the batch.
fn upload_error(error: &IngestError) -> IngestError {
    match error {
        IngestError::DestinationConnection(msg) => IngestError::DestinationConnection(msg.clone()),
        other => IngestError::Write(other.to_string()),
    }
}
