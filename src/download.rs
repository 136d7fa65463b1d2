//! Staging paths and composable downloader decorators.
//!
//! Shared download behavior is layered around any [`Downloader`] at
//! construction time instead of being re-implemented per connector:
//!
//! ```text
//! SkipMissing ─▶ SkipExisting ─▶ Retrying ─▶ Offload ─▶ connector downloader
//! (exists=false)  (path on disk)   (retry, timeout) (blocking pool)
//! ```
//!
//! [`decorate`] applies the stack the pipeline uses.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::models::{DownloadResponse, FileData};
use crate::retry::RetryPolicy;
use crate::traits::Downloader;

const MAX_STEM_LEN: usize = 128;

/// File-system-safe stem for an identifier.
///
/// Identifiers made of `[A-Za-z0-9._-]` are used verbatim; anything else
/// is replaced by the first 32 hex chars of its SHA-256.
pub fn unit_stem(identifier: &str) -> String {
    let safe = !identifier.is_empty()
        && identifier.len() <= MAX_STEM_LEN
        && !identifier.starts_with('.')
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe {
        identifier.to_string()
    } else {
        let digest = hex::encode(Sha256::digest(identifier.as_bytes()));
        digest[..32].to_string()
    }
}

/// `<download_dir>/<connector_type>/<stem>.<ext>`, extension taken from
/// the source file name when there is one.
pub fn default_download_path(download_dir: &Path, file_data: &FileData) -> PathBuf {
    let mut name = unit_stem(&file_data.identifier);
    let ext = file_data
        .source_identifiers
        .as_ref()
        .and_then(|ids| Path::new(&ids.filename).extension())
        .map(|e| e.to_string_lossy().to_string());
    if let Some(ext) = ext {
        if !name.ends_with(&format!(".{}", ext)) {
            name.push('.');
            name.push_str(&ext);
        }
    }
    download_dir
        .join(unit_stem(&file_data.connector_type))
        .join(name)
}

/// `<output_dir>/<connector_type>/<stem>.json`
pub fn output_path(output_dir: &Path, file_data: &FileData) -> PathBuf {
    output_dir
        .join(unit_stem(&file_data.connector_type))
        .join(format!("{}.json", unit_stem(&file_data.identifier)))
}

/// Wrap a connector downloader with the standard decorator stack.
pub fn decorate(
    inner: Box<dyn Downloader>,
    processor: &ProcessorConfig,
    retry: RetryPolicy,
) -> Box<dyn Downloader> {
    let offloaded: Box<dyn Downloader> = Box::new(Offload::new(inner));
    let retrying: Box<dyn Downloader> = Box::new(Retrying::new(offloaded, retry));
    let cached: Box<dyn Downloader> = if processor.re_download {
        retrying
    } else {
        Box::new(SkipExisting::new(retrying))
    };
    Box::new(SkipMissing::new(cached))
}

// ═══════════════════════════════════════════════════════════════════════
// Decorators
// ═══════════════════════════════════════════════════════════════════════

/// Short-circuits units whose source object no longer exists.
pub struct SkipMissing {
    inner: Box<dyn Downloader>,
}

impl SkipMissing {
    pub fn new(inner: Box<dyn Downloader>) -> Self {
        Self { inner }
    }

    fn absent(&self, file_data: &FileData) -> Option<DownloadResponse> {
        if file_data.metadata.exists {
            return None;
        }
        tracing::debug!(
            connector_type = %file_data.connector_type,
            identifier = %file_data.identifier,
            "source object no longer exists, skipping download"
        );
        Some(DownloadResponse::absent(
            file_data.clone(),
            self.inner.download_path(file_data),
        ))
    }
}

#[async_trait]
impl Downloader for SkipMissing {
    fn connector_type(&self) -> &str {
        self.inner.connector_type()
    }

    fn download_dir(&self) -> &Path {
        self.inner.download_dir()
    }

    fn download_path(&self, file_data: &FileData) -> PathBuf {
        self.inner.download_path(file_data)
    }

    async fn precheck(&self) -> Result<()> {
        self.inner.precheck().await
    }

    fn is_async(&self) -> bool {
        self.inner.is_async()
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        match self.absent(file_data) {
            Some(response) => Ok(response),
            None => self.inner.run(file_data),
        }
    }

    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        match self.absent(file_data) {
            Some(response) => Ok(response),
            None => self.inner.run_async(file_data).await,
        }
    }
}

/// Returns the staged file without fetching when it is already on disk.
/// Existence is enough; content is not re-verified.
pub struct SkipExisting {
    inner: Box<dyn Downloader>,
}

impl SkipExisting {
    pub fn new(inner: Box<dyn Downloader>) -> Self {
        Self { inner }
    }

    fn cached(&self, file_data: &FileData) -> Option<DownloadResponse> {
        let path = self.inner.download_path(file_data);
        if !path.exists() {
            return None;
        }
        tracing::debug!(
            connector_type = %file_data.connector_type,
            identifier = %file_data.identifier,
            path = %path.display(),
            "already downloaded"
        );
        Some(DownloadResponse::cached(file_data.clone(), path))
    }
}

#[async_trait]
impl Downloader for SkipExisting {
    fn connector_type(&self) -> &str {
        self.inner.connector_type()
    }

    fn download_dir(&self) -> &Path {
        self.inner.download_dir()
    }

    fn download_path(&self, file_data: &FileData) -> PathBuf {
        self.inner.download_path(file_data)
    }

    async fn precheck(&self) -> Result<()> {
        self.inner.precheck().await
    }

    fn is_async(&self) -> bool {
        self.inner.is_async()
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        match self.cached(file_data) {
            Some(response) => Ok(response),
            None => self.inner.run(file_data),
        }
    }

    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        match self.cached(file_data) {
            Some(response) => Ok(response),
            None => self.inner.run_async(file_data).await,
        }
    }
}

/// Applies a [`RetryPolicy`] to both download modes.
pub struct Retrying {
    inner: Box<dyn Downloader>,
    policy: RetryPolicy,
}

impl Retrying {
    pub fn new(inner: Box<dyn Downloader>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Downloader for Retrying {
    fn connector_type(&self) -> &str {
        self.inner.connector_type()
    }

    fn download_dir(&self) -> &Path {
        self.inner.download_dir()
    }

    fn download_path(&self, file_data: &FileData) -> PathBuf {
        self.inner.download_path(file_data)
    }

    async fn precheck(&self) -> Result<()> {
        self.inner.precheck().await
    }

    fn is_async(&self) -> bool {
        self.inner.is_async()
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        self.policy
            .run_blocking("download", || self.inner.run(file_data))
    }

    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        self.policy
            .run_async("download", || self.inner.run_async(file_data))
            .await
    }
}

/// Moves blocking downloaders onto tokio's blocking thread pool.
///
/// Connectors whose [`is_async`](Downloader::is_async) is `false` only
/// implement a blocking `run`; awaiting it inline would stall the runtime
/// worker and defeat both fan-out and the retry timeout. A timed-out
/// blocking call is abandoned, not interrupted.
pub struct Offload {
    inner: Arc<dyn Downloader>,
}

impl Offload {
    pub fn new(inner: Box<dyn Downloader>) -> Self {
        Self {
            inner: Arc::from(inner),
        }
    }
}

#[async_trait]
impl Downloader for Offload {
    fn connector_type(&self) -> &str {
        self.inner.connector_type()
    }

    fn download_dir(&self) -> &Path {
        self.inner.download_dir()
    }

    fn download_path(&self, file_data: &FileData) -> PathBuf {
        self.inner.download_path(file_data)
    }

    async fn precheck(&self) -> Result<()> {
        self.inner.precheck().await
    }

    fn is_async(&self) -> bool {
        true
    }

    fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
        self.inner.run(file_data)
    }

    async fn run_async(&self, file_data: &FileData) -> Result<DownloadResponse> {
        if self.inner.is_async() {
            return self.inner.run_async(file_data).await;
        }
        let inner = Arc::clone(&self.inner);
        let file_data = file_data.clone();
        tokio::task::spawn_blocking(move || inner.run(&file_data)).await?
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-unit exclusion
// ═══════════════════════════════════════════════════════════════════════

/// Async locks keyed by unit identifier.
///
/// The pipeline holds a unit's lock for the whole download so that at
/// most one download per unit is in flight. Entries are removed when the
/// last holder releases them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        KeyGuard {
            owner: self,
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of identifiers currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut map = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by this guard.
        if map
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2)
        {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::models::SourceIdentifiers;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingDownloader {
        dir: PathBuf,
        calls: Arc<AtomicUsize>,
        transient_failures: usize,
    }

    #[async_trait]
    impl Downloader for CountingDownloader {
        fn connector_type(&self) -> &str {
            "counting"
        }

        fn download_dir(&self) -> &Path {
            &self.dir
        }

        fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.transient_failures {
                return Err(IngestError::SourceConnectionNetwork("flaky".into()));
            }
            let path = self.download_path(file_data);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(&path, b"content")?;
            Ok(DownloadResponse::fetched(file_data.clone(), path))
        }
    }

    fn counting(dir: &Path, transient_failures: usize) -> (Box<dyn Downloader>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let downloader = CountingDownloader {
            dir: dir.to_path_buf(),
            calls: calls.clone(),
            transient_failures,
        };
        (Box::new(downloader), calls)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn path_convention_is_deterministic() {
        let fd = FileData::new("doc-1", "local")
            .unwrap()
            .with_source_identifiers(SourceIdentifiers::new("notes.md", "/x/notes.md"));
        let a = default_download_path(Path::new("/dl"), &fd);
        assert_eq!(a, PathBuf::from("/dl/local/doc-1.md"));
        assert_eq!(a, default_download_path(Path::new("/dl"), &fd));
        assert_eq!(
            output_path(Path::new("/out"), &fd),
            PathBuf::from("/out/local/doc-1.json")
        );
    }

    #[test]
    fn unsafe_identifiers_are_hashed() {
        let stem = unit_stem("../../etc/passwd");
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(stem, unit_stem("../../etc/passwd"));
        assert_ne!(stem, unit_stem("../../etc/shadow"));
        assert_eq!(unit_stem("abc_1.2-x"), "abc_1.2-x");
    }

    #[tokio::test]
    async fn absent_units_never_reach_the_connector() {
        let tmp = tempfile::tempdir().unwrap();
        let (inner, calls) = counting(tmp.path(), 0);
        let downloader = decorate(inner, &ProcessorConfig::default(), fast_policy());

        let mut fd = FileData::new("gone", "counting").unwrap();
        fd.metadata.exists = false;

        let response = downloader.run_async(&fd).await.unwrap();
        assert!(response.is_absent());
        let response = downloader.run(&fd).unwrap();
        assert!(response.is_absent());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!response.path.exists());
    }

    #[tokio::test]
    async fn skip_existing_fetches_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (inner, calls) = counting(tmp.path(), 0);
        let downloader = decorate(inner, &ProcessorConfig::default(), fast_policy());
        let fd = FileData::new("doc", "counting").unwrap();

        let first = downloader.run_async(&fd).await.unwrap();
        let second = downloader.run_async(&fd).await.unwrap();
        assert_eq!(first.outcome, crate::models::DownloadOutcome::Fetched);
        assert_eq!(second.outcome, crate::models::DownloadOutcome::Cached);
        assert_eq!(first.path, second.path);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn re_download_bypasses_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let (inner, calls) = counting(tmp.path(), 0);
        let processor = ProcessorConfig {
            re_download: true,
            ..ProcessorConfig::default()
        };
        let downloader = decorate(inner, &processor, fast_policy());
        let fd = FileData::new("doc", "counting").unwrap();
        downloader.run_async(&fd).await.unwrap();
        downloader.run_async(&fd).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_both_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let (inner, calls) = counting(tmp.path(), 2);
        let downloader = Retrying::new(inner, fast_policy());
        let fd = FileData::new("doc", "counting").unwrap();
        downloader.run_async(&fd).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (inner, calls) = counting(tmp.path(), 2);
        let downloader = Retrying::new(inner, fast_policy());
        downloader.run(&fd).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct SleepyDownloader {
        dir: PathBuf,
        delay: Duration,
    }

    #[async_trait]
    impl Downloader for SleepyDownloader {
        fn connector_type(&self) -> &str {
            "sleepy"
        }

        fn download_dir(&self) -> &Path {
            &self.dir
        }

        fn run(&self, file_data: &FileData) -> Result<DownloadResponse> {
            std::thread::sleep(self.delay);
            Ok(DownloadResponse::fetched(
                file_data.clone(),
                self.download_path(file_data),
            ))
        }
    }

    #[tokio::test]
    async fn blocking_downloads_honor_the_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = Box::new(SleepyDownloader {
            dir: tmp.path().to_path_buf(),
            delay: Duration::from_millis(500),
        });
        let policy = RetryPolicy {
            max_attempts: 1,
            timeout: Duration::from_millis(50),
            ..fast_policy()
        };
        let downloader = decorate(inner, &ProcessorConfig::default(), policy);
        assert!(downloader.is_async());

        let started = std::time::Instant::now();
        let fd = FileData::new("slow", "sleepy").unwrap();
        let err = downloader.run_async(&fd).await.unwrap_err();
        assert!(matches!(err, IngestError::SourceConnection(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn blocking_downloads_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Offload::new(Box::new(SleepyDownloader {
            dir: tmp.path().to_path_buf(),
            delay: Duration::from_millis(200),
        }));
        let units: Vec<FileData> = (0..4)
            .map(|i| FileData::new(format!("u{}", i), "sleepy").unwrap())
            .collect();

        let started = std::time::Instant::now();
        let results = futures::future::join_all(units.iter().map(|fd| downloader.run_async(fd))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_and_clean_up() {
        let locks = Arc::new(KeyedLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("same-unit").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
