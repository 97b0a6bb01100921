use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{StreamExt, stream};
use photosync_remote::{CatalogError, ErrorClass, RemoteCatalog};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::engine::SyncError;
use super::paths::{PathError, canonical_candidates, partial_path, resolve};
use super::stats::RunSummary;
use super::store::{IndexStore, MediaRecord, MediaStatus, StoreError};
use crate::config::IdentityConfig;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("remote item has no download locator")]
    NoLocator,
}

impl DownloadError {
    fn class(&self) -> ErrorClass {
        match self {
            DownloadError::Catalog(err) => err.class(),
            // A short body is a truncated transfer.
            DownloadError::SizeMismatch { .. } => ErrorClass::Transient,
            DownloadError::NoLocator => ErrorClass::LocatorExpired,
            DownloadError::Io(_) | DownloadError::Path(_) | DownloadError::Store(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

enum Outcome {
    Downloaded { bytes: u64 },
    /// Installed on disk but the store refused the status update.
    Unrecorded(StoreError),
    Deferred(String),
    Failed(String),
    AuthAborted(String),
    Skipped,
}

/// Fetches bytes for pending items into the canonical tree with a bounded
/// worker pool.
pub struct DownloadScheduler<'a> {
    config: &'a IdentityConfig,
    store: &'a IndexStore,
    catalog: &'a dyn RemoteCatalog,
    retry: RetryPolicy,
    abort: AtomicBool,
}

impl<'a> DownloadScheduler<'a> {
    pub fn new(
        config: &'a IdentityConfig,
        store: &'a IndexStore,
        catalog: &'a dyn RemoteCatalog,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            retry: config.retry_policy(),
            abort: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        summary.repaired += self.repair_missing().await?;

        let candidates = self.store.list_download_candidates().await?;
        if candidates.is_empty() {
            debug!(identity = %self.config.name, "nothing to download");
            return Ok(());
        }

        // Placeholders are hydrated and paths reserved up front, sequentially
        // in id order, so collisions resolve the same way on every run.
        let mut claimed = self.store.claimed_paths().await?;
        let mut outcomes: Vec<(String, Outcome)> = Vec::new();
        let mut jobs = Vec::with_capacity(candidates.len());
        for mut record in candidates {
            let mut refreshed = false;
            if record.placeholder {
                if let Err(err) = self.refresh(&mut record).await {
                    let outcome = self.classify_failure(&record, err).await;
                    outcomes.push((record.remote_id, outcome));
                    if self.abort.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                refreshed = true;
            }
            if record.canonical_path.is_none()
                && let Err(err) = self.reserve(&mut record, &mut claimed).await
            {
                warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %err, "failed to reserve canonical path");
                summary.fail(&record.remote_id, err.to_string());
                summary.failed += 1;
                continue;
            }
            jobs.push((record, refreshed));
        }

        info!(identity = %self.config.name, items = jobs.len(), concurrency = self.config.concurrency, "downloading pending items");
        let fetched: Vec<(String, Outcome)> = stream::iter(jobs)
            .map(|(record, refreshed)| async move {
                let remote_id = record.remote_id.clone();
                (remote_id, self.process(record, refreshed).await)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        outcomes.extend(fetched);

        let mut auth_error = None;
        for (remote_id, outcome) in outcomes {
            match outcome {
                Outcome::Downloaded { bytes } => {
                    debug!(identity = %self.config.name, remote_id = %remote_id, bytes, "downloaded");
                    summary.downloaded += 1;
                }
                Outcome::Unrecorded(err) => {
                    summary.downloaded += 1;
                    summary.warn(format!("downloaded {remote_id} but failed to record it: {err}"));
                }
                Outcome::Deferred(reason) => {
                    summary.deferred += 1;
                    summary.fail(remote_id, reason);
                }
                Outcome::Failed(reason) => {
                    summary.failed += 1;
                    summary.fail(remote_id, reason);
                }
                Outcome::AuthAborted(reason) => auth_error = Some(reason),
                Outcome::Skipped => {}
            }
        }

        match auth_error {
            Some(reason) => Err(SyncError::Catalog(CatalogError::AuthRequired(reason))),
            None => Ok(()),
        }
    }

    /// Reverts `downloaded` records whose canonical file disappeared.
    async fn repair_missing(&self) -> Result<usize, SyncError> {
        let mut repaired = 0;
        for record in self.store.list_media_with_status(MediaStatus::Downloaded).await? {
            let present = match record.canonical_path.as_deref() {
                Some(rel) => resolve(&self.config.data_dir, rel)?.is_file(),
                None => false,
            };
            if !present {
                info!(identity = %self.config.name, remote_id = %record.remote_id, "canonical file missing, scheduling download");
                self.store.revert_to_pending(&record.remote_id).await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn reserve(
        &self,
        record: &mut MediaRecord,
        claimed: &mut HashSet<String>,
    ) -> Result<(), DownloadError> {
        let path = canonical_candidates(&record.filename, record.created_at, &record.remote_id)
            .into_iter()
            .find(|candidate| !claimed.contains(candidate))
            .ok_or_else(|| PathError::Exhausted(record.remote_id.clone()))?;
        if !self.store.reserve_canonical_path(&record.remote_id, &path).await? {
            // Someone else assigned it; trust the stored value.
            let stored = self
                .store
                .get_media(&record.remote_id)
                .await?
                .and_then(|fresh| fresh.canonical_path)
                .ok_or_else(|| StoreError::MissingRecord(record.remote_id.clone()))?;
            record.canonical_path = Some(stored);
            return Ok(());
        }
        claimed.insert(path.clone());
        record.canonical_path = Some(path);
        Ok(())
    }

    async fn process(&self, mut record: MediaRecord, refreshed: bool) -> Outcome {
        if self.abort.load(Ordering::SeqCst) {
            return Outcome::Skipped;
        }

        match self.fetch_with_retry(&mut record, refreshed).await {
            Ok(bytes) => match self.store.mark_downloaded(&record.remote_id).await {
                Ok(()) => Outcome::Downloaded { bytes },
                Err(err) => {
                    warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %err, "failed to record download");
                    Outcome::Unrecorded(err)
                }
            },
            Err(err) => self.classify_failure(&record, err).await,
        }
    }

    async fn fetch_with_retry(&self, record: &mut MediaRecord, mut refreshed: bool) -> Result<u64, DownloadError> {
        let target = match record.canonical_path.as_deref() {
            Some(rel) => resolve(&self.config.data_dir, rel)?,
            None => return Err(PathError::Empty.into()),
        };
        let expected = record.fingerprint.as_ref().and_then(|fp| fp.expected_size());
        let mut attempt = 0;

        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(CatalogError::AuthRequired("run aborted".into()).into());
            }
            let result = match record.locator.clone() {
                Some(locator) => self.install(&locator, &target, expected).await,
                None => Err(DownloadError::NoLocator),
            };
            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Transient if self.retry.allows_retry(attempt) => {
                    debug!(identity = %self.config.name, remote_id = %record.remote_id, attempt, error = %err, "transient download failure, retrying");
                    self.retry.pause(attempt).await;
                    attempt += 1;
                }
                ErrorClass::LocatorExpired if !refreshed => {
                    debug!(identity = %self.config.name, remote_id = %record.remote_id, "download locator expired, refreshing metadata");
                    refreshed = true;
                    self.refresh(record).await?;
                }
                _ => return Err(err),
            }
        }
    }

    /// Replaces the record's metadata and locator with a fresh single-item lookup.
    async fn refresh(&self, record: &mut MediaRecord) -> Result<(), DownloadError> {
        let fresh = self.catalog.get_media_item(&record.remote_id).await?;
        if let Err(err) = self.store.hydrate_media(&fresh).await {
            warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %err, "failed to store refreshed metadata");
        }
        record.filename = fresh.filename;
        record.created_at = fresh.created_at;
        if fresh.fingerprint.is_some() {
            record.fingerprint = fresh.fingerprint;
        }
        record.locator = fresh.locator;
        record.placeholder = false;
        Ok(())
    }

    /// Streams into `<target>.partial`, syncs, checks the size and renames
    /// over `target`. Readers never observe a partial canonical file.
    async fn install(&self, locator: &str, target: &Path, expected: Option<u64>) -> Result<u64, DownloadError> {
        let partial = partial_path(target);
        let result = self.write_partial(locator, target, &partial, expected).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(bytes)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn write_partial(
        &self,
        locator: &str,
        target: &Path,
        partial: &Path,
        expected: Option<u64>,
    ) -> Result<u64, DownloadError> {
        let mut stream = self.catalog.fetch_bytes(locator).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected
            && expected != written
        {
            return Err(DownloadError::SizeMismatch {
                expected,
                actual: written,
            });
        }
        Ok(written)
    }

    async fn classify_failure(&self, record: &MediaRecord, err: DownloadError) -> Outcome {
        let reason = err.to_string();
        match err.class() {
            ErrorClass::AuthRequired => {
                self.abort.store(true, Ordering::SeqCst);
                warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %reason, "authentication required, stopping downloads");
                Outcome::AuthAborted(reason)
            }
            ErrorClass::NotFound => {
                info!(identity = %self.config.name, remote_id = %record.remote_id, "remote item vanished, skipping for this pass");
                Outcome::Deferred(reason)
            }
            ErrorClass::Transient | ErrorClass::LocatorExpired | ErrorClass::Permanent => {
                match self
                    .store
                    .record_failure(&record.remote_id, &reason, self.config.max_failures)
                    .await
                {
                    Ok(MediaStatus::Failed) => {
                        warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %reason, "download failed, giving up until next run");
                    }
                    Ok(_) => {
                        warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %reason, "download failed");
                    }
                    Err(store_err) => {
                        warn!(identity = %self.config.name, remote_id = %record.remote_id, error = %store_err, "failed to record download failure");
                    }
                }
                Outcome::Failed(reason)
            }
        }
    }
}
