// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bucket::{archive_path, archive_path_with_id};
use super::fetch::{FetchContext, FetchedArchive, fetch_archive};
use super::resume::{clean_partial_files, plan_batch};
use crate::catalog::{CatalogStore, DownloadState, FontRecord};
use crate::error::{BatchError, DownloadError, StoreError};
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::remote::IndexReader;

/// Partial files idle for this long belong to a run that is gone
const STALE_PARTIAL_AGE: Duration = Duration::from_secs(10 * 60);

/// Options for a download batch
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Number of worker lanes, i.e. simultaneous connections
    pub concurrency: usize,
    /// Root of the bucketed archive tree
    pub dest_root: PathBuf,
}

/// Terminal summary of a download batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Records fetched and recorded during this batch
    pub fetched: usize,
    /// Records marked failed during this batch
    pub failed: usize,
    /// Records left alone: already retrieved, failed earlier, or finished by another run
    pub skipped: usize,
    /// Records left NotFetched because the batch was cancelled
    pub cancelled: usize,
    /// Details of failed records (id, reason)
    pub failures: Vec<(String, String)>,
}

/// State shared by all worker lanes
struct Lanes<C> {
    store: Arc<CatalogStore>,
    reader: IndexReader<C>,
    dest_root: PathBuf,
    reporter: SharedProgressReporter,
    queue: Mutex<VecDeque<(usize, FontRecord)>>,
    total: usize,
    /// Cancelled by the caller or after a fatal store error
    stop: CancellationToken,
    fatal: Mutex<Option<StoreError>>,
    fetched: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    cancelled: AtomicUsize,
    failures: Mutex<Vec<(String, String)>>,
    /// Final archive paths handed out in this batch
    claimed: Mutex<HashSet<PathBuf>>,
}

/// Fetch the archives of the selected records.
///
/// Only NotFetched records are fetched; Failed ones wait for an explicit
/// retry. A bounded number of worker lanes pull records from a shared
/// queue, so each record is handled by exactly one lane. Every lane
/// re-reads a record's state right before fetching and skips it if another
/// run got there first.
///
/// Per-record failures mark the record Failed and never stop sibling work.
/// A fatal store error stops all lanes; the terminal event is still
/// reported before the error is returned. On cancellation, records already
/// fetched keep their state and everything else stays NotFetched.
pub async fn run_batch<C: HttpClient + Clone + 'static>(
    store: Arc<CatalogStore>,
    reader: &IndexReader<C>,
    selection: Vec<FontRecord>,
    options: &BatchOptions,
    cancel: &CancellationToken,
    reporter: SharedProgressReporter,
) -> Result<BatchSummary, BatchError> {
    let cleaned = clean_partial_files(&options.dest_root, STALE_PARTIAL_AGE)?;
    if cleaned > 0 {
        reporter.report(ProgressEvent::PartialFilesCleanedUp { count: cleaned });
    }

    let plan = plan_batch(selection);
    reporter.report(ProgressEvent::BatchPlanned {
        to_fetch: plan.to_fetch.len(),
        already_retrieved: plan.already_retrieved.len(),
        awaiting_retry: plan.awaiting_retry.len(),
    });
    info!(
        "Batch of {}: {} to fetch, {} already retrieved, {} awaiting retry",
        plan.total,
        plan.to_fetch.len(),
        plan.already_retrieved.len(),
        plan.awaiting_retry.len()
    );

    let total = plan.to_fetch.len();
    let lanes = Arc::new(Lanes {
        store,
        reader: reader.clone(),
        dest_root: options.dest_root.clone(),
        reporter: reporter.clone(),
        queue: Mutex::new(plan.to_fetch.into_iter().enumerate().collect()),
        total,
        stop: cancel.child_token(),
        fatal: Mutex::new(None),
        fetched: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
        skipped: AtomicUsize::new(plan.already_retrieved.len() + plan.awaiting_retry.len()),
        cancelled: AtomicUsize::new(0),
        failures: Mutex::new(Vec::new()),
        claimed: Mutex::new(HashSet::new()),
    });

    let lane_count = options.concurrency.max(1).min(total.max(1));
    let mut handles = Vec::with_capacity(lane_count);
    for slot in 0..lane_count {
        let lanes = lanes.clone();
        handles.push(tokio::spawn(async move { lanes.run_lane(slot).await }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker lane panicked: {}", e);
        }
    }

    // Whatever is still queued was never started
    let unstarted = lanes.queue.lock().await.len();
    lanes.cancelled.fetch_add(unstarted, Ordering::SeqCst);

    let summary = BatchSummary {
        fetched: lanes.fetched.load(Ordering::SeqCst),
        failed: lanes.failed.load(Ordering::SeqCst),
        skipped: lanes.skipped.load(Ordering::SeqCst),
        cancelled: lanes.cancelled.load(Ordering::SeqCst),
        failures: lanes.failures.lock().await.clone(),
    };

    reporter.report(ProgressEvent::DownloadFinished {
        summary: summary.clone(),
    });

    match lanes.fatal.lock().await.take() {
        Some(e) => Err(BatchError::Store(e)),
        None => Ok(summary),
    }
}

impl<C: HttpClient + Clone + 'static> Lanes<C> {
    async fn run_lane(&self, slot: usize) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let Some((index, record)) = self.queue.lock().await.pop_front() else {
                break;
            };

            if let Err(e) = self.process(slot, index, record).await {
                error!("Catalog failure, stopping batch: {}", e);
                let mut fatal = self.fatal.lock().await;
                if fatal.is_none() {
                    *fatal = Some(e);
                }
                self.stop.cancel();
                break;
            }
        }
    }

    /// Handle one record; only fatal store errors are returned
    async fn process(
        &self,
        slot: usize,
        index: usize,
        record: FontRecord,
    ) -> Result<(), StoreError> {
        let Some(current) = self.store.get(&record.id)? else {
            warn!("{} vanished from the catalog, skipping", record.id);
            self.skipped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        if current.download_state != DownloadState::NotFetched {
            debug!("{} is already {}, skipping", current.id, current.download_state);
            self.skip(&current.id, current.download_state);
            return Ok(());
        }

        self.store.record_attempt(&current.id)?;
        let final_path = self.claim_archive_path(&current).await?;

        self.reporter.report(ProgressEvent::DownloadStarted {
            slot,
            id: current.id.clone(),
            name: current.name.clone(),
            index,
            total: self.total,
        });

        match self.retrieve(slot, &current, &final_path).await {
            Ok(fetched) => self.record_success(slot, &current, fetched),
            Err(DownloadError::Cancelled) => {
                debug!("{} cancelled, stays not fetched", current.id);
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => self.record_failure(slot, &current, e).await,
        }
    }

    /// Pick the archive path for a record.
    ///
    /// Names that sanitize to the same stem share a plain path. Whoever finds
    /// it already taken falls back to the id-qualified name.
    async fn claim_archive_path(&self, record: &FontRecord) -> Result<PathBuf, StoreError> {
        let mut claimed = self.claimed.lock().await;
        let plain = archive_path(&self.dest_root, &record.name, &record.id);

        let owner = self.store.archive_owner(&plain)?;
        let taken = claimed.contains(&plain)
            || owner.as_ref().is_some_and(|id| *id != record.id)
            || (owner.is_none() && plain.exists());

        let path = if taken {
            let path = archive_path_with_id(&self.dest_root, &record.name, &record.id);
            debug!("{} is taken, {} goes to {}", plain.display(), record.id, path.display());
            path
        } else {
            plain
        };
        claimed.insert(path.clone());
        Ok(path)
    }

    async fn retrieve(
        &self,
        slot: usize,
        record: &FontRecord,
        final_path: &Path,
    ) -> Result<FetchedArchive, DownloadError> {
        let link = record
            .download_url
            .as_deref()
            .unwrap_or(&record.source_url);

        let url = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(DownloadError::Cancelled),
            url = self.reader.resolve_final_url(link) => url?,
        };

        let context = FetchContext {
            slot,
            id: record.id.clone(),
        };

        fetch_archive(
            self.reader.client(),
            &url,
            final_path,
            &context,
            &self.stop,
            &self.reporter,
        )
        .await
    }

    fn record_success(
        &self,
        slot: usize,
        record: &FontRecord,
        fetched: FetchedArchive,
    ) -> Result<(), StoreError> {
        match self
            .store
            .mark_fetched(&record.id, &fetched.path, Some(&fetched.content_hash))
        {
            Ok(()) => {
                self.fetched.fetch_add(1, Ordering::SeqCst);
                self.reporter.report(ProgressEvent::DownloadSucceeded {
                    slot,
                    id: record.id.clone(),
                    name: record.name.clone(),
                    path: fetched.path,
                });
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                // Another run recorded it while we were fetching
                debug!("{} changed state during fetch: {}", record.id, e);
                self.skip(&record.id, DownloadState::Fetched);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn record_failure(
        &self,
        slot: usize,
        record: &FontRecord,
        failure: DownloadError,
    ) -> Result<(), StoreError> {
        let reason = failure.to_string();
        warn!("Failed to fetch {}: {}", record.id, reason);

        match self.store.mark_failed(&record.id, &reason) {
            Ok(()) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.failures
                    .lock()
                    .await
                    .push((record.id.clone(), reason.clone()));
                self.reporter.report(ProgressEvent::DownloadFailed {
                    slot,
                    id: record.id.clone(),
                    name: record.name.clone(),
                    reason,
                });
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                debug!("{} changed state during fetch: {}", record.id, e);
                let state = self
                    .store
                    .get(&record.id)?
                    .map(|r| r.download_state)
                    .unwrap_or(DownloadState::Failed);
                self.skip(&record.id, state);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn skip(&self, id: &str, state: DownloadState) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.reporter.report(ProgressEvent::DownloadSkipped {
            id: id.to_string(),
            state,
        });
    }
}
