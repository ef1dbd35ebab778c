// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::catalog::{Category, DownloadState};
use crate::download::BatchSummary;
use crate::extract::ExtractSummary;

/// Events emitted during sync, download and extraction for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The index walk of a category is starting
    CategoryStarted { category: Category },

    /// One listing page was read
    PageScanned {
        category: Category,
        page: u32,
        items: usize,
    },

    /// A listed font could not be resolved and was left for the next sync
    ItemSkipped { id: String, error: String },

    /// Reconciliation finished
    SyncCompleted {
        added: usize,
        updated: usize,
        unchanged: usize,
        stale: usize,
        errors: usize,
    },

    /// Partial files left by an interrupted run were removed
    PartialFilesCleanedUp { count: usize },

    /// The batch was split into work and already-done records
    BatchPlanned {
        to_fetch: usize,
        already_retrieved: usize,
        awaiting_retry: usize,
    },

    /// A worker lane picked up a record
    DownloadStarted {
        /// Identifies the worker lane (0 to concurrency-1)
        slot: usize,
        id: String,
        name: String,
        /// Index of this record in the batch
        index: usize,
        /// Number of records the batch will try to fetch
        total: usize,
    },

    /// Download progress update
    DownloadProgress {
        slot: usize,
        id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// The archive was renamed into place and recorded as fetched
    DownloadSucceeded {
        slot: usize,
        id: String,
        name: String,
        path: PathBuf,
    },

    /// The record was marked failed
    DownloadFailed {
        slot: usize,
        id: String,
        name: String,
        reason: String,
    },

    /// The record was already handled by another run
    DownloadSkipped { id: String, state: DownloadState },

    /// Terminal event of a download batch
    DownloadFinished { summary: BatchSummary },

    /// Fonts were pulled out of an archive
    ExtractSucceeded {
        id: String,
        name: String,
        files: usize,
    },

    /// Extraction failed; the record stays fetched
    ExtractFailed {
        id: String,
        name: String,
        reason: String,
    },

    /// Terminal event of an extraction batch
    ExtractFinished { summary: ExtractSummary },
}

/// Trait for reporting progress events.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Forwards events into a channel so a consumer can treat them as a stream
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its event stream
    pub fn channel() -> (SharedProgressReporter, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_handles_all_events() {
        let reporter = NoopReporter;

        reporter.report(ProgressEvent::CategoryStarted {
            category: Category::Basic,
        });

        reporter.report(ProgressEvent::PageScanned {
            category: Category::Basic,
            page: 1,
            items: 10,
        });

        reporter.report(ProgressEvent::DownloadStarted {
            slot: 0,
            id: "zorro".to_string(),
            name: "Zorro".to_string(),
            index: 0,
            total: 5,
        });

        reporter.report(ProgressEvent::DownloadProgress {
            slot: 0,
            id: "zorro".to_string(),
            bytes_downloaded: 512,
            total_bytes: Some(1024),
        });

        reporter.report(ProgressEvent::DownloadFailed {
            slot: 1,
            id: "gothica".to_string(),
            name: "Gothica".to_string(),
            reason: "Connection timeout".to_string(),
        });

        reporter.report(ProgressEvent::DownloadFinished {
            summary: BatchSummary::default(),
        });

        reporter.report(ProgressEvent::ExtractFinished {
            summary: ExtractSummary::default(),
        });
    }

    #[tokio::test]
    async fn channel_reporter_streams_events_in_order() {
        let (reporter, mut rx) = ChannelReporter::channel();

        reporter.report(ProgressEvent::PartialFilesCleanedUp { count: 2 });
        reporter.report(ProgressEvent::DownloadSkipped {
            id: "zorro".to_string(),
            state: DownloadState::Fetched,
        });
        drop(reporter);

        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::PartialFilesCleanedUp { count: 2 })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::DownloadSkipped { .. })
        ));
        assert!(rx.recv().await.is_none());
    }
}
