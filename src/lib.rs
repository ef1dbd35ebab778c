// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod http;
pub mod library;
pub mod progress;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use catalog::{
    CatalogStats, CatalogStore, Category, DownloadState, FontEntry, FontRecord, ListFilter,
    UpsertOutcome,
};
pub use config::{AppPaths, Config};
pub use download::{BatchOptions, BatchSummary, bucket_for, run_batch};
pub use error::{
    BatchError, ConfigError, DownloadError, ExtractError, IndexError, OpenError, StoreError,
    SyncError,
};
pub use extract::{ExtractResult, ExtractSummary, extract_batch, extract_record};
pub use http::{HttpClient, HttpPage, HttpResponse, HttpSettings, ReqwestClient};
pub use library::{DirectDownload, FontLibrary, Selection};
pub use progress::{
    ChannelReporter, NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter,
};
pub use remote::{FontStub, IndexReader};
pub use sync::{SyncReport, sync_catalog};
