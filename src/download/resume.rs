// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::debug;

use super::bucket::PARTIAL_SUFFIX;
use crate::catalog::{DownloadState, FontRecord};
use crate::error::BatchError;

/// Plan for a download batch, splitting the selection by state
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Records that need to be fetched
    pub to_fetch: Vec<FontRecord>,
    /// Records whose archive is already on disk
    pub already_retrieved: Vec<FontRecord>,
    /// Failed records, left alone until explicitly retried
    pub awaiting_retry: Vec<FontRecord>,
    /// Number of distinct records in the selection
    pub total: usize,
}

/// Split a selection into work and already-done records.
///
/// Duplicate ids keep their first occurrence, so no record is handed to two
/// worker lanes.
pub fn plan_batch(selection: Vec<FontRecord>) -> BatchPlan {
    let mut seen = HashSet::new();
    let mut plan = BatchPlan::default();

    for record in selection {
        if !seen.insert(record.id.clone()) {
            continue;
        }
        plan.total += 1;

        match record.download_state {
            DownloadState::NotFetched => plan.to_fetch.push(record),
            DownloadState::Fetched | DownloadState::Extracted => {
                plan.already_retrieved.push(record)
            }
            DownloadState::Failed => plan.awaiting_retry.push(record),
        }
    }

    plan
}

/// Remove `.partial` files left in the bucket directories by killed runs.
///
/// Only files untouched for at least `older_than` are removed; an active
/// download rewrites its partial file continuously, so another live run's
/// work is left alone.
pub fn clean_partial_files(dest_root: &Path, older_than: Duration) -> Result<usize, BatchError> {
    if !dest_root.exists() {
        std::fs::create_dir_all(dest_root).map_err(|e| BatchError::Prepare {
            path: dest_root.to_path_buf(),
            source: e,
        })?;
        return Ok(0);
    }

    let mut cleaned = 0;
    let now = SystemTime::now();

    let buckets = std::fs::read_dir(dest_root).map_err(|e| BatchError::Prepare {
        path: dest_root.to_path_buf(),
        source: e,
    })?;

    for bucket in buckets.flatten() {
        let bucket_path = bucket.path();
        if !bucket_path.is_dir() {
            continue;
        }

        let Ok(entries) = std::fs::read_dir(&bucket_path) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_partial = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX));
            if !is_partial {
                continue;
            }

            let idle = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if idle < older_than {
                continue;
            }

            if std::fs::remove_file(&path).is_ok() {
                debug!("Removed leftover partial file {}", path.display());
                cleaned += 1;
            }
        }
    }

    Ok(cleaned)
}
