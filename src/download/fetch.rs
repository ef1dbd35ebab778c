// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bucket::partial_path;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Identifies a fetch in concurrent scenarios
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Worker lane (0 to concurrency-1) for progress bar management
    pub slot: usize,
    /// Catalog id of the font being fetched
    pub id: String,
}

/// An archive that was renamed into its final place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub bytes: u64,
    /// `sha256:<hex>` of the archive content
    pub content_hash: String,
}

/// Download an archive to `final_path`.
///
/// The body is streamed into a `.partial` sibling and only renamed to
/// `final_path` once complete, so the final name never refers to a partial
/// file. On any failure, cancellation included, the partial file is removed.
pub async fn fetch_archive<C: HttpClient>(
    client: &C,
    url: &str,
    final_path: &Path,
    context: &FetchContext,
    cancel: &CancellationToken,
    reporter: &SharedProgressReporter,
) -> Result<FetchedArchive, DownloadError> {
    if let Some(parent) = final_path.parent() {
        // create_dir_all tolerates a concurrent creator
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::CreateDirectoryFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let partial = partial_path(final_path, &context.id);

    let streamed = stream_to_file(client, url, &partial, context, cancel, reporter).await;
    let (bytes, content_hash) = match streamed {
        Ok(done) => done,
        Err(e) => {
            if tokio::fs::remove_file(&partial).await.is_ok() {
                debug!("Removed partial file {}", partial.display());
            }
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial, final_path).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(DownloadError::RenameFailed {
            from: partial,
            source: e,
        });
    }

    Ok(FetchedArchive {
        path: final_path.to_path_buf(),
        bytes,
        content_hash,
    })
}

async fn stream_to_file<C: HttpClient>(
    client: &C,
    url: &str,
    partial: &Path,
    context: &FetchContext,
    cancel: &CancellationToken,
    reporter: &SharedProgressReporter,
) -> Result<(u64, String), DownloadError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = client.get_stream(url) => response.map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?,
    };

    if response.status >= 400 {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    let mut file = File::create(partial)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: partial.to_path_buf(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };

        let Some(chunk_result) = next else {
            break;
        };

        let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
            url: url.to_string(),
            source: e,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: partial.to_path_buf(),
                source: e,
            })?;

        hasher.update(&chunk);
        bytes_downloaded += chunk.len() as u64;

        reporter.report(ProgressEvent::DownloadProgress {
            slot: context.slot,
            id: context.id.clone(),
            bytes_downloaded,
            total_bytes: response.content_length,
        });
    }

    if bytes_downloaded == 0 {
        return Err(DownloadError::EmptyArchive {
            url: url.to_string(),
        });
    }

    // Data must be on disk before the rename makes it visible
    file.flush()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: partial.to_path_buf(),
            source: e,
        })?;
    file.sync_all()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: partial.to_path_buf(),
            source: e,
        })?;

    Ok((bytes_downloaded, format!("sha256:{:x}", hasher.finalize())))
}
