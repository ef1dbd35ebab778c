// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pulling font files out of fetched archives.
//!
//! Extraction is decoupled from retrieval: a failed extraction leaves the
//! record Fetched, so the archive is never downloaded again just because
//! it could not be unpacked.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::catalog::{CatalogStore, DownloadState, FontRecord};
use crate::download::font_dir;
use crate::error::{BatchError, ExtractError, StoreError};
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Extensions recognised as font files (compared case-insensitively)
pub const FONT_EXTENSIONS: [&str; 2] = ["ttf", "otf"];

/// Fonts written for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractResult {
    pub id: String,
    /// Directory holding the extracted fonts
    pub font_dir: PathBuf,
    pub extracted_files: BTreeSet<PathBuf>,
}

/// Terminal summary of an extraction batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Records marked extracted
    pub extracted: usize,
    /// Records whose archive could not be unpacked (still fetched)
    pub failed: usize,
    /// Records that were not in the fetched state
    pub skipped: usize,
    /// Font files written in total
    pub files: usize,
    /// Details of failed records (id, reason)
    pub failures: Vec<(String, String)>,
}

/// Extract the fonts of one fetched record into `<root>/<bucket>/<stem>/`,
/// where the stem is the archive's file name without `.zip`.
///
/// The record's state is re-read first. Fonts are unpacked into a hidden
/// staging directory which replaces the font directory only once every
/// entry was written. On failure the reason is recorded on the record and
/// its state stays Fetched.
pub fn extract_record(
    store: &CatalogStore,
    record: &FontRecord,
    dest_root: &Path,
) -> Result<ExtractResult, ExtractError> {
    let current = store
        .get(&record.id)?
        .ok_or_else(|| StoreError::UnknownRecord(record.id.clone()))?;

    if current.download_state != DownloadState::Fetched {
        return Err(ExtractError::NotFetched {
            id: current.id,
            state: current.download_state,
        });
    }

    let unpacked = match current.local_archive_path.as_deref() {
        Some(archive) => {
            let target = font_dir(dest_root, &current.name, archive);
            unpack_fonts(archive, &target).map(|files| (target, files))
        }
        None => Err(ExtractError::MissingArchive {
            path: PathBuf::new(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no archive path recorded",
            ),
        }),
    };

    match unpacked {
        Ok((target, extracted_files)) => {
            store.mark_extracted(&current.id)?;
            debug!(
                "Extracted {} font(s) for {} into {}",
                extracted_files.len(),
                current.id,
                target.display()
            );
            Ok(ExtractResult {
                id: current.id,
                font_dir: target,
                extracted_files,
            })
        }
        Err(e) => {
            warn!("Extraction of {} failed: {}", current.id, e);
            store.record_error(&current.id, &e.to_string())?;
            Err(e)
        }
    }
}

/// Whether an archive entry name looks like a font file
pub fn is_font_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            FONT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Unpack the font entries of `archive` so they end up flat in `target`
fn unpack_fonts(
    archive: &Path,
    target: &Path,
) -> Result<BTreeSet<PathBuf>, ExtractError> {
    let file = File::open(archive).map_err(|e| ExtractError::MissingArchive {
        path: archive.to_path_buf(),
        source: e,
    })?;
    let mut zip =
        ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractError::BadArchive {
            path: archive.to_path_buf(),
            source: e,
        })?;

    let staging = staging_dir(target);
    if staging.exists() {
        // Left behind by an interrupted extraction
        let _ = std::fs::remove_dir_all(&staging);
    }
    std::fs::create_dir_all(&staging).map_err(|e| ExtractError::WriteFailed {
        path: staging.clone(),
        source: e,
    })?;

    let result = copy_fonts(&mut zip, archive, &staging).and_then(|names| {
        if names.is_empty() {
            return Err(ExtractError::NoFontFiles {
                path: archive.to_path_buf(),
            });
        }
        replace_dir(&staging, target)?;
        Ok(names.into_iter().map(|name| target.join(name)).collect())
    });

    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn copy_fonts(
    zip: &mut ZipArchive<BufReader<File>>,
    archive: &Path,
    staging: &Path,
) -> Result<BTreeSet<String>, ExtractError> {
    let mut names = BTreeSet::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| ExtractError::BadArchive {
            path: archive.to_path_buf(),
            source: e,
        })?;

        if entry.is_dir() || entry.name().contains("__MACOSX") {
            continue;
        }

        // Entries are flattened; unsafe names are never written
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            continue;
        };

        if !is_font_file(&file_name) {
            continue;
        }

        let file_name = match unused_name(&names, &file_name) {
            Some(unused) => {
                warn!(
                    "{} in {} repeats the name {}, writing it as {}",
                    entry.name(),
                    archive.display(),
                    file_name,
                    unused
                );
                unused
            }
            None => file_name,
        };

        let out_path = staging.join(&file_name);
        let mut out = File::create(&out_path).map_err(|e| ExtractError::WriteFailed {
            path: out_path.clone(),
            source: e,
        })?;
        std::io::copy(&mut entry, &mut out).map_err(|e| ExtractError::EntryReadFailed {
            path: archive.to_path_buf(),
            entry: entry.name().to_string(),
            source: e,
        })?;

        names.insert(file_name);
    }

    Ok(names)
}

/// A free `<stem> (n).<ext>` when `name` is already taken, compared
/// case-insensitively
fn unused_name(taken: &BTreeSet<String>, name: &str) -> Option<String> {
    let is_taken = |candidate: &str| taken.iter().any(|t| t.eq_ignore_ascii_case(candidate));
    if !is_taken(name) {
        return None;
    }

    let path = Path::new(name);
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path.extension().unwrap_or_default().to_string_lossy();
    (2..)
        .map(|n| format!("{stem} ({n}).{ext}"))
        .find(|candidate| !is_taken(candidate))
}

/// Swap the staging directory in as `target`
fn replace_dir(staging: &Path, target: &Path) -> Result<(), ExtractError> {
    if target.exists() {
        std::fs::remove_dir_all(target).map_err(|e| ExtractError::WriteFailed {
            path: target.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::rename(staging, target).map_err(|e| ExtractError::WriteFailed {
        path: target.to_path_buf(),
        source: e,
    })
}

fn staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.extracting"))
}

/// Extract every fetched record of the selection.
///
/// Runs on blocking threads with its own bound, separate from the download
/// lanes. Records that are not Fetched are skipped. A fatal store error
/// stops the batch after the terminal event is reported.
pub async fn extract_batch(
    store: Arc<CatalogStore>,
    selection: Vec<FontRecord>,
    dest_root: &Path,
    concurrency: usize,
    reporter: SharedProgressReporter,
) -> Result<ExtractSummary, BatchError> {
    let mut summary = ExtractSummary::default();
    let mut fatal = None;

    let (work, rest): (Vec<_>, Vec<_>) = selection
        .into_iter()
        .partition(|r| r.download_state == DownloadState::Fetched);
    summary.skipped += rest.len();

    let mut results = stream::iter(work)
        .map(|record| {
            let store = Arc::clone(&store);
            let dest_root = dest_root.to_path_buf();
            async move {
                let name = record.name.clone();
                let id = record.id.clone();
                let result = tokio::task::spawn_blocking(move || {
                    extract_record(&store, &record, &dest_root)
                })
                .await;
                (id, name, result)
            }
        })
        .buffer_unordered(concurrency.max(1));

    while let Some((id, name, joined)) = results.next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!("Extraction task for {} did not finish: {}", id, e);
                summary.failed += 1;
                summary.failures.push((id.clone(), e.to_string()));
                reporter.report(ProgressEvent::ExtractFailed {
                    id,
                    name,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match result {
            Ok(extracted) => {
                summary.extracted += 1;
                summary.files += extracted.extracted_files.len();
                reporter.report(ProgressEvent::ExtractSucceeded {
                    id,
                    name,
                    files: extracted.extracted_files.len(),
                });
            }
            Err(ExtractError::NotFetched { .. }) => summary.skipped += 1,
            Err(ExtractError::Store(e)) if e.is_fatal() => {
                fatal = Some(e);
                break;
            }
            Err(e) => {
                summary.failed += 1;
                summary.failures.push((id.clone(), e.to_string()));
                reporter.report(ProgressEvent::ExtractFailed {
                    id,
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    reporter.report(ProgressEvent::ExtractFinished {
        summary: summary.clone(),
    });

    match fatal {
        Some(e) => Err(BatchError::Store(e)),
        None => Ok(summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::catalog::{Category, FontEntry, ListFilter};
    use crate::download::{archive_path, archive_path_with_id};
    use crate::progress::NoopReporter;
    use crate::test_support::zip_bytes;

    /// Add a font to the catalog and place its archive as if fetched
    fn fetched_font(store: &CatalogStore, root: &Path, id: &str, name: &str, archive: &[u8]) {
        store
            .upsert(&FontEntry {
                id: id.to_string(),
                name: name.to_string(),
                category: Some(Category::Basic),
                source_url: format!("https://fonts.test/{id}.font"),
                download_url: None,
            })
            .unwrap();

        let path = archive_path(root, name, id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, archive).unwrap();
        store.mark_fetched(id, &path, None).unwrap();
    }

    fn record(store: &CatalogStore, id: &str) -> FontRecord {
        store.get(id).unwrap().unwrap()
    }

    #[test]
    fn extracts_only_font_files_flattened() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        let archive = zip_bytes(&[
            ("Zorro/", ""),
            ("Zorro/Zorro.TTF", "ttf data"),
            ("Zorro/extra/Zorro Bold.otf", "otf data"),
            ("Zorro/readme.txt", "hello"),
            ("__MACOSX/Zorro/._Zorro.ttf", "resource fork"),
            ("preview.png", "png"),
        ]);
        fetched_font(&store, dir.path(), "zorro", "Zorro", &archive);

        let result = extract_record(&store, &record(&store, "zorro"), dir.path()).unwrap();

        let target = dir.path().join("Z").join("Zorro");
        assert_eq!(result.font_dir, target);
        let expected: BTreeSet<PathBuf> = [target.join("Zorro Bold.otf"), target.join("Zorro.TTF")]
            .into_iter()
            .collect();
        assert_eq!(result.extracted_files, expected);
        assert_eq!(std::fs::read(target.join("Zorro.TTF")).unwrap(), b"ttf data");
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 2);
        assert!(!dir.path().join("Z").join(".Zorro.extracting").exists());

        assert_eq!(record(&store, "zorro").download_state, DownloadState::Extracted);
    }

    #[test]
    fn same_file_name_in_two_folders_keeps_both() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        let archive = zip_bytes(&[
            ("regular/Font.ttf", "regular"),
            ("bold/Font.ttf", "bold"),
            ("bold/FONT.TTF", "shouting"),
        ]);
        fetched_font(&store, dir.path(), "font", "Font", &archive);

        let result = extract_record(&store, &record(&store, "font"), dir.path()).unwrap();

        let target = dir.path().join("F").join("Font");
        assert_eq!(result.extracted_files.len(), 3);
        assert_eq!(std::fs::read(target.join("Font.ttf")).unwrap(), b"regular");
        assert_eq!(std::fs::read(target.join("Font (2).ttf")).unwrap(), b"bold");
        assert_eq!(std::fs::read(target.join("FONT (3).TTF")).unwrap(), b"shouting");
    }

    #[test]
    fn same_name_records_extract_to_their_own_dirs() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        fetched_font(&store, dir.path(), "zorro", "Zorro", &zip_bytes(&[("Z.ttf", "one")]));
        store
            .upsert(&FontEntry {
                id: "zorro-2".to_string(),
                name: "Zorro".to_string(),
                category: Some(Category::Basic),
                source_url: "https://fonts.test/zorro-2.font".to_string(),
                download_url: None,
            })
            .unwrap();
        let second = archive_path_with_id(dir.path(), "Zorro", "zorro-2");
        std::fs::write(&second, zip_bytes(&[("Z.ttf", "two")])).unwrap();
        store.mark_fetched("zorro-2", &second, None).unwrap();

        let first = extract_record(&store, &record(&store, "zorro"), dir.path()).unwrap();
        let other = extract_record(&store, &record(&store, "zorro-2"), dir.path()).unwrap();

        assert_eq!(first.font_dir, dir.path().join("Z").join("Zorro"));
        assert_eq!(other.font_dir, dir.path().join("Z").join("Zorro.zorro-2"));
        assert_eq!(std::fs::read(first.font_dir.join("Z.ttf")).unwrap(), b"one");
        assert_eq!(std::fs::read(other.font_dir.join("Z.ttf")).unwrap(), b"two");
    }

    #[test]
    fn malformed_archive_stays_fetched() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        fetched_font(&store, dir.path(), "broken", "Broken", b"<html>not a zip</html>");

        let result = extract_record(&store, &record(&store, "broken"), dir.path());

        assert!(matches!(result, Err(ExtractError::BadArchive { .. })));
        let after = record(&store, "broken");
        assert_eq!(after.download_state, DownloadState::Fetched);
        assert!(after.last_error.unwrap().contains("Malformed archive"));
        assert!(!dir.path().join("B").join("Broken").exists());
    }

    #[test]
    fn archive_without_fonts_is_an_error() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        let archive = zip_bytes(&[("readme.txt", "no fonts here")]);
        fetched_font(&store, dir.path(), "empty", "Empty", &archive);

        let result = extract_record(&store, &record(&store, "empty"), dir.path());

        assert!(matches!(result, Err(ExtractError::NoFontFiles { .. })));
        assert_eq!(record(&store, "empty").download_state, DownloadState::Fetched);
        assert!(!dir.path().join("E").join(".Empty.extracting").exists());
    }

    #[test]
    fn missing_archive_file_is_reported() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        fetched_font(&store, dir.path(), "gone", "Gone", b"x");
        std::fs::remove_file(archive_path(dir.path(), "Gone", "gone")).unwrap();

        let result = extract_record(&store, &record(&store, "gone"), dir.path());
        assert!(matches!(result, Err(ExtractError::MissingArchive { .. })));
    }

    #[test]
    fn only_fetched_records_are_extracted() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::in_memory().unwrap();
        store
            .upsert(&FontEntry {
                id: "pending".to_string(),
                name: "Pending".to_string(),
                category: None,
                source_url: "https://fonts.test/pending.font".to_string(),
                download_url: None,
            })
            .unwrap();

        let result = extract_record(&store, &record(&store, "pending"), dir.path());
        assert!(matches!(
            result,
            Err(ExtractError::NotFetched {
                state: DownloadState::NotFetched,
                ..
            })
        ));
    }

    #[test]
    fn font_extensions_match_case_insensitively() {
        assert!(is_font_file("a.ttf"));
        assert!(is_font_file("dir/B.OTF"));
        assert!(is_font_file("c.TtF"));
        assert!(!is_font_file("d.woff"));
        assert!(!is_font_file("ttf"));
    }

    #[tokio::test]
    async fn batch_extracts_fetched_and_reports_failures() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CatalogStore::in_memory().unwrap());
        let good = zip_bytes(&[("a.ttf", "a")]);
        fetched_font(&store, dir.path(), "alpha", "Alpha", &good);
        fetched_font(&store, dir.path(), "beta", "Beta", &good);
        fetched_font(&store, dir.path(), "corrupt", "Corrupt", b"garbage");
        store
            .upsert(&FontEntry {
                id: "later".to_string(),
                name: "Later".to_string(),
                category: None,
                source_url: "https://fonts.test/later.font".to_string(),
                download_url: None,
            })
            .unwrap();

        let selection: Vec<_> = store
            .list(ListFilter::default())
            .map(|r| r.unwrap())
            .collect();
        let summary = extract_batch(
            store.clone(),
            selection,
            dir.path(),
            2,
            NoopReporter::shared(),
        )
        .await
        .unwrap();

        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.failures[0].0, "corrupt");

        let stats = store.stats().unwrap();
        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.not_fetched, 1);
    }
}
