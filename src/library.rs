// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{
    CatalogStats, CatalogStore, Category, DownloadState, FontEntry, FontRecord, ListFilter,
};
use crate::config::{AppPaths, Config};
use crate::download::{BatchOptions, BatchSummary, run_batch};
use crate::error::{BatchError, OpenError, StoreError, SyncError};
use crate::extract::{ExtractSummary, extract_batch};
use crate::http::{HttpClient, ReqwestClient};
use crate::progress::SharedProgressReporter;
use crate::remote::IndexReader;
use crate::sync::{SyncReport, sync_catalog};

/// Which catalog records a batch operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every record not yet extracted that matches the filter
    Pending(ListFilter),
    /// Exactly these ids; unknown ids reject the whole selection
    Ids(Vec<String>),
}

/// Outcome of fetching a single font by link
#[derive(Debug, Clone)]
pub struct DirectDownload {
    /// The record after the fetch attempt
    pub record: FontRecord,
    pub summary: BatchSummary,
}

/// The user-facing operations over one catalog, index and download tree
pub struct FontLibrary<C = ReqwestClient> {
    store: Arc<CatalogStore>,
    reader: IndexReader<C>,
    config: Config,
    download_root: PathBuf,
}

impl FontLibrary<ReqwestClient> {
    /// Open the catalog under `paths` and set up the site client
    pub fn open(paths: &AppPaths, config: Config) -> Result<Self, OpenError> {
        paths.ensure_dirs()?;

        let client = ReqwestClient::from_settings(&config.http_settings())?;
        let reader = IndexReader::new(client, config.site_url()?).with_max_pages(config.max_pages);
        let store = CatalogStore::open(&paths.catalog_path())?;
        let download_root = config.download_root(paths);

        Ok(Self::with_parts(store, reader, config, download_root))
    }
}

impl<C: HttpClient + Clone + 'static> FontLibrary<C> {
    /// Assemble a library from already-built parts
    pub fn with_parts(
        store: CatalogStore,
        reader: IndexReader<C>,
        config: Config,
        download_root: PathBuf,
    ) -> Self {
        Self {
            store: Arc::new(store),
            reader,
            config,
            download_root,
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Reconcile the catalog with the given categories (all when empty)
    pub async fn sync(
        &self,
        categories: &[Category],
        reporter: &SharedProgressReporter,
    ) -> Result<SyncReport, SyncError> {
        let categories = if categories.is_empty() {
            self.reader.list_categories()
        } else {
            categories
        };
        sync_catalog(&self.store, &self.reader, categories, reporter).await
    }

    /// Case-insensitive search on name and id
    pub fn search(
        &self,
        query: &str,
        category: Option<Category>,
    ) -> Result<Vec<FontRecord>, StoreError> {
        self.store.search(query, category)
    }

    /// Every record filed under the bucket of `letter`, `#` for names not
    /// starting with an ASCII letter
    pub fn browse(
        &self,
        letter: char,
        category: Option<Category>,
    ) -> Result<Vec<FontRecord>, StoreError> {
        let filter = ListFilter {
            category,
            ..ListFilter::default()
        }
        .with_initial(letter);
        self.store.list(filter).collect()
    }

    /// Turn a selection into catalog records
    pub fn resolve_selection(&self, selection: &Selection) -> Result<Vec<FontRecord>, BatchError> {
        match selection {
            Selection::Pending(filter) => Ok(self
                .store
                .list_pending(filter.clone())
                .collect::<Result<Vec<_>, _>>()?),
            Selection::Ids(ids) => {
                let mut records = Vec::with_capacity(ids.len());
                let mut unknown = Vec::new();
                for id in ids {
                    match self.store.get(id)? {
                        Some(record) => records.push(record),
                        None => unknown.push(id.clone()),
                    }
                }
                if !unknown.is_empty() {
                    return Err(BatchError::InvalidSelection(unknown));
                }
                Ok(records)
            }
        }
    }

    /// Fetch the archives of the selected records
    pub async fn download(
        &self,
        selection: &Selection,
        concurrency: usize,
        cancel: &CancellationToken,
        reporter: SharedProgressReporter,
    ) -> Result<BatchSummary, BatchError> {
        let records = self.resolve_selection(selection)?;
        let options = BatchOptions {
            concurrency,
            dest_root: self.download_root.clone(),
        };
        run_batch(
            Arc::clone(&self.store),
            &self.reader,
            records,
            &options,
            cancel,
            reporter,
        )
        .await
    }

    /// Unpack the fonts of the selected fetched records
    pub async fn extract(
        &self,
        selection: &Selection,
        reporter: SharedProgressReporter,
    ) -> Result<ExtractSummary, BatchError> {
        let records = self.resolve_selection(selection)?;
        extract_batch(
            Arc::clone(&self.store),
            records,
            &self.download_root,
            self.config.extract_concurrency,
            reporter,
        )
        .await
    }

    /// Add a font from a pasted link and fetch it right away.
    ///
    /// The font's page is consulted for its name, category and archive link.
    /// When the page cannot be read, a download link is still usable on its
    /// own. An explicitly requested font that had failed before is retried.
    pub async fn download_by_direct_link(
        &self,
        link: &str,
        cancel: &CancellationToken,
        reporter: SharedProgressReporter,
    ) -> Result<DirectDownload, BatchError> {
        let normalized = self.reader.normalize_link(link)?;
        let known = match normalized.download_url.as_deref() {
            Some(url) => self.store.find_by_download_url(url)?,
            None => None,
        };
        let known = match known {
            Some(record) => Some(record),
            None => self.store.get(&normalized.id)?,
        };

        let entry = match known {
            // Keep catalog naming so later syncs see no change
            Some(record) => FontEntry {
                id: record.id,
                name: record.name,
                category: record.category.or(normalized.category),
                source_url: record.source_url,
                download_url: normalized.download_url.or(record.download_url),
            },
            None => self.enrich_entry(normalized).await?,
        };
        self.store.upsert(&entry)?;

        if let Some(record) = self.store.get(&entry.id)?
            && record.download_state == DownloadState::Failed
        {
            info!("Retrying previously failed {}", record.id);
            self.store.retry_failed(&record.id)?;
        }

        let summary = self
            .download(&Selection::Ids(vec![entry.id.clone()]), 1, cancel, reporter)
            .await?;

        let record = self
            .store
            .get(&entry.id)?
            .ok_or_else(|| StoreError::UnknownRecord(entry.id.clone()))?;

        Ok(DirectDownload { record, summary })
    }

    async fn enrich_entry(&self, entry: FontEntry) -> Result<FontEntry, BatchError> {
        match self.reader.fetch_detail_page(&entry.source_url).await {
            Ok(detail) => Ok(FontEntry {
                name: detail.name.unwrap_or(entry.name),
                category: detail.category.or(entry.category),
                download_url: entry
                    .download_url
                    .or_else(|| detail.download_url.map(|u| u.to_string())),
                ..entry
            }),
            Err(e) if entry.download_url.is_some() => {
                warn!("Could not read page for {}: {}", entry.id, e);
                Ok(entry)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return failed records to NotFetched (all failed ones when `ids` is empty).
    ///
    /// Ids that are known but not failed are left alone.
    pub fn retry_failed(&self, ids: &[String]) -> Result<usize, BatchError> {
        if ids.is_empty() {
            return Ok(self.store.retry_all_failed()?);
        }

        let records = self.resolve_selection(&Selection::Ids(ids.to_vec()))?;
        let mut retried = 0;
        for record in records {
            match self.store.retry_failed(&record.id) {
                Ok(()) => retried += 1,
                Err(e) if !e.is_fatal() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(retried)
    }

    pub fn stats(&self) -> Result<CatalogStats, StoreError> {
        self.store.stats()
    }

    /// Close the catalog
    pub fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.store) {
            Ok(store) => store.close(),
            // Still shared by a running task; it closes when the last user drops it
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;
    use url::Url;

    use crate::progress::NoopReporter;
    use crate::test_support::{MockSite, SITE, download_url, zip_bytes};

    fn library(site: &MockSite, root: &Path) -> FontLibrary<MockSite> {
        FontLibrary::with_parts(
            CatalogStore::in_memory().unwrap(),
            IndexReader::new(site.clone(), Url::parse(SITE).unwrap()),
            Config::default(),
            root.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn sync_download_extract_end_to_end() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        site.listing(
            Category::Script,
            &[vec![("zorro", "Zorro"), ("99-stars", "99 Stars")]],
        );
        let archive = zip_bytes(&[("Zorro.ttf", "ttf"), ("license.txt", "free")]);
        site.font("zorro", "Zorro", Category::Script, &archive);
        site.font("99-stars", "99 Stars", Category::Script, &archive);
        let library = library(&site, dir.path());
        let reporter = NoopReporter::shared();

        let report = library.sync(&[Category::Script], &reporter).await.unwrap();
        assert_eq!(report.added, 2);

        let found = library.search("zor", None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "zorro");

        let summary = library
            .download(
                &Selection::Pending(ListFilter::default()),
                4,
                &CancellationToken::new(),
                reporter.clone(),
            )
            .await
            .unwrap();
        assert_eq!(summary.fetched, 2);
        assert!(dir.path().join("Z").join("Zorro.zip").is_file());
        assert!(dir.path().join("misc").join("99 Stars.zip").is_file());

        let extracted = library
            .extract(&Selection::Pending(ListFilter::default()), reporter)
            .await
            .unwrap();
        assert_eq!(extracted.extracted, 2);
        assert!(dir.path().join("Z").join("Zorro").join("Zorro.ttf").is_file());

        let stats = library.stats().unwrap();
        assert_eq!(stats.extracted, 2);
        library.close().unwrap();
    }

    #[tokio::test]
    async fn unknown_ids_reject_selection() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        let library = library(&site, dir.path());

        let result = library
            .download(
                &Selection::Ids(vec!["nope".to_string()]),
                2,
                &CancellationToken::new(),
                NoopReporter::shared(),
            )
            .await;

        match result {
            Err(BatchError::InvalidSelection(ids)) => assert_eq!(ids, vec!["nope"]),
            other => panic!("Expected InvalidSelection, got {other:?}"),
        }
        assert_eq!(site.archive_requests(), 0);
    }

    #[tokio::test]
    async fn direct_link_adds_and_fetches_font() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        site.font("old-english", "Old English Text", Category::Gothic, b"zip");
        let library = library(&site, dir.path());

        let result = library
            .download_by_direct_link(
                "https://www.dafont.com/old-english.font",
                &CancellationToken::new(),
                NoopReporter::shared(),
            )
            .await
            .unwrap();

        assert_eq!(result.summary.fetched, 1);
        assert_eq!(result.record.name, "Old English Text");
        assert_eq!(result.record.category, Some(Category::Gothic));
        assert_eq!(result.record.download_state, DownloadState::Fetched);
        assert_eq!(
            result.record.download_url.as_deref(),
            Some(download_url("old-english").as_str())
        );
    }

    #[tokio::test]
    async fn download_link_reuses_synced_record() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        site.listing(Category::Gothic, &[vec![("old-english", "Old English")]]);
        site.font("old-english", "Old English", Category::Gothic, b"zip");
        let library = library(&site, dir.path());
        library
            .sync(&[Category::Gothic], &NoopReporter::shared())
            .await
            .unwrap();

        // The site spells the archive link with an underscore
        let link = download_url("old-english");
        assert!(link.ends_with("dl/?f=old_english"));
        let result = library
            .download_by_direct_link(&link, &CancellationToken::new(), NoopReporter::shared())
            .await
            .unwrap();

        assert_eq!(result.record.id, "old-english");
        assert_eq!(result.record.download_state, DownloadState::Fetched);
        let stats = library.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.fetched, 1);
    }

    #[tokio::test]
    async fn download_link_before_sync_merges_with_later_listing() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        site.listing(Category::Gothic, &[vec![("old-english", "Old English")]]);
        site.font("old-english", "Old English", Category::Gothic, b"zip");
        let library = library(&site, dir.path());

        library
            .download_by_direct_link(
                &download_url("old-english"),
                &CancellationToken::new(),
                NoopReporter::shared(),
            )
            .await
            .unwrap();
        library
            .sync(&[Category::Gothic], &NoopReporter::shared())
            .await
            .unwrap();

        let stats = library.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.fetched, 1);
    }

    #[tokio::test]
    async fn browse_lists_one_initial() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        site.listing(
            Category::Script,
            &[vec![("zorro", "Zorro"), ("zebra", "Zebra"), ("99-stars", "99 Stars")]],
        );
        for (slug, name) in [("zorro", "Zorro"), ("zebra", "Zebra"), ("99-stars", "99 Stars")] {
            site.font(slug, name, Category::Script, b"zip");
        }
        let library = library(&site, dir.path());
        library
            .sync(&[Category::Script], &NoopReporter::shared())
            .await
            .unwrap();

        let mut z: Vec<_> = library
            .browse('z', None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        z.sort();
        assert_eq!(z, vec!["zebra", "zorro"]);

        let other = library.browse('#', None).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].id, "99-stars");
        assert!(library.browse('z', Some(Category::Basic)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_download_link_works_without_page() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        let link = format!("{SITE}dl/?f=ghost");
        site.archive(&link, b"zip");
        let library = library(&site, dir.path());

        let result = library
            .download_by_direct_link(&link, &CancellationToken::new(), NoopReporter::shared())
            .await
            .unwrap();

        assert_eq!(result.record.id, "ghost");
        assert_eq!(result.record.name, "Ghost");
        assert!(result.record.category.is_none());
        assert_eq!(result.record.download_state, DownloadState::Fetched);
    }

    #[tokio::test]
    async fn unrecognized_link_is_rejected() {
        let dir = tempdir().unwrap();
        let library = library(&MockSite::new(), dir.path());

        let result = library
            .download_by_direct_link(
                "https://example.com/fonts.zip",
                &CancellationToken::new(),
                NoopReporter::shared(),
            )
            .await;

        assert!(matches!(result, Err(BatchError::Index(_))));
    }

    #[tokio::test]
    async fn retry_failed_only_touches_failed_records() {
        let dir = tempdir().unwrap();
        let site = MockSite::new();
        let library = library(&site, dir.path());
        for id in ["a", "b"] {
            library
                .store()
                .upsert(&FontEntry {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    category: None,
                    source_url: format!("{SITE}{id}.font"),
                    download_url: Some(download_url(id)),
                })
                .unwrap();
        }
        library.store().mark_failed("a", "HTTP error 500").unwrap();

        let retried = library
            .retry_failed(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(retried, 1);
        assert_eq!(library.stats().unwrap().not_fetched, 2);

        assert!(matches!(
            library.retry_failed(&["zzz".to_string()]),
            Err(BatchError::InvalidSelection(_))
        ));
    }
}
