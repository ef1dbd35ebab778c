// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, Category, UpsertOutcome};
use crate::error::SyncError;
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::remote::{FontStub, IndexReader};

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Fonts seen for the first time
    pub added: usize,
    /// Known fonts whose metadata changed
    pub updated: usize,
    /// Known fonts seen again with identical metadata
    pub unchanged: usize,
    /// Fonts newly flagged as no longer listed
    pub stale: usize,
    /// Items or pages that could not be read (id or category, message)
    pub errors: Vec<(String, String)>,
}

impl SyncReport {
    fn count(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Added => self.added += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Bring the catalog in line with the remote index for the given categories.
///
/// Fonts are upserted one by one, so an interrupted pass keeps whatever it
/// already merged. Download state is never changed here; fonts whose archive
/// is already on disk are refreshed from the listing alone, without a detail
/// request. A font whose detail page cannot be read is skipped and counted
/// as an error. A category whose listing was walked without error has its
/// unseen fonts flagged stale.
pub async fn sync_catalog<C: HttpClient>(
    store: &CatalogStore,
    reader: &IndexReader<C>,
    categories: &[Category],
    reporter: &SharedProgressReporter,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();

    for &category in categories {
        reporter.report(ProgressEvent::CategoryStarted { category });
        info!("Syncing category {}", category);

        let started = Utc::now();
        let mut complete = true;
        let mut scan = reader.scan_category(category);

        while let Some(page) = scan.next_page().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!("Listing of {} stopped: {}", category, e);
                    report.errors.push((category.key().to_string(), e.to_string()));
                    complete = false;
                    break;
                }
            };

            reporter.report(ProgressEvent::PageScanned {
                category,
                page: page.page,
                items: page.stubs.len(),
            });

            for stub in page.stubs {
                merge_stub(store, reader, stub, &mut report, reporter).await?;
            }
        }

        if complete {
            let stale = store.mark_stale(category, started)?;
            if stale > 0 {
                info!("{} font(s) in {} are no longer listed", stale, category);
            }
            report.stale += stale;
        }
    }

    reporter.report(ProgressEvent::SyncCompleted {
        added: report.added,
        updated: report.updated,
        unchanged: report.unchanged,
        stale: report.stale,
        errors: report.errors.len(),
    });

    Ok(report)
}

async fn merge_stub<C: HttpClient>(
    store: &CatalogStore,
    reader: &IndexReader<C>,
    stub: FontStub,
    report: &mut SyncReport,
    reporter: &SharedProgressReporter,
) -> Result<(), SyncError> {
    let existing = store.get(&stub.id)?;

    if existing
        .as_ref()
        .is_some_and(|r| r.download_state.is_retrieved())
    {
        debug!("{} already retrieved, refreshing from listing", stub.id);
        let outcome = store.upsert(&stub.into_entry(None))?;
        report.count(outcome);
        return Ok(());
    }

    match reader.fetch_detail(&stub).await {
        Ok(entry) => {
            let outcome = store.upsert(&entry)?;
            report.count(outcome);
        }
        Err(e) => {
            warn!("Skipping {}: {}", stub.id, e);
            reporter.report(ProgressEvent::ItemSkipped {
                id: stub.id.clone(),
                error: e.to_string(),
            });
            // Still listed, so it must not be flagged stale
            if existing.is_some() {
                store.touch_synced(&stub.id)?;
            }
            report.errors.push((stub.id, e.to_string()));
        }
    }

    Ok(())
}
