// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use tracing::{debug, warn};
use url::Url;

use super::parse::{
    DetailPage, FontStub, parse_detail, parse_last_page, parse_listing, slug_from_download_url,
    slug_from_page_url, title_from_slug,
};
use crate::catalog::{Category, FontEntry};
use crate::error::IndexError;
use crate::http::{HttpClient, HttpPage};

/// Default site root
pub const DEFAULT_SITE_URL: &str = "https://www.dafont.com/";

/// Default cap on listing pages per category
pub const DEFAULT_MAX_PAGES: u32 = 2000;

/// One listing page of a category
#[derive(Debug, Clone)]
pub struct ListingPage {
    pub category: Category,
    pub page: u32,
    pub stubs: Vec<FontStub>,
    /// The pagination advertises a later page
    pub has_more: bool,
}

/// Reads the remote font index through an [`HttpClient`]
///
/// Produces data only; it never touches the catalog.
#[derive(Clone)]
pub struct IndexReader<C> {
    client: C,
    base_url: Url,
    max_pages: u32,
}

impl<C: HttpClient> IndexReader<C> {
    pub fn new(client: C, base_url: Url) -> Self {
        Self {
            client,
            base_url,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Stop a category walk after this many pages
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The site's categories are fixed
    pub fn list_categories(&self) -> &'static [Category] {
        &Category::ALL
    }

    pub fn category_page_url(&self, category: Category, page: u32) -> Result<Url, IndexError> {
        Ok(self.base_url.join(&format!(
            "mtheme.php?id={}&page={}",
            category.theme_id(),
            page
        ))?)
    }

    /// Fetch and parse one listing page
    pub async fn list_items(
        &self,
        category: Category,
        page: u32,
    ) -> Result<ListingPage, IndexError> {
        let url = self.category_page_url(category, page)?;
        let html = self.fetch_html(url.as_str()).await?;
        let page_url = Url::parse(&html.final_url).unwrap_or(url);

        let stubs = parse_listing(&html.body, &page_url, category);
        let has_more = parse_last_page(&html.body, &page_url) > page;

        Ok(ListingPage {
            category,
            page,
            stubs,
            has_more,
        })
    }

    /// Walk a category page by page
    pub fn scan_category(&self, category: Category) -> CategoryScan<'_, C> {
        CategoryScan {
            reader: self,
            category,
            next_page: 1,
            previous_ids: None,
            done: false,
        }
    }

    /// Fetch a detail page and read its fields
    pub async fn fetch_detail_page(&self, page_url: &str) -> Result<DetailPage, IndexError> {
        let html = self.fetch_html(page_url).await?;
        let url = Url::parse(&html.final_url).or_else(|_| Url::parse(page_url))?;
        Ok(parse_detail(&html.body, &url))
    }

    /// Resolve a listed font into catalog metadata with its archive link.
    ///
    /// The listing name is kept so metadata does not flip between passes that
    /// do and do not visit the detail page.
    pub async fn fetch_detail(&self, stub: &FontStub) -> Result<FontEntry, IndexError> {
        let detail = self.fetch_detail_page(&stub.page_url).await?;

        let download_url = detail.download_url.ok_or_else(|| IndexError::Parse {
            url: stub.page_url.clone(),
            reason: "no download link on page".to_string(),
        })?;

        let mut entry = stub.clone().into_entry(Some(download_url.to_string()));
        entry.category = entry.category.or(detail.category);
        Ok(entry)
    }

    /// Turn a stored link into the URL the archive is fetched from.
    ///
    /// Detail page links take one extra hop through the page's download
    /// anchor. Anything else is returned untouched; HTTP redirects are
    /// followed by the client during the archive fetch itself.
    pub async fn resolve_final_url(&self, link: &str) -> Result<String, IndexError> {
        let url = Url::parse(link)?;
        if slug_from_page_url(&url).is_none() {
            return Ok(link.to_string());
        }

        debug!("Resolving archive link through {}", link);
        let detail = self.fetch_detail_page(link).await?;
        detail
            .download_url
            .map(|u| u.to_string())
            .ok_or_else(|| IndexError::Parse {
                url: link.to_string(),
                reason: "no download link on page".to_string(),
            })
    }

    /// Recognize a pasted link without touching the network.
    ///
    /// Accepts a detail page (`…/<slug>.font`) or a download link
    /// (`…/dl/?f=<slug>`). A download link is kept as the archive link.
    /// Download slugs spell dashes as underscores, so they are mapped back
    /// to the page slug the catalog uses as id.
    pub fn normalize_link(&self, link: &str) -> Result<FontEntry, IndexError> {
        let url = Url::parse(link.trim())?;

        let (slug, download_url) = if let Some(slug) = slug_from_download_url(&url) {
            (slug.replace('_', "-"), Some(url.to_string()))
        } else if let Some(slug) = slug_from_page_url(&url) {
            (slug, None)
        } else {
            return Err(IndexError::UnrecognizedLink(link.to_string()));
        };

        let source_url = self.base_url.join(&format!("{slug}.font"))?;

        Ok(FontEntry {
            name: title_from_slug(&slug),
            id: slug,
            category: None,
            source_url: source_url.to_string(),
            download_url,
        })
    }

    async fn fetch_html(&self, url: &str) -> Result<HttpPage, IndexError> {
        let page = self
            .client
            .get_page(url)
            .await
            .map_err(|e| IndexError::Network {
                url: url.to_string(),
                source: e,
            })?;

        if page.status >= 400 {
            return Err(IndexError::HttpStatus {
                url: url.to_string(),
                status: page.status,
            });
        }

        Ok(page)
    }
}

/// Page-by-page walk of one category.
///
/// The walk ends when the pagination stops advertising more pages, when a
/// page comes back empty, when a page repeats the previous one, or at the
/// page cap. The last three guard against site anomalies looping forever.
pub struct CategoryScan<'a, C> {
    reader: &'a IndexReader<C>,
    category: Category,
    next_page: u32,
    previous_ids: Option<Vec<String>>,
    done: bool,
}

impl<C: HttpClient> CategoryScan<'_, C> {
    pub fn category(&self) -> Category {
        self.category
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    ///
    /// An error ends the walk.
    pub async fn next_page(&mut self) -> Option<Result<ListingPage, IndexError>> {
        if self.done {
            return None;
        }

        if self.next_page > self.reader.max_pages {
            warn!(
                "Stopping {} after {} pages (page cap)",
                self.category, self.reader.max_pages
            );
            self.done = true;
            return None;
        }

        let page = match self.reader.list_items(self.category, self.next_page).await {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if page.stubs.is_empty() {
            debug!("{} page {} is empty, end of listing", self.category, page.page);
            self.done = true;
            return None;
        }

        let ids: Vec<String> = page.stubs.iter().map(|s| s.id.clone()).collect();
        if self.previous_ids.as_ref() == Some(&ids) {
            warn!(
                "{} page {} repeats the previous page, end of listing",
                self.category, page.page
            );
            self.done = true;
            return None;
        }

        self.previous_ids = Some(ids);
        self.next_page += 1;
        if !page.has_more {
            self.done = true;
        }

        Some(Ok(page))
    }
}
