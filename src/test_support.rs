// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory font site and helpers shared by the unit tests.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::catalog::Category;
use crate::http::{ByteStream, HttpClient, HttpPage, HttpResponse};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Root of the mocked site
pub const SITE: &str = "https://fonts.test/";

#[derive(Clone)]
enum Archive {
    Bytes(Vec<u8>),
    Status(u16),
    /// Sends one chunk, then never finishes
    Stall(Vec<u8>),
}

#[derive(Default)]
struct SiteState {
    pages: Mutex<HashMap<String, (u16, String)>>,
    archives: Mutex<HashMap<String, Archive>>,
    hits: Mutex<HashMap<String, usize>>,
    page_requests: AtomicUsize,
    archive_requests: AtomicUsize,
}

/// A fake font site behind [`HttpClient`], with request counters
#[derive(Clone, Default)]
pub struct MockSite {
    state: Arc<SiteState>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, html: &str) {
        self.page_status(url, 200, html);
    }

    pub fn page_status(&self, url: &str, status: u16, html: &str) {
        self.state
            .pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, html.to_string()));
    }

    pub fn archive(&self, url: &str, bytes: &[u8]) {
        self.set_archive(url, Archive::Bytes(bytes.to_vec()));
    }

    pub fn archive_status(&self, url: &str, status: u16) {
        self.set_archive(url, Archive::Status(status));
    }

    pub fn archive_stalled(&self, url: &str, first_chunk: &[u8]) {
        self.set_archive(url, Archive::Stall(first_chunk.to_vec()));
    }

    fn set_archive(&self, url: &str, archive: Archive) {
        self.state
            .archives
            .lock()
            .unwrap()
            .insert(url.to_string(), archive);
    }

    /// Serve a category as the given pages of `(slug, name)` pairs
    pub fn listing(&self, category: Category, pages: &[Vec<(&str, &str)>]) {
        let last = pages.len() as u32;
        for (index, fonts) in pages.iter().enumerate() {
            let page = index as u32 + 1;
            self.page(
                &listing_url(category, page),
                &listing_page(category, fonts, last),
            );
        }
    }

    /// Serve a detail page and the archive it links to
    pub fn font(&self, slug: &str, name: &str, category: Category, archive: &[u8]) {
        self.page(&format!("{SITE}{slug}.font"), &detail_page(name, slug, category));
        self.archive(&download_url(slug), archive);
    }

    pub fn page_requests(&self) -> usize {
        self.state.page_requests.load(Ordering::SeqCst)
    }

    pub fn archive_requests(&self) -> usize {
        self.state.archive_requests.load(Ordering::SeqCst)
    }

    pub fn hits(&self, url: &str) -> usize {
        self.state.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn count(&self, url: &str) {
        *self
            .state
            .hits
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
    }
}

#[async_trait]
impl HttpClient for MockSite {
    async fn get_page(&self, url: &str) -> Result<HttpPage, reqwest::Error> {
        self.state.page_requests.fetch_add(1, Ordering::SeqCst);
        self.count(url);

        let (status, body) = self
            .state
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, "not found".to_string()));

        Ok(HttpPage {
            status,
            final_url: url.to_string(),
            body,
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        self.state.archive_requests.fetch_add(1, Ordering::SeqCst);
        self.count(url);

        let archive = self
            .state
            .archives
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Archive::Status(404));

        let (status, content_length, body): (u16, Option<u64>, ByteStream) = match archive {
            Archive::Bytes(data) => {
                let len = data.len() as u64;
                // Two chunks so progress is reported mid-stream
                let split = data.len() / 2;
                let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
                    Ok(Bytes::copy_from_slice(&data[..split])),
                    Ok(Bytes::copy_from_slice(&data[split..])),
                ];
                (200, Some(len), Box::pin(futures::stream::iter(chunks)))
            }
            Archive::Status(status) => (
                status,
                None,
                Box::pin(futures::stream::empty::<Result<Bytes, reqwest::Error>>()),
            ),
            Archive::Stall(first) => {
                let head = futures::stream::once(async move {
                    Ok::<Bytes, reqwest::Error>(Bytes::from(first))
                });
                let tail = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
                (
                    200,
                    None,
                    Box::pin(futures::StreamExt::chain(head, tail)),
                )
            }
        };

        Ok(HttpResponse {
            status,
            content_length,
            final_url: url.to_string(),
            body,
        })
    }
}

pub fn listing_url(category: Category, page: u32) -> String {
    format!("{SITE}mtheme.php?id={}&page={}", category.theme_id(), page)
}

/// The site's archive link for a page slug; dashes become underscores
pub fn download_url(slug: &str) -> String {
    format!("{SITE}dl/?f={}", slug.replace('-', "_"))
}

/// Listing markup with one row per font and links up to `last_page`
pub fn listing_page(category: Category, fonts: &[(&str, &str)], last_page: u32) -> String {
    let rows: String = fonts
        .iter()
        .map(|(slug, name)| {
            format!(
                r#"<div class="lv1left dfbg"><a href="{slug}.font"><strong>{name}</strong></a> by <a href="author.php?a=x">X</a></div>
<div class="preview"><a href="{slug}.font"><img src="img/{slug}.png"></a></div>
"#
            )
        })
        .collect();

    let pages: String = (1..=last_page)
        .map(|p| {
            format!(
                r#"<a href="mtheme.php?id={}&amp;page={p}">{p}</a> "#,
                category.theme_id()
            )
        })
        .collect();

    format!("<html><body>{rows}<div class=\"noindex\">{pages}</div></body></html>")
}

pub fn detail_page(name: &str, slug: &str, category: Category) -> String {
    format!(
        r#"<html><body>
<div><a href="mtheme.php?id={}">{}</a></div>
<h1>{name}</h1>
<a class="dl" href="dl/?f={}">Download</a>
</body></html>"#,
        category.theme_id(),
        category,
        slug.replace('-', "_")
    )
}

/// Build a zip archive in memory
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

/// Keeps every reported event for later assertions
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingReporter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for CollectingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
