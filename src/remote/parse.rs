// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Markup shape of the font site.
//!
//! Everything that knows what the site's HTML looks like lives here. The
//! rest of the crate only sees [`FontStub`] and [`DetailPage`].

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::catalog::{Category, FontEntry};

/// A font as seen on a listing page, before its detail page is resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontStub {
    pub id: String,
    pub name: String,
    pub category: Option<Category>,
    pub page_url: String,
}

impl FontStub {
    /// Turn the stub into catalog metadata, with an optional resolved link
    pub fn into_entry(self, download_url: Option<String>) -> FontEntry {
        FontEntry {
            id: self.id,
            name: self.name,
            category: self.category,
            source_url: self.page_url,
            download_url,
        }
    }
}

/// Fields read from a font's detail page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailPage {
    pub name: Option<String>,
    pub download_url: Option<Url>,
    pub category: Option<Category>,
}

/// Slug of a `.../<slug>.font` page link
pub fn slug_from_page_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let stem = last.strip_suffix(".font")?;
    Some(clean_slug(stem)).filter(|s| !s.is_empty())
}

/// Slug carried by a `.../dl/?f=<slug>` download link
pub fn slug_from_download_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "f")
        .map(|(_, value)| clean_slug(&value))
        .filter(|s| !s.is_empty())
}

/// Display name derived from a slug when the page offers none
pub fn title_from_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn clean_slug(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect()
}

/// Collect the fonts listed on one category page, in page order
pub fn parse_listing(html: &str, page_url: &Url, category: Category) -> Vec<FontStub> {
    let document = Html::parse_document(html);

    // Font rows carry their name link inside `lv1left`; fall back to every
    // anchor when the layout does not use that class.
    let mut anchors = select_all(&document, "div.lv1left a[href]");
    if !anchors.iter().any(|a| font_link(a, page_url).is_some()) {
        anchors = select_all(&document, "a[href]");
    }

    let mut stubs: Vec<FontStub> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for anchor in anchors {
        let Some((slug, url)) = font_link(&anchor, page_url) else {
            continue;
        };
        let text = element_text(&anchor);

        match positions.get(&slug) {
            Some(&pos) => {
                // First link may be a preview image; keep the first real text
                if stubs[pos].name == title_from_slug(&slug) && !text.is_empty() {
                    stubs[pos].name = text;
                }
            }
            None => {
                positions.insert(slug.clone(), stubs.len());
                let name = if text.is_empty() {
                    title_from_slug(&slug)
                } else {
                    text
                };
                stubs.push(FontStub {
                    id: slug,
                    name,
                    category: Some(category),
                    page_url: url.to_string(),
                });
            }
        }
    }

    stubs
}

/// Highest `page=N` advertised by the pagination links (1 if none)
pub fn parse_last_page(html: &str, page_url: &Url) -> u32 {
    let document = Html::parse_document(html);

    select_all(&document, "a[href]")
        .iter()
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains("page="))
        .filter_map(|href| page_url.join(href).ok())
        .filter_map(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "page")
                .and_then(|(_, value)| value.parse::<u32>().ok())
        })
        .max()
        .unwrap_or(1)
}

/// Read name, archive link and category from a font detail page
pub fn parse_detail(html: &str, page_url: &Url) -> DetailPage {
    let document = Html::parse_document(html);

    let name = select_all(&document, "h1")
        .first()
        .map(element_text)
        .filter(|s| !s.is_empty());

    let download_url = select_all(&document, "a.dl[href]")
        .into_iter()
        .chain(select_all(&document, "a[href*=\"/dl/?f=\"]"))
        .filter_map(|a| a.value().attr("href").map(str::to_string))
        .find_map(|href| page_url.join(&href).ok());

    let category = select_all(&document, "a[href*=\"mtheme.php\"]")
        .iter()
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| page_url.join(href).ok())
        .find_map(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "id")
                .and_then(|(_, value)| value.parse::<u32>().ok())
                .and_then(Category::from_theme_id)
        });

    DetailPage {
        name,
        download_url,
        category,
    }
}

fn select_all<'a>(document: &'a Html, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(selector) => document.select(&selector).collect(),
        Err(_) => Vec::new(),
    }
}

fn font_link(anchor: &ElementRef<'_>, page_url: &Url) -> Option<(String, Url)> {
    let href = anchor.value().attr("href")?;
    if !href.contains(".font") {
        return None;
    }
    let url = page_url.join(href.trim()).ok()?;
    let slug = slug_from_page_url(&url)?;
    Some((slug, url))
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    const LISTING: &str = r#"
<html><body>
  <div class="lv1left dfbg"><a href="zorro.font"><strong>Zorro</strong></a> by <a href="author.d1">Someone</a></div>
  <a href="zorro.font"><div class="preview"></div></a>
  <div class="lv1left dfbg"><a href="/99-stars.font"><strong>99 Stars</strong></a></div>
  <div class="lv1left dfbg"><a href="https://www.dafont.com/old-english.font"></a></div>
  <div class="noindex">
    <a href="mtheme.php?id=5&amp;page=2">2</a>
    <a href="mtheme.php?id=5&amp;page=7">7</a>
    <a href="mtheme.php?id=5&amp;page=2">Next</a>
  </div>
</body></html>"#;

    #[test]
    fn listing_yields_unique_fonts_in_page_order() {
        let page = url("https://www.dafont.com/mtheme.php?id=5&page=1");
        let stubs = parse_listing(LISTING, &page, Category::Basic);

        let ids: Vec<_> = stubs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["zorro", "99-stars", "old-english"]);
        assert_eq!(stubs[0].name, "Zorro");
        assert_eq!(stubs[0].page_url, "https://www.dafont.com/zorro.font");
        assert_eq!(stubs[0].category, Some(Category::Basic));
        assert_eq!(stubs[1].name, "99 Stars");
    }

    #[test]
    fn listing_falls_back_to_slug_title_without_link_text() {
        let page = url("https://www.dafont.com/mtheme.php?id=5");
        let stubs = parse_listing(LISTING, &page, Category::Basic);
        assert_eq!(stubs[2].name, "Old English");
    }

    #[test]
    fn listing_without_row_markup_uses_all_font_links() {
        let html = r#"<ul><li><a href="/alpha.font">Alpha</a></li><li><a href="/beta.font">Beta</a></li></ul>"#;
        let stubs = parse_listing(html, &url("https://example.com/"), Category::Script);
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[1].name, "Beta");
    }

    #[test]
    fn last_page_is_highest_page_link() {
        let page = url("https://www.dafont.com/mtheme.php?id=5");
        assert_eq!(parse_last_page(LISTING, &page), 7);
        assert_eq!(parse_last_page("<p>no pages</p>", &page), 1);
    }

    #[test]
    fn detail_page_yields_name_link_and_category() {
        let html = r#"
<html><body>
  <div><a href="mtheme.php?id=4">Gothic</a> &gt; <a href="theme.php?cat=401">Medieval</a></div>
  <h1>Old  English</h1>
  <a class="dl" href="//dl.dafont.com/dl/?f=old_english">Download</a>
</body></html>"#;
        let detail = parse_detail(html, &url("https://www.dafont.com/old-english.font"));

        assert_eq!(detail.name.as_deref(), Some("Old English"));
        assert_eq!(
            detail.download_url.unwrap().as_str(),
            "https://dl.dafont.com/dl/?f=old_english"
        );
        assert_eq!(detail.category, Some(Category::Gothic));
    }

    #[test]
    fn detail_page_without_download_anchor() {
        let detail = parse_detail("<h1>Nothing</h1>", &url("https://www.dafont.com/x.font"));
        assert_eq!(detail.name.as_deref(), Some("Nothing"));
        assert!(detail.download_url.is_none());
        assert!(detail.category.is_none());
    }

    #[test]
    fn slugs_are_normalized() {
        assert_eq!(
            slug_from_page_url(&url("https://www.dafont.com/pt/Sakuna.font")).as_deref(),
            Some("sakuna")
        );
        assert_eq!(
            slug_from_page_url(&url("https://www.dafont.com/pt/")),
            None
        );
        assert_eq!(
            slug_from_download_url(&url("https://dl.dafont.com/dl/?f=old_english")).as_deref(),
            Some("old_english")
        );
        assert_eq!(slug_from_download_url(&url("https://dl.dafont.com/dl/")), None);
    }

    #[test]
    fn title_from_slug_capitalizes_words() {
        assert_eq!(title_from_slug("old-english_text"), "Old English Text");
        assert_eq!(title_from_slug("99stars"), "99stars");
    }
}
