// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod parse;
mod reader;

pub use parse::{
    DetailPage, FontStub, parse_detail, parse_last_page, parse_listing, slug_from_download_url,
    slug_from_page_url, title_from_slug,
};
pub use reader::{CategoryScan, DEFAULT_MAX_PAGES, DEFAULT_SITE_URL, IndexReader, ListingPage};
