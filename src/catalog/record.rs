// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::download::bucket_for;

/// Site categories ("themes") a font can be listed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Fantasy,
    Foreign,
    Techno,
    Gothic,
    Basic,
    Script,
    Dingbats,
    Holiday,
}

impl Category {
    /// Every category the site lists, in theme order
    pub const ALL: [Category; 8] = [
        Category::Fantasy,
        Category::Foreign,
        Category::Techno,
        Category::Gothic,
        Category::Basic,
        Category::Script,
        Category::Dingbats,
        Category::Holiday,
    ];

    /// Stable key used in the catalog and on the command line
    pub fn key(&self) -> &'static str {
        match self {
            Category::Fantasy => "fantasy",
            Category::Foreign => "foreign",
            Category::Techno => "techno",
            Category::Gothic => "gothic",
            Category::Basic => "basic",
            Category::Script => "script",
            Category::Dingbats => "dingbats",
            Category::Holiday => "holiday",
        }
    }

    /// Theme id the site uses in `mtheme.php?id=N`
    pub fn theme_id(&self) -> u32 {
        match self {
            Category::Fantasy => 1,
            Category::Foreign => 2,
            Category::Techno => 3,
            Category::Gothic => 4,
            Category::Basic => 5,
            Category::Script => 6,
            Category::Dingbats => 7,
            Category::Holiday => 8,
        }
    }

    pub fn from_theme_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.theme_id() == id)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.key() == wanted)
            .ok_or_else(|| {
                let keys: Vec<_> = Self::ALL.iter().map(|c| c.key()).collect();
                format!("unknown category '{s}' (expected one of: {})", keys.join(", "))
            })
    }
}

/// Retrieval lifecycle of a catalog record
///
/// NotFetched -> Fetched -> Extracted, with Failed as a side exit that only
/// an explicit retry returns to NotFetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotFetched,
    Fetched,
    Extracted,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::NotFetched => "not_fetched",
            DownloadState::Fetched => "fetched",
            DownloadState::Extracted => "extracted",
            DownloadState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_fetched" => Some(DownloadState::NotFetched),
            "fetched" => Some(DownloadState::Fetched),
            "extracted" => Some(DownloadState::Extracted),
            "failed" => Some(DownloadState::Failed),
            _ => None,
        }
    }

    /// The archive is on disk (Fetched or Extracted)
    pub fn is_retrieved(&self) -> bool {
        matches!(self, DownloadState::Fetched | DownloadState::Extracted)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable catalog entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FontRecord {
    /// Slug taken from the font's page URL; unique in the catalog
    pub id: String,
    pub name: String,
    pub category: Option<Category>,
    /// Detail page of the font
    pub source_url: String,
    /// Archive link resolved from the detail page, once known
    pub download_url: Option<String>,
    pub download_state: DownloadState,
    pub local_archive_path: Option<PathBuf>,
    pub archive_sha256: Option<String>,
    pub last_error: Option<String>,
    /// No longer seen on the remote listing
    pub stale: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Metadata observed on the remote site, as handed to `CatalogStore::upsert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontEntry {
    pub id: String,
    pub name: String,
    pub category: Option<Category>,
    pub source_url: String,
    /// `None` leaves any previously resolved link untouched
    pub download_url: Option<String>,
}

/// What `upsert` did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Filter for catalog listings and searches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Case-insensitive substring of the name or id
    pub query: Option<String>,
    pub category: Option<Category>,
    pub state: Option<DownloadState>,
    /// Alphabetical bucket ("A".."Z" or the fallback bucket)
    pub bucket: Option<String>,
}

impl ListFilter {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_state(mut self, state: DownloadState) -> Self {
        self.state = Some(state);
        self
    }

    /// Only names filed under `letter`; `#` or any non-letter selects the
    /// fallback bucket
    pub fn with_initial(mut self, letter: char) -> Self {
        self.bucket = Some(bucket_for(&letter.to_string()));
        self
    }
}

/// Record counts per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub not_fetched: usize,
    pub fetched: usize,
    pub extracted: usize,
    pub failed: usize,
    pub stale: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Basic".parse::<Category>().unwrap(), Category::Basic);
        assert_eq!(" GOTHIC ".parse::<Category>().unwrap(), Category::Gothic);
        assert!("serif".parse::<Category>().is_err());
    }

    #[test]
    fn initial_filter_maps_letters_and_hash() {
        assert_eq!(
            ListFilter::default().with_initial('z').bucket.as_deref(),
            Some("Z")
        );
        assert_eq!(
            ListFilter::default().with_initial('#').bucket.as_deref(),
            Some("misc")
        );
    }

    #[test]
    fn category_theme_ids_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_theme_id(category.theme_id()), Some(category));
        }
        assert_eq!(Category::from_theme_id(99), None);
    }

    #[test]
    fn download_state_strings_match_parse() {
        for state in [
            DownloadState::NotFetched,
            DownloadState::Fetched,
            DownloadState::Extracted,
            DownloadState::Failed,
        ] {
            assert_eq!(DownloadState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DownloadState::parse("pending"), None);
    }

    #[test]
    fn only_fetched_and_extracted_count_as_retrieved() {
        assert!(DownloadState::Fetched.is_retrieved());
        assert!(DownloadState::Extracted.is_retrieved());
        assert!(!DownloadState::NotFetched.is_retrieved());
        assert!(!DownloadState::Failed.is_retrieved());
    }
}
