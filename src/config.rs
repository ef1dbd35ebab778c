// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application home layout and user settings.
//!
//! Settings live in `<home>/config/settings.json`; a missing file means
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::http::{DEFAULT_USER_AGENT, HttpSettings};
use crate::remote::{DEFAULT_MAX_PAGES, DEFAULT_SITE_URL};

/// Directory name used under the platform data directory
const APP_DIR: &str = "fontpull";

/// Locations under the application home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub home: PathBuf,
}

impl AppPaths {
    /// Resolve the home directory: explicit override, else the platform data
    /// directory, else `~/.fontpull`
    pub fn resolve(home: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(home) = home {
            return Ok(Self { home });
        }

        let home = dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .or_else(|| dirs::home_dir().map(|dir| dir.join(format!(".{APP_DIR}"))))
            .ok_or(ConfigError::NoHomeDirectory)?;

        Ok(Self { home })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir().join("catalog.db")
    }

    /// Default root of the bucketed archive and font tree
    pub fn downloads_dir(&self) -> PathBuf {
        self.home.join("downloads")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.home.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    /// Create the directory layout if absent
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [self.data_dir(), self.downloads_dir(), self.config_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| ConfigError::CreateDirectoryFailed {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// User settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the font site
    pub site_url: String,

    /// Simultaneous archive downloads
    pub concurrency: usize,

    /// Simultaneous extractions, independent of downloads
    pub extract_concurrency: usize,

    /// Minimum spacing between page fetches, in milliseconds
    pub request_delay_ms: u64,

    /// Per-request timeout, in seconds
    pub timeout_secs: u64,

    /// Extra attempts after 429 or 5xx responses
    pub max_retries: u32,

    /// Cap on listing pages walked per category
    pub max_pages: u32,

    pub user_agent: String,

    /// Where archives and fonts go (defaults to `<home>/downloads`)
    pub download_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let http = HttpSettings::default();
        Self {
            site_url: DEFAULT_SITE_URL.to_string(),
            concurrency: 4,
            extract_concurrency: 2,
            request_delay_ms: http.page_delay.as_millis() as u64,
            timeout_secs: http.timeout.as_secs(),
            max_retries: http.max_retries,
            max_pages: DEFAULT_MAX_PAGES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            download_dir: None,
        }
    }
}

impl Config {
    /// Load settings from `path`, or defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write settings as pretty JSON, creating the parent directory
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::CreateDirectoryFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parsed site root; a missing trailing slash is added so relative
    /// page paths resolve below it
    pub fn site_url(&self) -> Result<Url, ConfigError> {
        let raw = self.site_url.trim();
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };

        Url::parse(&normalized).map_err(|e| ConfigError::InvalidSiteUrl {
            url: self.site_url.clone(),
            source: e,
        })
    }

    /// Settings for the HTTP client
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_retries: self.max_retries,
            page_delay: Duration::from_millis(self.request_delay_ms),
        }
    }

    /// Effective download root for the given home
    pub fn download_root(&self, paths: &AppPaths) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| paths.downloads_dir())
    }
}
