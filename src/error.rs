// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::DownloadState;

/// Errors raised by the catalog store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Catalog store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("Failed to open catalog {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Catalog {path} has schema version {found}, expected {expected}")]
    SchemaVersion {
        path: PathBuf,
        found: i64,
        expected: i64,
    },

    #[error("Font '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DownloadState,
        to: DownloadState,
    },

    #[error("Unknown font '{0}'")]
    UnknownRecord(String),

    #[error("Catalog connection lock was poisoned")]
    Poisoned,

    #[error("Corrupt catalog row for '{id}': {reason}")]
    CorruptRow { id: String, reason: String },
}

impl StoreError {
    /// Whether the error means the store itself can no longer be trusted.
    ///
    /// Transition conflicts and unknown ids are per-record outcomes; every
    /// other variant halts the operation that hit it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StoreError::InvalidTransition { .. } | StoreError::UnknownRecord(_)
        )
    }
}

/// Errors that can occur while reading the remote font index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Could not parse {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Link not recognized: {0} (expected a .font page or a dl/?f= link)")]
    UnrecognizedLink(String),
}

/// Errors that can occur while retrieving a single archive
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Could not resolve archive link: {0}")]
    Resolve(#[from] IndexError),

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    RenameFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server returned an empty archive for {url}")]
    EmptyArchive { url: String },

    #[error("Download cancelled")]
    Cancelled,
}

/// Errors that can occur while extracting fonts from a saved archive
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Font '{id}' is {state}, only fetched archives can be extracted")]
    NotFetched { id: String, state: DownloadState },

    #[error("Archive {path} is missing: {source}")]
    MissingArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive {path}: {source}")]
    BadArchive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Failed to read entry '{entry}' of {path}: {source}")]
    EntryReadFailed {
        path: PathBuf,
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive {path} contains no font files")]
    NoFontFiles { path: PathBuf },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),
}

/// Top-level errors for catalog reconciliation
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),
}

/// Top-level errors for download and extraction batches
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown font id(s) in selection: {}", .0.join(", "))]
    InvalidSelection(Vec<String>),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while opening a font library
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine a home directory for fontpull")]
    NoHomeDirectory,

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read settings file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write settings file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid site URL '{url}': {source}")]
    InvalidSiteUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to serialize settings: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}
