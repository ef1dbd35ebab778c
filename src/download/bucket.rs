// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use sanitize_filename::{Options, sanitize_with_options};

/// Bucket for names that do not start with an ASCII letter
pub const FALLBACK_BUCKET: &str = "misc";

/// Suffix of in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Maximum length for the name portion of a file name
const MAX_STEM_LENGTH: usize = 100;

/// Alphabetical bucket for a font name.
///
/// The first alphanumeric character decides: an ASCII letter gives its
/// uppercase form, anything else the fallback bucket.
pub fn bucket_for(name: &str) -> String {
    match name.chars().find(|c| c.is_alphanumeric()) {
        Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase().to_string(),
        _ => FALLBACK_BUCKET.to_string(),
    }
}

/// File name stem for a font, safe on every platform
///
/// Falls back to the id when the display name sanitizes to nothing.
pub fn file_stem(name: &str, id: &str) -> String {
    let stem = sanitize_name(name);
    if stem.is_empty() {
        let id = sanitize_name(id);
        if id.is_empty() { "font".to_string() } else { id }
    } else {
        stem
    }
}

/// Final location of a font's archive: `<root>/<bucket>/<name>.zip`
pub fn archive_path(dest_root: &Path, name: &str, id: &str) -> PathBuf {
    dest_root
        .join(bucket_for(name))
        .join(format!("{}.zip", file_stem(name, id)))
}

/// Archive location that also carries the id: `<root>/<bucket>/<name>.<id>.zip`.
///
/// Used when the plain path already belongs to another font with the same
/// sanitized name.
pub fn archive_path_with_id(dest_root: &Path, name: &str, id: &str) -> PathBuf {
    let id_part = sanitize_name(id);
    let id_part = if id_part.is_empty() { "font" } else { &id_part };
    dest_root
        .join(bucket_for(name))
        .join(format!("{}.{}.zip", file_stem(name, id), id_part))
}

/// Directory receiving a font's extracted files, named after its archive:
/// `<root>/<bucket>/<archive stem>/`
pub fn font_dir(dest_root: &Path, name: &str, archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| file_stem(name, ""));
    dest_root.join(bucket_for(name)).join(stem)
}

/// Temporary sibling a download is streamed into before the rename.
///
/// Carries the id so two fonts with the same display name never share one.
pub fn partial_path(final_path: &Path, id: &str) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{file_name}.{id}{PARTIAL_SUFFIX}"))
}

fn sanitize_name(name: &str) -> String {
    let options = Options {
        windows: true,
        truncate: true,
        replacement: "-",
    };
    let sanitized = sanitize_with_options(name, options);

    // Leading dots would hide the file, trailing ones upset Windows
    let trimmed = sanitized
        .trim_matches(|c: char| c == '.' || c == '-' || c.is_whitespace())
        .to_string();

    truncate_at_boundary(&trimmed, MAX_STEM_LENGTH)
}

/// Truncate to at most `max_len` bytes without splitting a character
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].trim_end().to_string()
}
