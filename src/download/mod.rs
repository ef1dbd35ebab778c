// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod bucket;
mod fetch;
mod resume;
mod scheduler;

pub use bucket::{
    FALLBACK_BUCKET, PARTIAL_SUFFIX, archive_path, archive_path_with_id, bucket_for, file_stem,
    font_dir, partial_path,
};
pub use fetch::{FetchContext, FetchedArchive, fetch_archive};
pub use resume::{BatchPlan, clean_partial_files, plan_batch};
pub use scheduler::{BatchOptions, BatchSummary, run_batch};
