// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fontpull::{
    AppPaths, BatchSummary, Category, Config, DownloadState, ExtractSummary, FontLibrary,
    FontRecord, ListFilter, NoopReporter, ProgressEvent, ProgressReporter, Selection,
    SharedProgressReporter, SyncReport,
};

// Emoji with fallback for terminals without Unicode support
static LETTERS: Emoji<'_, '_> = Emoji("🔤 ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static CATALOG: Emoji<'_, '_> = Emoji("🗂️  ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "[x] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Mirror a font site's catalog locally and fetch fonts in bulk
#[derive(Parser, Debug)]
#[command(name = "fontpull")]
#[command(about = "Mirror a font site's catalog locally and fetch fonts in bulk")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Application home (catalog, settings, downloads)
    #[arg(long, global = true, env = "FONTPULL_HOME")]
    home: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update the local catalog from the site's listings
    Sync {
        /// Categories to walk (all when omitted)
        #[arg(short = 'C', long = "category")]
        categories: Vec<Category>,
    },

    /// Search the local catalog by name
    Search {
        query: String,

        #[arg(short = 'C', long)]
        category: Option<Category>,

        /// Print matching records as JSON
        #[arg(long)]
        json: bool,
    },

    /// List catalog fonts filed under one initial (`#` for the rest)
    Browse {
        letter: char,

        #[arg(short = 'C', long)]
        category: Option<Category>,

        #[arg(long)]
        json: bool,
    },

    /// Fetch archives of catalog fonts (all pending when no ids are given)
    Download {
        /// Font ids to fetch
        ids: Vec<String>,

        #[arg(short = 'C', long)]
        category: Option<Category>,

        /// Only fonts whose name or id contains this text
        #[arg(long)]
        query: Option<String>,

        /// Only fonts filed under this initial (`#` for the rest)
        #[arg(short = 'L', long)]
        letter: Option<char>,

        /// Maximum number of concurrent downloads
        #[arg(short = 'c', long)]
        concurrent: Option<usize>,

        /// Root of the archive tree
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Unpack font files from fetched archives
    Extract {
        /// Font ids to extract (all fetched when omitted)
        ids: Vec<String>,

        #[arg(short = 'C', long)]
        category: Option<Category>,

        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Make failed fonts eligible for download again
    Retry {
        /// Font ids to retry
        #[arg(required_unless_present = "all")]
        ids: Vec<String>,

        /// Retry every failed font
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },

    /// Add a single font from a page or download link and fetch it
    Get {
        url: String,

        /// Also unpack its font files
        #[arg(short, long)]
        extract: bool,

        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Show catalog counts per state
    Status {
        #[arg(long)]
        json: bool,
    },
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::with_template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn shared() -> SharedProgressReporter {
        Arc::new(Self::new())
    }

    fn get_or_create_bar(&self, slot: usize) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bar) = bars.get(&slot) {
            return bar.clone();
        }

        let style = ProgressStyle::with_template(&format!(
            "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
        ))
        .map(|style| style.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(slot, bar.clone());
        bar
    }

    fn finish_bar(&self, slot: usize) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.remove(&slot) {
            bar.finish_and_clear();
        }
    }

    fn note(&self, line: String) {
        let _ = self.multi.println(line);
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::CategoryStarted { category } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Scanning {}", category.to_string().cyan()));
            }

            ProgressEvent::PageScanned {
                category,
                page,
                items,
            } => {
                self.main_bar.set_message(format!(
                    "{SEARCH}{} • page {} • {} fonts",
                    category.to_string().cyan(),
                    page.to_string().yellow(),
                    items
                ));
            }

            ProgressEvent::ItemSkipped { id, error } => {
                self.note(format!("  {CROSS}{} - {}", id.yellow(), error.dimmed()));
            }

            ProgressEvent::SyncCompleted {
                added,
                updated,
                unchanged,
                stale,
                errors,
            } => {
                self.main_bar.finish_and_clear();
                println!(
                    "\n{PARTY}{} {} added, {} updated, {} unchanged, {} no longer listed, {} errors",
                    "Sync complete:".bold().green(),
                    added.to_string().green().bold(),
                    updated.to_string().cyan(),
                    unchanged,
                    stale.to_string().yellow(),
                    count_colored(errors)
                );
            }

            ProgressEvent::PartialFilesCleanedUp { count } => {
                self.note(
                    format!("Removed {count} partial file(s) from an interrupted run")
                        .dimmed()
                        .to_string(),
                );
            }

            ProgressEvent::BatchPlanned {
                to_fetch,
                already_retrieved,
                awaiting_retry,
            } => {
                self.main_bar.set_message(format!(
                    "{CATALOG}{} to fetch, {} already on disk, {} awaiting retry",
                    to_fetch.to_string().cyan(),
                    already_retrieved.to_string().green(),
                    awaiting_retry.to_string().yellow()
                ));
            }

            ProgressEvent::DownloadStarted {
                slot,
                name,
                index,
                total,
                ..
            } => {
                let bar = self.get_or_create_bar(slot);
                bar.set_length(0);
                bar.set_position(0);
                bar.set_message(format!(
                    "[{}/{}] {}",
                    (index + 1).to_string().cyan(),
                    total.to_string().cyan(),
                    truncate_title(&name, 40)
                ));
            }

            ProgressEvent::DownloadProgress {
                slot,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(slot);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::DownloadSucceeded { slot, .. } => {
                self.finish_bar(slot);
            }

            ProgressEvent::DownloadFailed {
                slot, name, reason, ..
            } => {
                self.finish_bar(slot);
                self.note(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&name, 30).red(),
                    reason.red()
                ));
            }

            ProgressEvent::DownloadSkipped { .. } => {}

            ProgressEvent::DownloadFinished { summary } => {
                self.main_bar.finish_and_clear();
                print_batch_summary(&summary);
            }

            ProgressEvent::ExtractSucceeded { name, files, .. } => {
                self.main_bar.set_message(format!(
                    "{PACKAGE}{} ({} font files)",
                    truncate_title(&name, 40),
                    files
                ));
            }

            ProgressEvent::ExtractFailed { name, reason, .. } => {
                self.note(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&name, 30).red(),
                    reason.red()
                ));
            }

            ProgressEvent::ExtractFinished { summary } => {
                self.main_bar.finish_and_clear();
                print_extract_summary(&summary);
            }
        }
    }
}

fn count_colored(count: usize) -> colored::ColoredString {
    if count > 0 {
        count.to_string().red().bold()
    } else {
        count.to_string().green()
    }
}

fn print_batch_summary(summary: &BatchSummary) {
    println!(
        "\n{PARTY}{} {} fetched, {} skipped, {} failed",
        "Download complete:".bold().green(),
        summary.fetched.to_string().green().bold(),
        summary.skipped.to_string().yellow(),
        count_colored(summary.failed)
    );
    if summary.cancelled > 0 {
        println!(
            "{}",
            format!(
                "Cancelled: {} font(s) left for the next run",
                summary.cancelled
            )
            .yellow()
        );
    }
}

fn print_extract_summary(summary: &ExtractSummary) {
    println!(
        "\n{PARTY}{} {} fonts unpacked ({} files), {} skipped, {} failed",
        "Extraction complete:".bold().green(),
        summary.extracted.to_string().green().bold(),
        summary.files,
        summary.skipped.to_string().yellow(),
        count_colored(summary.failed)
    );
}

fn print_failures(title: &str, failures: &[(String, String)]) {
    if failures.is_empty() {
        return;
    }
    println!("\n{}", title.red().bold());
    for (id, error) in failures {
        println!("  {}{} - {}", CROSS, id.yellow(), error.dimmed());
    }
}

fn print_records(records: &[FontRecord]) {
    if records.is_empty() {
        println!("{}", "No matching fonts".dimmed());
        return;
    }
    for record in records {
        let category = record
            .category
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = match record.download_state {
            DownloadState::Extracted => record.download_state.to_string().green(),
            DownloadState::Fetched => record.download_state.to_string().cyan(),
            DownloadState::Failed => record.download_state.to_string().red(),
            DownloadState::NotFetched => record.download_state.to_string().dimmed(),
        };
        println!(
            "{:<32} {:<40} {:<10} {}{}",
            record.id,
            truncate_title(&record.name, 40),
            category,
            state,
            if record.stale { " (unlisted)" } else { "" }
        );
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    // Only initialize logging if verbose or RUST_LOG is set
    if verbose || std::env::var("RUST_LOG").is_ok() {
        let directive = if verbose {
            "fontpull=debug"
        } else {
            "fontpull=warn"
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Cancel the token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Stopping after in-flight downloads...".yellow());
            trigger.cancel();
        }
    });
    cancel
}

fn open_library(paths: &AppPaths, dest: Option<PathBuf>) -> Result<FontLibrary> {
    let mut config = Config::load(&paths.settings_path()).context("Failed to load settings")?;
    if dest.is_some() {
        config.download_dir = dest;
    }
    FontLibrary::open(paths, config).context("Failed to open font library")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let paths = AppPaths::resolve(cli.home.clone()).context("Failed to locate fontpull home")?;
    let quiet = cli.quiet;

    let reporter = || -> SharedProgressReporter {
        if quiet {
            NoopReporter::shared()
        } else {
            IndicatifReporter::shared()
        }
    };

    if !quiet {
        println!(
            "\n{}{} {}\n",
            LETTERS,
            "fontpull".bold().magenta(),
            "- Font Catalog Mirror".dimmed()
        );
    }

    match cli.command {
        Command::Sync { categories } => {
            let library = open_library(&paths, None)?;
            let report: SyncReport = library
                .sync(&categories, &reporter())
                .await
                .context("Failed to sync catalog")?;
            if !quiet {
                print_failures("Skipped items:", &report.errors);
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Search {
            query,
            category,
            json,
        } => {
            let library = open_library(&paths, None)?;
            let records = library
                .search(&query, category)
                .context("Failed to search catalog")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Browse {
            letter,
            category,
            json,
        } => {
            let library = open_library(&paths, None)?;
            let records = library
                .browse(letter, category)
                .context("Failed to list catalog")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Download {
            ids,
            category,
            query,
            letter,
            concurrent,
            dest,
        } => {
            let library = open_library(&paths, dest)?;
            let selection = if ids.is_empty() {
                let filter = ListFilter {
                    query,
                    category,
                    ..ListFilter::default()
                };
                Selection::Pending(match letter {
                    Some(letter) => filter.with_initial(letter),
                    None => filter,
                })
            } else {
                Selection::Ids(ids)
            };
            let concurrency = concurrent.unwrap_or(library.config().concurrency);
            let cancel = cancel_on_ctrl_c();

            let summary = library
                .download(&selection, concurrency, &cancel, reporter())
                .await
                .context("Failed to download fonts")?;

            if !quiet {
                print_failures("Failed fonts:", &summary.failures);
                println!(
                    "\n{FOLDER}Output: {}\n",
                    library.download_root().display().to_string().cyan()
                );
            }
            library.close().context("Failed to close catalog")?;

            if summary.failed > 0 && summary.fetched == 0 {
                std::process::exit(1);
            }
        }

        Command::Extract { ids, category, dest } => {
            let library = open_library(&paths, dest)?;
            let selection = if ids.is_empty() {
                Selection::Pending(ListFilter {
                    category,
                    state: Some(DownloadState::Fetched),
                    ..ListFilter::default()
                })
            } else {
                Selection::Ids(ids)
            };

            let summary = library
                .extract(&selection, reporter())
                .await
                .context("Failed to extract fonts")?;
            if !quiet {
                print_failures("Failed archives:", &summary.failures);
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Retry { ids, all } => {
            let library = open_library(&paths, None)?;
            let ids = if all { Vec::new() } else { ids };
            let retried = library
                .retry_failed(&ids)
                .context("Failed to reset failed fonts")?;
            if !quiet {
                println!(
                    "{SUCCESS}{} font(s) will be fetched on the next download",
                    retried.to_string().green().bold()
                );
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Get { url, extract, dest } => {
            let library = open_library(&paths, dest)?;
            let cancel = cancel_on_ctrl_c();

            let result = library
                .download_by_direct_link(&url, &cancel, reporter())
                .await
                .with_context(|| format!("Failed to get {url}"))?;

            if !quiet {
                print_failures("Failed fonts:", &result.summary.failures);
            }

            if extract && result.summary.fetched > 0 {
                library
                    .extract(&Selection::Ids(vec![result.record.id.clone()]), reporter())
                    .await
                    .context("Failed to extract font")?;
            }

            if !quiet && let Some(path) = &result.record.local_archive_path {
                println!(
                    "\n{FOLDER}{}: {}\n",
                    result.record.name.bold(),
                    path.display().to_string().cyan()
                );
            }
            library.close().context("Failed to close catalog")?;
        }

        Command::Status { json } => {
            let library = open_library(&paths, None)?;
            let stats = library.stats().context("Failed to read catalog")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{CATALOG}{}", "Catalog".bold());
                println!("  total        {}", stats.total.to_string().bold());
                println!("  not fetched  {}", stats.not_fetched);
                println!("  fetched      {}", stats.fetched.to_string().cyan());
                println!("  extracted    {}", stats.extracted.to_string().green());
                println!("  failed       {}", count_colored(stats.failed));
                println!("  unlisted     {}", stats.stale.to_string().yellow());
                println!(
                    "\n{FOLDER}Home: {}",
                    paths.home.display().to_string().cyan()
                );
            }
            library.close().context("Failed to close catalog")?;
        }
    }

    Ok(())
}
