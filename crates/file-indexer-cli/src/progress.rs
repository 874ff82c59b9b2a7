use std::sync::Mutex;
use std::time::Duration;

use colored::*;
use file_indexer_core::archive::ArchiveKind;
use file_indexer_core::progress::{ErrorScope, ScanProgress};
use file_indexer_core::{CountingObserver, ScanObserver, ScanState, ScanSummary};
use indicatif::{ProgressBar, ProgressStyle};

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI observer using indicatif.
///
/// - Walking: spinner, the file total is still growing
/// - Draining: progress bar against the final discovered total
///
/// Every event is also tallied in a [`CountingObserver`] for the end-of-run report.
pub struct CliObserver {
    bar: Mutex<Option<ProgressBar>>,
    counts: CountingObserver,
}

impl CliObserver {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            counts: CountingObserver::new(),
        }
    }

    pub fn counts(&self) -> &CountingObserver {
        &self.counts
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "  {spinner:.cyan} Hashing [{bar:30.cyan/dim}] {pos}/{len} files ({eta} remaining)",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━╸─")
    .tick_chars(TICK_CHARS)
}

impl ScanObserver for CliObserver {
    fn on_scan_start(&self, root: &str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style());
        pb.set_message(format!("Scanning {}...", root));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_file_scanned(&self) {
        self.counts.on_file_scanned();
    }

    fn on_dir_scanned(&self) {
        self.counts.on_dir_scanned();
    }

    fn on_archive_scanned(&self, kind: ArchiveKind) {
        self.counts.on_archive_scanned(kind);
    }

    fn on_archive_entry(&self, kind: ArchiveKind) {
        self.counts.on_archive_entry(kind);
    }

    fn on_error(&self, scope: ErrorScope) {
        self.counts.on_error(scope);
    }

    fn on_batch_flushed(&self, duration_secs: f64, batch_size: usize) {
        self.counts.on_batch_flushed(duration_secs, batch_size);
    }

    fn on_state_change(&self, state: ScanState) {
        match state {
            ScanState::Draining => self.with_bar(|pb| pb.set_style(bar_style())),
            ScanState::Flushing => {
                self.with_bar(|pb| pb.set_message("Writing final batch..."));
            }
            _ => {}
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        self.with_bar(|pb| {
            if pb.length() != Some(progress.files_discovered as u64) {
                pb.set_length(progress.files_discovered as u64);
            }
            pb.set_position(progress.files_processed as u64);
            if progress.state == ScanState::Running {
                pb.set_message(format!(
                    "Scanning... {} directories, {} files found, {} processed",
                    progress.directories, progress.files_discovered, progress.files_processed
                ));
            }
        });
    }

    fn on_scan_complete(&self, summary: &ScanSummary) {
        self.finish_bar();
        let mark = match summary.state {
            ScanState::Done => "✓".green(),
            _ => "✗".yellow(),
        };
        eprintln!(
            "  {} Scan {}: {} files in {:.2}s",
            mark,
            summary.state,
            summary.files_processed(),
            summary.duration.as_secs_f64()
        );
    }
}
