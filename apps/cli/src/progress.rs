//! Progress bar for a running transfer

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pfxfer_core::{Download, TransferCounter};

/// Progress bar following the counter of one download
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(download: &Download) -> Self {
        let counter = download.counter();
        let bar = ProgressBar::new(counter.size());

        let bar_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
            .map(|s| s.progress_chars("█▓▒░  "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(bar_style);

        bar.set_message(download.file().filename().to_string());
        // Resumed bytes are not part of this session's rate
        bar.set_position(counter.start_offset());
        bar.reset_eta();

        Self { bar }
    }

    /// A bar that draws nothing, for machine-readable output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn update(&self, counter: &TransferCounter) {
        self.bar.set_position(counter.bytes_done());
    }

    pub fn finish_completed(&self, counter: &TransferCounter) {
        self.bar.set_position(counter.bytes_done());
        self.bar.finish_with_message(format!(
            "{} Transfer complete",
            style("✓").green().bold()
        ));
    }

    pub fn abandon(&self, reason: &str) {
        self.bar
            .abandon_with_message(format!("{} Failed: {}", style("✗").red().bold(), reason));
    }

    pub fn interrupted(&self) {
        self.bar
            .abandon_with_message(format!("{} Interrupted", style("⏸").yellow()));
    }
}
