//! Byte progress bar for transfers.

use std::io::{self, IsTerminal};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use transfer_core::transfer::ProgressCallback;

const BAR_TEMPLATE: &str =
    "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Creates a bar and the callback that drives it.
///
/// Returns `None` when quiet or when stderr is not a terminal.
pub(crate) fn transfer_progress(quiet: bool) -> Option<(ProgressBar, ProgressCallback)> {
    if quiet || !io::stderr().is_terminal() {
        return None;
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let handle = bar.clone();
    let callback: ProgressCallback = Arc::new(move |transferred, total| {
        if handle.length() != Some(total) {
            handle.set_length(total);
        }
        handle.set_position(transferred);
    });
    Some((bar, callback))
}
