use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use colored::*;
use file_indexer_core::CancelToken;
use tracing::warn;

/// Exit status for a scan stopped by a signal.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    /// Stop gracefully: finish in-flight work and flush.
    Cancel,
    /// Leave immediately.
    Exit,
}

/// Counts interrupts against one scan's token.
struct Interrupts {
    token: CancelToken,
    received: AtomicUsize,
}

impl Interrupts {
    fn new(token: CancelToken) -> Self {
        Self {
            token,
            received: AtomicUsize::new(0),
        }
    }

    fn record(&self) -> Response {
        if self.received.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
            Response::Cancel
        } else {
            Response::Exit
        }
    }
}

/// Routes Ctrl+C (and SIGTERM) to `token`. The first signal cancels the scan;
/// a second one exits without waiting for the final flush.
pub fn install(token: CancelToken) -> Result<()> {
    let interrupts = Interrupts::new(token);
    ctrlc::set_handler(move || match interrupts.record() {
        Response::Cancel => {
            warn!("Interrupt received, stopping scan");
            eprintln!(
                "{}",
                "Stopping: finishing in-flight files and flushing. Press Ctrl+C again to quit now."
                    .yellow()
            );
        }
        Response::Exit => {
            eprintln!("{}", "Forced exit; the last batch was not written.".red());
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    })
    .context("Failed to install interrupt handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interrupt_cancels_second_exits() {
        let token = CancelToken::new();
        let interrupts = Interrupts::new(token.clone());

        assert_eq!(interrupts.record(), Response::Cancel);
        assert!(token.is_cancelled());
        assert_eq!(interrupts.record(), Response::Exit);
        assert_eq!(interrupts.record(), Response::Exit);
    }
}
