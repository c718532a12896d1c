//! Stop-the-run handling for SIGINT, SIGTERM and SIGHUP.
//!
//! The first signal cancels the run token. The orchestrator then lists no
//! more pages and dispatches nothing new. Transfers already holding a slot
//! run to completion so their ledger records end COMPLETED or FAILED rather
//! than stuck IN_PROGRESS. A second signal gives up on that and exits.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// Conventional status for a process ended by an interrupt.
const FORCE_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    Drain,
    ForceExit,
}

/// Counts signals; only the first one asks for a drain.
#[derive(Debug, Default)]
struct SignalCounter(AtomicU32);

impl SignalCounter {
    fn next(&self) -> SignalAction {
        match self.0.fetch_add(1, Ordering::SeqCst) {
            0 => SignalAction::Drain,
            _ => SignalAction::ForceExit,
        }
    }
}

/// Returns the token every run observes. Registration failures are
/// reported here rather than from the background listener.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?,
            signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?,
        )
    };

    let run_token = token.clone();
    tokio::spawn(async move {
        let counter = SignalCounter::default();
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Cannot listen for Ctrl+C; signals will be ignored");
                    return;
                }
            }

            match counter.next() {
                SignalAction::Drain => {
                    tracing::info!(
                        "Stopping: no new transfers will start, waiting for running ones (signal again to abandon them)"
                    );
                    run_token.cancel();
                }
                SignalAction::ForceExit => {
                    tracing::warn!("Abandoning running transfers");
                    std::process::exit(FORCE_EXIT_CODE);
                }
            }
        }
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_signal_drains() {
        let counter = SignalCounter::default();
        assert_eq!(counter.next(), SignalAction::Drain);
        assert_eq!(counter.next(), SignalAction::ForceExit);
        assert_eq!(counter.next(), SignalAction::ForceExit);
    }

    #[tokio::test]
    async fn installed_token_starts_live() {
        let token = install_signal_handler().unwrap();
        assert!(!token.is_cancelled());
    }
}
