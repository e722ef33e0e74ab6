//! The three-step workflow engine: link_crawl -> content_crawl ->
//! forum_publish, with gate checks, per-step retry and timeout, a durable
//! progress journal, and cooperative cancellation.

pub mod progress;
pub mod status;
pub mod steps;
pub mod workflow;

pub use progress::{ExecutionRecord, ExecutionStatus, ProgressTracker, StepStatus};
pub use status::{GateDecision, StatusChecker};
pub use workflow::{ExecuteOptions, WorkflowManager, WorkflowOutcome, STEP_ORDER};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raise `flag` on SIGINT or SIGTERM. The running step finishes if it can;
/// the engine checks the flag at every suspension point.
pub fn install_signal_handlers(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    flag.store(true, Ordering::Relaxed);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received, finishing current step");
        flag.store(true, Ordering::Relaxed);
    });
}
