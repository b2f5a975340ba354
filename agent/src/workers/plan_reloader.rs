//! Plan reload worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::plans::PlanRegistry;
use crate::filesys::dir::Dir;

/// Plan reloader options
#[derive(Debug, Clone)]
pub struct Options {
    /// Rescan interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the plan reload worker
///
/// Picks up new and edited plan files. Runs already triggered keep the plan
/// version they started with.
pub async fn run<S, F>(
    options: &Options,
    registry: &PlanRegistry,
    plans_dir: &Dir,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Plan reloader starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Plan reloader shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        debug!("Rescanning {}", plans_dir.path().display());
        match registry.load_dir(plans_dir).await {
            Ok(report) => {
                if !report.loaded.is_empty() {
                    info!("Reloaded plan(s): {}", report.loaded.join(", "));
                }
                for (path, err) in &report.rejected {
                    warn!("Plan file {} rejected: {}", path.display(), err);
                }
            }
            Err(e) => {
                error!("Failed to scan plans directory: {}", e);
            }
        }
    }
}
