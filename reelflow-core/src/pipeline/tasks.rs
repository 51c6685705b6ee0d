//! Lifecycle of the long-running periodic tasks.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acquisition::DownloadRegistry;

/// Handles to the tracker and sweeper tasks started by the pipeline.
///
/// Nothing runs until [`crate::pipeline::MediaPipeline::start_background_tasks`]
/// is called, and nothing stops until [`BackgroundTasks::shutdown`].
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    registry: DownloadRegistry,
}

impl BackgroundTasks {
    pub(crate) fn new(cancel: CancellationToken, registry: DownloadRegistry) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
            registry,
        }
    }

    pub(crate) fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    /// Names of the tasks still tracked.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Token that stops every periodic task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the periodic tasks, cancels in-flight acquisitions and waits
    /// for all of them to finish.
    pub async fn shutdown(self) {
        info!(tasks = self.handles.len(), "Stopping background tasks");
        self.cancel.cancel();

        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, "Background task ended abnormally: {e}");
            }
        }

        self.registry.shutdown().await;
        info!("Background tasks stopped");
    }
}
