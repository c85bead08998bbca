use crate::core::{PersistError, Result};
use crate::scheduler::SchedulerCore;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background task driving incremental passes.
pub(crate) struct SchedulerWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SchedulerWorker {
    /// Signals the worker and waits for it. A pass that is already running
    /// completes first; no new pass starts.
    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| PersistError::ExecutionError(format!("save worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the periodic worker on the current tokio runtime. The first pass
/// runs one interval after start.
pub(crate) fn spawn_scheduler_worker(core: Arc<SchedulerCore>) -> Result<SchedulerWorker> {
    let handle = Handle::try_current().map_err(|err| {
        PersistError::ExecutionError(format!(
            "save scheduler must be started inside a tokio runtime: {}",
            err
        ))
    })?;

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = handle.spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(core.interval()) => {
                    if let Err(err) = core.run_incremental_pass().await {
                        event!(Level::ERROR, error = %err, "incremental save pass failed");
                    }
                }
            }
        }
        event!(Level::DEBUG, "save worker exited");
    });

    Ok(SchedulerWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
