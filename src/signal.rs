//! The control channel: the only path by which anything changes the active worker.
//!
//! Control endpoints, exit watchers and retry timers hold a [`ControlHandle`] and
//! enqueue [`UpgradeSignal`]s. The supervisor owns the single [`ControlChannel`]
//! receiver and handles signals strictly in arrival order.
use crate::errors::ReloadError;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Why a worker process went away, derived from its structured exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Exited on its own with status code 0.
    NormalExit,
    /// Went away after the supervisor asked it to stop. Never restarted.
    KilledBySupervisor,
    /// Non-zero exit, unrequested signal, or a failure waiting on the process.
    Crashed,
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::NormalExit => write!(f, "normal exit"),
            ExitCause::KilledBySupervisor => write!(f, "killed by supervisor"),
            ExitCause::Crashed => write!(f, "crashed"),
        }
    }
}

/// Reply slot for whoever asked for a reload.
pub type ReloadResponder = oneshot::Sender<Result<(), ReloadError>>;

/// An event for the supervisor.
#[derive(Debug)]
pub enum UpgradeSignal {
    /// Adopt the pending artifact, if any. `respond_to` receives the outcome.
    ReloadRequested { respond_to: Option<ReloadResponder> },
    /// Drain and stop. Nothing queued after this is acted upon.
    ExplicitShutdown,
    /// The worker of `generation` has exited (or failed to come up).
    WorkerExited { generation: u64, cause: ExitCause },
}

/// Creates the bounded control channel.
pub fn control_channel(capacity: usize) -> (ControlHandle, ControlChannel) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ControlHandle { tx }, ControlChannel { rx })
}

/// Producer side, cheap to clone and shared by every signal source.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<UpgradeSignal>,
}

impl ControlHandle {
    /// Asks for a reload and waits until the supervisor has decided its outcome.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        let outcome = self.enqueue_reload().await?;
        // A dropped responder means the supervisor stopped before handling us.
        outcome.await.unwrap_or(Err(ReloadError::ShuttingDown))
    }

    /// Queues a reload and returns the receiver for its outcome.
    pub async fn enqueue_reload(
        &self,
    ) -> Result<oneshot::Receiver<Result<(), ReloadError>>, ReloadError> {
        let (respond_to, outcome) = oneshot::channel();
        self.tx
            .send(UpgradeSignal::ReloadRequested {
                respond_to: Some(respond_to),
            })
            .await
            .map_err(|_| ReloadError::ChannelClosed)?;
        Ok(outcome)
    }

    /// Asks for shutdown. Returns once the signal is queued.
    pub async fn shutdown(&self) -> Result<(), ReloadError> {
        self.tx
            .send(UpgradeSignal::ExplicitShutdown)
            .await
            .map_err(|_| ReloadError::ChannelClosed)
    }

    /// Reports a worker exit. Failing to deliver only matters while the supervisor runs.
    pub async fn worker_exited(&self, generation: u64, cause: ExitCause) {
        if self
            .tx
            .send(UpgradeSignal::WorkerExited { generation, cause })
            .await
            .is_err()
        {
            debug!(generation, %cause, "Supervisor gone, dropping exit notification");
        }
    }
}

/// Consumer side, owned by the supervisor.
#[derive(Debug)]
pub struct ControlChannel {
    rx: mpsc::Receiver<UpgradeSignal>,
}

impl ControlChannel {
    pub async fn recv(&mut self) -> Option<UpgradeSignal> {
        self.rx.recv().await
    }

    /// Refuses further signals and answers every queued reload with `ShuttingDown`.
    pub fn close_and_drain(&mut self) {
        self.rx.close();
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                UpgradeSignal::ReloadRequested {
                    respond_to: Some(respond_to),
                } => {
                    let _ = respond_to.send(Err(ReloadError::ShuttingDown));
                }
                other => warn!(signal = ?other, "Discarding signal received during shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signals_arrive_in_fifo_order() {
        let (handle, mut channel) = control_channel(8);

        handle.worker_exited(1, ExitCause::Crashed).await;
        handle.shutdown().await.unwrap();
        handle.worker_exited(2, ExitCause::NormalExit).await;

        assert!(matches!(
            channel.recv().await,
            Some(UpgradeSignal::WorkerExited {
                generation: 1,
                cause: ExitCause::Crashed
            })
        ));
        assert!(matches!(
            channel.recv().await,
            Some(UpgradeSignal::ExplicitShutdown)
        ));
        assert!(matches!(
            channel.recv().await,
            Some(UpgradeSignal::WorkerExited { generation: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_receives_supervisor_outcome() {
        let (handle, mut channel) = control_channel(1);

        let waiter = tokio::spawn(async move { handle.reload().await });

        match channel.recv().await {
            Some(UpgradeSignal::ReloadRequested {
                respond_to: Some(respond_to),
            }) => respond_to.send(Err(ReloadError::NoPendingArtifact)).unwrap(),
            other => panic!("unexpected signal: {other:?}"),
        }

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(ReloadError::NoPendingArtifact)));
    }

    #[tokio::test]
    async fn test_drain_answers_queued_reloads_with_shutting_down() {
        let (handle, mut channel) = control_channel(4);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.reload().await })
        };
        // Let the reload get queued before closing.
        while channel.rx.is_empty() {
            tokio::task::yield_now().await;
        }
        channel.close_and_drain();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ReloadError::ShuttingDown)
        ));
        assert!(matches!(
            handle.shutdown().await,
            Err(ReloadError::ChannelClosed)
        ));
    }
}
