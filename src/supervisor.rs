//! The upgrade supervisor.
//!
//! ```text
//! Starting ──► Running ⇄ Swapping ──► Running | Degraded
//!                 │
//!                 └──► Draining ──► Stopped
//! ```
//!
//! [`Supervisor::supervise`] runs the only loop that touches the active worker.
//! Everything else (control endpoints, exit watchers) talks to it through the
//! control channel, and signals are handled one at a time in arrival order.
//!
//! - `ReloadRequested` adopts the staged artifact, if any, and swaps to it. For an
//!   exclusive backend (one fixed port) the old worker is killed before the new
//!   one starts and is restored if the new one cannot spawn; otherwise the new
//!   worker is started first and the old one is only stopped once the new one is
//!   published.
//! - `WorkerExited` for the active generation restarts the same artifact, unless
//!   the supervisor itself killed it. Exits of older generations are ignored.
//! - `ExplicitShutdown` stops intake, waits up to the grace period for in-flight
//!   requests, kills the worker and returns.
//!
//! Failed spawns are retried after `spawn_retry_delay`, forever.
use crate::errors::{ReloadError, WorkerError};
use crate::inflight::InFlight;
use crate::signal::{ControlChannel, ControlHandle, ExitCause, UpgradeSignal, control_channel};
use crate::staging::ArtifactStaging;
use crate::worker::{Backend, RouteTarget, TargetPublisher, TargetReader, Worker, route_target_cell};
use bon::Builder;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Where the supervisor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Swapping,
    /// The last start or swap failed. A previous worker may still be serving.
    Degraded,
    Draining,
    Stopped,
}

/// Tunables for [`Supervisor`].
#[derive(Debug, Clone, Builder)]
pub struct SupervisorOptions {
    /// Upper bound on draining before the worker is killed.
    #[builder(default = Duration::from_secs(5))]
    pub grace_period: Duration,
    /// Delay between consecutive failed spawns of the same artifact.
    #[builder(default = Duration::from_secs(1))]
    pub spawn_retry_delay: Duration,
    /// Capacity of the control channel.
    #[builder(default = 32)]
    pub channel_capacity: usize,
    /// Artifact to start with when nothing usable is staged. Also the restart
    /// target until some other artifact has started successfully.
    pub initial_artifact: Option<PathBuf>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Cloneable read/trigger access to a running supervisor, for the HTTP layer.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pub control: ControlHandle,
    pub target: TargetReader,
    pub in_flight: InFlight,
    state: watch::Receiver<SupervisorState>,
    draining: watch::Receiver<bool>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Resolves when the supervisor reaches `state`, or `false` if it went away first.
    pub async fn wait_for_state(&self, state: SupervisorState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }

    /// Resolves once draining has begun; use it to stop accepting connections.
    pub async fn draining(&self) {
        let mut rx = self.draining.clone();
        let _ = rx.wait_for(|draining| *draining).await;
    }
}

struct Active {
    worker: Box<dyn Worker>,
    generation: u64,
    artifact: PathBuf,
}

impl Active {
    /// Stops the worker. A worker that fails to stop is logged and forgotten.
    async fn stop(&mut self, graceful: bool, context: &'static str) {
        if let Err(e) = self.worker.stop(graceful).await {
            warn!(generation = self.generation, context, error = %e, "Failed to stop worker");
        }
    }
}

/// Owns the active worker and every decision about it.
pub struct Supervisor {
    backend: Arc<dyn Backend>,
    staging: Arc<ArtifactStaging>,
    options: SupervisorOptions,
    control: ControlHandle,
    channel: ControlChannel,
    publisher: TargetPublisher,
    state_tx: watch::Sender<SupervisorState>,
    draining_tx: watch::Sender<bool>,
    in_flight: InFlight,
    active: Option<Active>,
    last_good: Option<PathBuf>,
    next_generation: u64,
    retry_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn Backend>,
        staging: Arc<ArtifactStaging>,
        options: SupervisorOptions,
    ) -> Self {
        let (control, channel) = control_channel(options.channel_capacity);
        let (publisher, _) = route_target_cell();
        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        let (draining_tx, _) = watch::channel(false);
        Self {
            backend,
            staging,
            options,
            control,
            channel,
            publisher,
            state_tx,
            draining_tx,
            in_flight: InFlight::new(),
            active: None,
            last_good: None,
            next_generation: 1,
            retry_at: None,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            control: self.control.clone(),
            target: self.publisher.reader(),
            in_flight: self.in_flight.clone(),
            state: self.state_tx.subscribe(),
            draining: self.draining_tx.subscribe(),
        }
    }

    /// Runs until an explicit shutdown has been fully handled.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn supervise(mut self) {
        self.set_state(SupervisorState::Starting);
        self.boot().await;

        loop {
            let signal = tokio::select! {
                biased;
                signal = self.channel.recv() => signal,
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.restart_last_good("retrying failed spawn").await;
                    continue;
                }
            };

            match signal {
                Some(UpgradeSignal::ReloadRequested { respond_to }) => {
                    let outcome = self.reload().await;
                    match respond_to {
                        Some(respond_to) => {
                            if respond_to.send(outcome).is_err() {
                                debug!("Reload caller went away before the outcome was ready");
                            }
                        }
                        None => {
                            if let Err(e) = outcome {
                                warn!(error = %e, "Reload failed");
                            }
                        }
                    }
                }
                Some(UpgradeSignal::WorkerExited { generation, cause }) => {
                    self.on_worker_exited(generation, cause).await;
                }
                Some(UpgradeSignal::ExplicitShutdown) | None => {
                    self.drain_and_stop().await;
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Supervisor state change");
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Starts whatever is staged, falling back to the initial artifact if that
    /// is missing or does not start.
    async fn boot(&mut self) {
        let generation = self.next_generation;
        let staged = match self
            .staging
            .adopt(generation, self.backend.needs_executable())
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                error!(error = %e, "Failed to adopt staged artifact at boot");
                None
            }
        };

        if let Some(candidate) = staged {
            self.allocate_generation();
            match self.start_worker(generation, candidate.clone()).await {
                Ok(active) => {
                    self.install(active);
                    self.set_state(SupervisorState::Running);
                    return;
                }
                Err(e) => {
                    error!(
                        generation,
                        error = %e,
                        artifact = %candidate.display(),
                        "Staged artifact failed to start, falling back to the initial artifact"
                    );
                    self.staging.retire(&candidate).await;
                }
            }
        }

        self.restart_last_good("starting initial artifact").await;
    }

    async fn start_worker(
        &self,
        generation: u64,
        artifact: PathBuf,
    ) -> Result<Active, WorkerError> {
        let mut worker = self
            .backend
            .build(&artifact, generation, self.control.clone());
        worker.start().await?;
        Ok(Active {
            worker,
            generation,
            artifact,
        })
    }

    /// Makes `active` the routed worker and returns the one it replaced.
    fn install(&mut self, active: Active) -> Option<Active> {
        let target = active.worker.route_target();
        info!(generation = active.generation, %target, "Worker is live");
        self.publisher.publish(target);
        self.last_good = Some(active.artifact.clone());
        self.retry_at = None;
        self.active.replace(active)
    }

    fn schedule_retry(&mut self) {
        let delay = self.options.spawn_retry_delay;
        debug!(?delay, "Scheduling spawn retry");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn reload(&mut self) -> Result<(), ReloadError> {
        let generation = self.next_generation;
        let Some(candidate) = self
            .staging
            .adopt(generation, self.backend.needs_executable())
            .await?
        else {
            info!("Reload requested with nothing staged");
            return Err(ReloadError::NoPendingArtifact);
        };
        self.allocate_generation();

        self.set_state(SupervisorState::Swapping);
        let outcome = if self.backend.exclusive() {
            self.swap_exclusive(generation, candidate).await
        } else {
            self.swap_side_by_side(generation, candidate).await
        };

        match &outcome {
            Ok(()) => self.set_state(SupervisorState::Running),
            Err(e) => {
                error!(error = %e, "Swap failed");
                self.set_state(SupervisorState::Degraded);
            }
        }
        outcome.map_err(ReloadError::from)
    }

    /// Start the new worker next to the old one, then retire the old one.
    async fn swap_side_by_side(
        &mut self,
        generation: u64,
        candidate: PathBuf,
    ) -> Result<(), WorkerError> {
        let started = match self.backend.preflight(&candidate).await {
            Ok(()) => self.start_worker(generation, candidate.clone()).await,
            Err(e) => Err(e),
        };
        let new = match started {
            Ok(new) => new,
            Err(e) => {
                self.staging.retire(&candidate).await;
                return Err(e);
            }
        };

        if let Some(mut old) = self.install(new) {
            old.stop(true, "replaced by a newer generation").await;
            if old.artifact != candidate {
                self.staging.retire(&old.artifact).await;
            }
        }
        Ok(())
    }

    /// Stop the old worker, then start the new one; restore the old artifact if
    /// the new one cannot start.
    async fn swap_exclusive(
        &mut self,
        generation: u64,
        candidate: PathBuf,
    ) -> Result<(), WorkerError> {
        if let Err(e) = self.backend.preflight(&candidate).await {
            self.staging.retire(&candidate).await;
            return Err(e);
        }

        let previous = match self.active.take() {
            Some(mut old) => {
                self.publisher.publish(RouteTarget::Unavailable);
                old.stop(false, "making room for a newer generation").await;
                Some(old.artifact)
            }
            None => None,
        };

        match self.start_worker(generation, candidate.clone()).await {
            Ok(new) => {
                self.install(new);
                if let Some(previous) = previous.filter(|p| *p != candidate) {
                    self.staging.retire(&previous).await;
                }
                Ok(())
            }
            Err(e) => {
                self.staging.retire(&candidate).await;
                if let Some(previous) = previous {
                    self.last_good = Some(previous);
                }
                self.restart_last_good("restoring previous artifact after failed swap")
                    .await;
                Err(e)
            }
        }
    }

    async fn on_worker_exited(&mut self, generation: u64, cause: ExitCause) {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !is_active {
            debug!(generation, %cause, "Ignoring exit of a worker that is no longer active");
            return;
        }

        let Some(mut gone) = self.active.take() else {
            return;
        };
        self.publisher.publish(RouteTarget::Unavailable);
        // Releases whatever the worker still holds; the process itself is gone.
        gone.stop(false, "cleaning up after exit").await;

        match cause {
            ExitCause::KilledBySupervisor => {
                info!(generation, "Active worker was stopped deliberately, not restarting");
                self.set_state(SupervisorState::Degraded);
            }
            ExitCause::NormalExit | ExitCause::Crashed => {
                warn!(generation, %cause, "Active worker exited, restarting");
                self.restart_last_good("restarting exited worker").await;
            }
        }
    }

    /// Starts the last artifact that ran, or the initial one if none has yet.
    async fn restart_last_good(&mut self, reason: &'static str) {
        let fallback = self
            .last_good
            .clone()
            .or_else(|| self.options.initial_artifact.clone());
        let Some(artifact) = fallback else {
            warn!(reason, "No artifact to restart");
            self.publisher.publish(RouteTarget::Unavailable);
            self.set_state(SupervisorState::Degraded);
            return;
        };

        let generation = self.allocate_generation();
        info!(generation, reason, artifact = %artifact.display(), "Starting worker");
        match self.start_worker(generation, artifact).await {
            Ok(active) => {
                if let Some(mut stale) = self.install(active) {
                    // Not expected: callers clear the active worker first.
                    stale.stop(false, "replaced by a restart").await;
                }
                self.set_state(SupervisorState::Running);
            }
            Err(e) => {
                error!(generation, error = %e, "Worker failed to start");
                self.publisher.publish(RouteTarget::Unavailable);
                self.set_state(SupervisorState::Degraded);
                if matches!(e, WorkerError::Spawn { .. }) {
                    self.schedule_retry();
                }
            }
        }
    }

    async fn drain_and_stop(&mut self) {
        self.set_state(SupervisorState::Draining);
        self.draining_tx.send_replace(true);
        self.retry_at = None;

        let grace = self.options.grace_period;
        info!(?grace, in_flight = self.in_flight.count(), "Draining");
        if tokio::time::timeout(grace, self.in_flight.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight.count(),
                "Grace period elapsed, terminating with requests in flight"
            );
        }

        if let Some(mut active) = self.active.take() {
            self.publisher.publish(RouteTarget::Unavailable);
            active.stop(false, "shutting down").await;
        }

        self.channel.close_and_drain();
        self.set_state(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
