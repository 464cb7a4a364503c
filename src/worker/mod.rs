//! Worker backends and the route target the router reads.
//!
//! A [`Backend`] turns an artifact path into a [`Worker`]; the worker is what
//! actually serves. Two backends exist: [`process::ProcessBackend`] runs the
//! artifact as an executable listening on a fixed local port, and
//! [`library::LibraryBackend`] loads it as a shared library and calls its entry
//! point in-process.
//!
//! The supervisor is the only writer of the [`RouteTarget`]; the router holds a
//! [`TargetReader`] and takes a snapshot per request.
pub mod library;
pub mod process;

use crate::errors::WorkerError;
use crate::signal::ControlHandle;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

pub use library::{LibraryBackend, LoadedEntry};
pub use process::{ProcessBackend, classify_exit};

/// Where the router sends a request.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Forward over HTTP to a local worker process.
    Process {
        base: Url,
        generation: u64,
        pid: Option<u32>,
    },
    /// Call the entry point of a loaded library.
    Library {
        entry: Arc<LoadedEntry>,
        generation: u64,
    },
    /// No live worker; the router answers with its error responder.
    Unavailable,
}

impl RouteTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            RouteTarget::Process { .. } => "process",
            RouteTarget::Library { .. } => "library",
            RouteTarget::Unavailable => "unavailable",
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            RouteTarget::Process { generation, .. } | RouteTarget::Library { generation, .. } => {
                Some(*generation)
            }
            RouteTarget::Unavailable => None,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Process {
                base, generation, ..
            } => write!(f, "process#{generation} at {base}"),
            RouteTarget::Library { entry, generation } => {
                write!(f, "library#{generation} from {}", entry.path().display())
            }
            RouteTarget::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Creates the single-writer route target cell, initially [`RouteTarget::Unavailable`].
pub fn route_target_cell() -> (TargetPublisher, TargetReader) {
    let (tx, rx) = watch::channel(RouteTarget::Unavailable);
    (TargetPublisher { tx }, TargetReader { rx })
}

/// Write side of the route target. Owned by the supervisor.
#[derive(Debug)]
pub struct TargetPublisher {
    tx: watch::Sender<RouteTarget>,
}

impl TargetPublisher {
    /// Replaces the target. Readers see either the old or the new value, whole.
    pub fn publish(&self, target: RouteTarget) {
        self.tx.send_replace(target);
    }

    pub fn reader(&self) -> TargetReader {
        TargetReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the route target.
#[derive(Debug, Clone)]
pub struct TargetReader {
    rx: watch::Receiver<RouteTarget>,
}

impl TargetReader {
    /// Snapshot of the current target. The borrow is released before returning.
    pub fn current(&self) -> RouteTarget {
        self.rx.borrow().clone()
    }
}

/// One serving unit built from one artifact.
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    /// Brings the worker up and returns where to route requests.
    async fn start(&mut self) -> Result<RouteTarget, WorkerError>;

    /// Takes the worker down. `graceful` lets it finish before being forced.
    async fn stop(&mut self, graceful: bool) -> Result<(), WorkerError>;

    /// Current route target, [`RouteTarget::Unavailable`] when not started.
    fn route_target(&self) -> RouteTarget;
}

/// Builds workers of one kind.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether only one worker may exist at a time (e.g. a fixed port), so the
    /// old worker has to be stopped before the new one starts.
    fn exclusive(&self) -> bool;

    /// Whether adopted artifacts need the executable bit.
    fn needs_executable(&self) -> bool;

    /// Checks an artifact before the current worker is disturbed.
    async fn preflight(&self, _artifact: &Path) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Creates an unstarted worker for `artifact`. Exits are reported on `control`.
    fn build(&self, artifact: &Path, generation: u64, control: ControlHandle) -> Box<dyn Worker>;
}
