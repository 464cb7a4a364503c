//! External-process worker.
//!
//! The artifact is executed with `PORT` set to a fixed local port. A watcher task
//! owns the child, waits for it to exit, classifies the exit from its status and
//! reports it on the control channel. Stopping goes through the watcher too, so
//! the stop flag is always set before the signal that causes the exit is sent.
use super::{Backend, RouteTarget, Worker};
use crate::errors::WorkerError;
use crate::signal::{ControlHandle, ExitCause};
use async_trait::async_trait;
use bon::Builder;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SPAWN_ATTEMPTS: u32 = 3;

/// Runs artifacts as executables listening on `port`.
#[derive(Debug, Clone, Builder)]
pub struct ProcessBackend {
    /// Port injected as `PORT` and forwarded to.
    #[builder(default = 6060)]
    port: u16,
    /// How long to wait for the port to accept connections after spawning.
    /// A worker still running when this elapses is treated as live.
    #[builder(default = Duration::from_secs(10))]
    ready_timeout: Duration,
    /// How long a graceful stop waits after SIGTERM before killing.
    #[builder(default = Duration::from_secs(5))]
    stop_timeout: Duration,
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn exclusive(&self) -> bool {
        true
    }

    fn needs_executable(&self) -> bool {
        true
    }

    async fn preflight(&self, artifact: &Path) -> Result<(), WorkerError> {
        let metadata = tokio::fs::metadata(artifact)
            .await
            .map_err(|e| WorkerError::Load {
                path: artifact.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(WorkerError::Load {
                path: artifact.to_path_buf(),
                reason: "not a non-empty regular file".to_string(),
            });
        }
        Ok(())
    }

    fn build(&self, artifact: &Path, generation: u64, control: ControlHandle) -> Box<dyn Worker> {
        Box::new(ProcessWorker {
            artifact: artifact.to_path_buf(),
            generation,
            port: self.port,
            ready_timeout: self.ready_timeout,
            stop_timeout: self.stop_timeout,
            control,
            running: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct StopRequest {
    graceful: bool,
}

#[derive(Debug)]
struct Running {
    pid: Option<u32>,
    target: RouteTarget,
    stop_requested: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    exited: watch::Receiver<Option<ExitCause>>,
}

/// One spawned process.
#[derive(Debug)]
pub struct ProcessWorker {
    artifact: PathBuf,
    generation: u64,
    port: u16,
    ready_timeout: Duration,
    stop_timeout: Duration,
    control: ControlHandle,
    running: Option<Running>,
}

impl ProcessWorker {
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    fn spawn_error(&self, reason: impl Into<String>) -> WorkerError {
        WorkerError::Spawn {
            path: self.artifact.clone(),
            reason: reason.into(),
        }
    }

    async fn spawn_child(&self) -> Result<Child, WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = Command::new(&self.artifact)
                .env("PORT", self.port.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            match result {
                Ok(child) => return Ok(child),
                // A freshly written artifact can still be open for writing in a
                // concurrently forked child for a moment.
                Err(e)
                    if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
                        && attempt < SPAWN_ATTEMPTS =>
                {
                    debug!(attempt, artifact = %self.artifact.display(), "Executable busy, retrying spawn");
                    tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                }
                Err(e) => return Err(self.spawn_error(e.to_string())),
            }
        }
    }

    async fn wait_until_live(
        &self,
        exited: &mut watch::Receiver<Option<ExitCause>>,
    ) -> Result<(), WorkerError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(cause) = *exited.borrow() {
                return Err(self.spawn_error(format!("exited before becoming live ({cause})")));
            }
            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    generation = self.generation,
                    port = self.port,
                    "Worker is running but not accepting connections yet, treating as live"
                );
                return Ok(());
            }
            tokio::select! {
                _ = exited.changed() => {}
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn start(&mut self) -> Result<RouteTarget, WorkerError> {
        if self.running.is_some() {
            return Ok(self.route_target());
        }

        let base = Url::parse(&format!("http://127.0.0.1:{}/", self.port))
            .map_err(|e| self.spawn_error(e.to_string()))?;
        let child = self.spawn_child().await?;
        let pid = child.id();
        info!(
            generation = self.generation,
            pid,
            port = self.port,
            artifact = %self.artifact.display(),
            "Spawned worker process"
        );

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, mut exited) = watch::channel(None);
        tokio::spawn(watch_exit(
            child,
            self.generation,
            Arc::clone(&stop_requested),
            stop_rx,
            exit_tx,
            self.control.clone(),
            self.stop_timeout,
        ));

        let target = RouteTarget::Process {
            base,
            generation: self.generation,
            pid,
        };
        self.running = Some(Running {
            pid,
            target: target.clone(),
            stop_requested,
            stop_tx: Some(stop_tx),
            exited: exited.clone(),
        });

        if let Err(e) = self.wait_until_live(&mut exited).await {
            if let Err(stop_err) = self.stop(false).await {
                warn!(error = %stop_err, "Failed to clean up worker that did not come up");
            }
            return Err(e);
        }
        Ok(target)
    }

    async fn stop(&mut self, graceful: bool) -> Result<(), WorkerError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        running.stop_requested.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = running.stop_tx.take() {
            // The watcher is gone only if the process already exited.
            let _ = stop_tx.send(StopRequest { graceful });
        }

        let bound = self.stop_timeout + Duration::from_secs(5);
        match tokio::time::timeout(bound, running.exited.wait_for(Option::is_some)).await {
            Ok(_) => {
                debug!(generation = self.generation, pid = running.pid, "Worker stopped");
                Ok(())
            }
            Err(_) => Err(WorkerError::Stop(format!(
                "process {:?} did not exit within {bound:?}",
                running.pid
            ))),
        }
    }

    fn route_target(&self) -> RouteTarget {
        self.running
            .as_ref()
            .map(|r| r.target.clone())
            .unwrap_or(RouteTarget::Unavailable)
    }
}

async fn watch_exit(
    mut child: Child,
    generation: u64,
    stop_requested: Arc<AtomicBool>,
    stop_rx: oneshot::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<ExitCause>>,
    control: ControlHandle,
    stop_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = stop_rx => {
            // A dropped worker counts as a request to stop.
            stop_requested.store(true, Ordering::SeqCst);
            let graceful = request.map(|r| r.graceful).unwrap_or(false);
            if graceful {
                terminate_gracefully(&mut child, stop_timeout).await
            } else {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };

    let cause = classify_exit(status.as_ref().ok(), stop_requested.load(Ordering::SeqCst));
    match &status {
        Ok(status) => info!(generation, %cause, status = %describe_status(status), "Worker process exited"),
        Err(e) => warn!(generation, %cause, error = %e, "Failed waiting on worker process"),
    }

    // Publish before enqueueing: `stop` waits on this, and the supervisor may be
    // inside `stop` and not draining the channel.
    exit_tx.send_replace(Some(cause));
    control.worker_exited(generation, cause).await;
}

async fn terminate_gracefully(
    child: &mut Child,
    stop_timeout: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed, killing");
        } else if let Ok(status) = tokio::time::timeout(stop_timeout, child.wait()).await {
            return status;
        } else {
            warn!(pid, ?stop_timeout, "Worker ignored SIGTERM, killing");
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

/// Maps a process exit to its cause.
///
/// A stop requested by the supervisor always yields `KilledBySupervisor`,
/// whatever the status says. Otherwise status 0 is a normal exit and anything
/// else (a non-zero code, a signal, or no status at all) is a crash.
pub fn classify_exit(status: Option<&ExitStatus>, stop_requested: bool) -> ExitCause {
    if stop_requested {
        return ExitCause::KilledBySupervisor;
    }
    match status {
        Some(status) if status.success() => ExitCause::NormalExit,
        _ => ExitCause::Crashed,
    }
}

fn describe_status(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return match Signal::try_from(sig) {
                Ok(sig) => format!("terminated by {sig}"),
                Err(_) => format!("terminated by signal {sig}"),
            };
        }
    }
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "exited".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ControlChannel, UpgradeSignal, control_channel};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn backend(port: u16) -> ProcessBackend {
        ProcessBackend::builder()
            .port(port)
            .ready_timeout(Duration::from_millis(100))
            .stop_timeout(Duration::from_secs(2))
            .build()
    }

    async fn next_exit(channel: &mut ControlChannel) -> (u64, ExitCause) {
        let signal = tokio::time::timeout(Duration::from_secs(10), channel.recv())
            .await
            .expect("no exit reported")
            .expect("channel closed");
        match signal {
            UpgradeSignal::WorkerExited { generation, cause } => (generation, cause),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn test_classify_exit_from_structured_status() {
        let exited_ok = ExitStatus::from_raw(0);
        let exited_err = ExitStatus::from_raw(3 << 8);
        let killed = ExitStatus::from_raw(Signal::SIGKILL as i32);
        let segv = ExitStatus::from_raw(Signal::SIGSEGV as i32);

        assert_eq!(classify_exit(Some(&exited_ok), false), ExitCause::NormalExit);
        assert_eq!(classify_exit(Some(&exited_err), false), ExitCause::Crashed);
        assert_eq!(classify_exit(Some(&killed), false), ExitCause::Crashed);
        assert_eq!(classify_exit(Some(&segv), false), ExitCause::Crashed);
        assert_eq!(classify_exit(None, false), ExitCause::Crashed);

        assert_eq!(
            classify_exit(Some(&killed), true),
            ExitCause::KilledBySupervisor
        );
        assert_eq!(
            classify_exit(Some(&exited_ok), true),
            ExitCause::KilledBySupervisor
        );
    }

    #[test]
    fn test_describe_status() {
        assert_eq!(
            describe_status(&ExitStatus::from_raw(2 << 8)),
            "exited with code 2"
        );
        assert!(describe_status(&ExitStatus::from_raw(Signal::SIGKILL as i32)).contains("SIGKILL"));
    }

    #[tokio::test]
    async fn test_stop_reports_killed_by_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = script(dir.path(), "app", "exec sleep 30");
        let (control, mut channel) = control_channel(8);

        let mut worker = backend(39101).build(&artifact, 1, control);
        let target = worker.start().await.unwrap();
        assert_eq!(target.generation(), Some(1));
        assert!(matches!(worker.route_target(), RouteTarget::Process { pid: Some(_), .. }));

        worker.stop(false).await.unwrap();

        assert_eq!(next_exit(&mut channel).await, (1, ExitCause::KilledBySupervisor));
        assert!(matches!(worker.route_target(), RouteTarget::Unavailable));
    }

    #[tokio::test]
    async fn test_graceful_stop_lets_worker_exit_on_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = script(
            dir.path(),
            "app",
            "trap 'exit 0' TERM\nwhile true; do sleep 0.05; done",
        );
        let (control, mut channel) = control_channel(8);

        let mut worker = backend(39102).build(&artifact, 4, control);
        worker.start().await.unwrap();
        worker.stop(true).await.unwrap();

        assert_eq!(next_exit(&mut channel).await, (4, ExitCause::KilledBySupervisor));
    }

    #[tokio::test]
    async fn test_out_of_band_kill_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = script(dir.path(), "app", "exec sleep 30");
        let (control, mut channel) = control_channel(8);

        let mut worker = ProcessBackend::builder()
            .port(39103)
            .ready_timeout(Duration::from_millis(100))
            .build()
            .build(&artifact, 2, control);
        worker.start().await.unwrap();
        let pid = match worker.route_target() {
            RouteTarget::Process { pid: Some(pid), .. } => pid,
            other => panic!("unexpected target {other}"),
        };

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

        assert_eq!(next_exit(&mut channel).await, (2, ExitCause::Crashed));
    }

    #[tokio::test]
    async fn test_clean_exit_is_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = script(dir.path(), "app", "sleep 0.5\nexit 0");
        let (control, mut channel) = control_channel(8);

        let mut worker = backend(39104).build(&artifact, 3, control);
        worker.start().await.unwrap();

        assert_eq!(next_exit(&mut channel).await, (3, ExitCause::NormalExit));
    }

    #[tokio::test]
    async fn test_exit_before_live_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = script(dir.path(), "app", "exit 7");
        let (control, mut channel) = control_channel(8);

        let mut worker = ProcessBackend::builder()
            .port(39105)
            .ready_timeout(Duration::from_secs(5))
            .build()
            .build(&artifact, 5, control);
        let result = worker.start().await;

        assert!(matches!(result, Err(WorkerError::Spawn { .. })));
        let (generation, _) = next_exit(&mut channel).await;
        assert_eq!(generation, 5);
        assert!(matches!(worker.route_target(), RouteTarget::Unavailable));
    }

    #[tokio::test]
    async fn test_port_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("port");
        let artifact = script(
            dir.path(),
            "app",
            &format!("echo \"$PORT\" > {}\nexec sleep 30", out.display()),
        );
        let (control, _channel) = control_channel(8);

        let mut worker = backend(39106).build(&artifact, 1, control);
        worker.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !out.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "39106");
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let (control, _channel) = control_channel(8);
        let backend = backend(39107);
        let missing = dir.path().join("nope");

        let mut worker = backend.build(&missing, 1, control);
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::Spawn { .. })
        ));
        assert!(matches!(
            backend.preflight(&missing).await,
            Err(WorkerError::Load { .. })
        ));
    }
}
