use crate::config::{BackendConfig, RestartPolicy};
use crate::error::SpawnError;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound for a single readiness check
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of the backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// `start` has not been called yet
    NotStarted,
    /// Process is running, waiting for its port to answer
    Starting,
    /// Process is running and ready to accept traffic
    Ready,
    /// Process exited without being asked to
    Crashed,
    /// Supervisor shut the process down; terminal
    Stopped,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::NotStarted => "not_started",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Crashed => "crashed",
            BackendState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the running backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendHandle {
    pub pid: Option<u32>,
    pub port: u16,
}

/// Point-in-time view of the backend for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub state: BackendState,
    pub pid: Option<u32>,
    pub port: u16,
    /// Exit code of the last process generation, if it has exited
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

/// Mutable bookkeeping guarded by the supervisor's lock
#[derive(Default)]
struct Lifecycle {
    pid: Option<u32>,
    exit_code: Option<i32>,
    restarts: u32,
    /// Set once `stop` has been called; blocks further spawns
    stopping: bool,
    /// Tells the watcher task to terminate the child
    stop_tx: Option<watch::Sender<bool>>,
    watcher: Option<JoinHandle<()>>,
}

/// Owns the backend child process and publishes its lifecycle state.
///
/// The state is kept in a `watch` channel: [`subscribe`](Self::subscribe)
/// hands out receivers that can read it but never change it. The child handle
/// itself belongs to a background watcher task that notices unexpected exits,
/// applies the restart policy and carries out termination on [`stop`](Self::stop).
///
/// ```ignore
/// let supervisor = ProcessSupervisor::new(config.backend.clone());
/// supervisor.start()?;
/// tokio::spawn({
///     let supervisor = Arc::clone(&supervisor);
///     async move { supervisor.await_ready(timeout).await }
/// });
/// ```
pub struct ProcessSupervisor {
    config: BackendConfig,
    state_tx: watch::Sender<BackendState>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProcessSupervisor {
    /// Create a supervisor for `config`. Nothing is spawned until `start`.
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BackendState::NotStarted);
        Arc::new(Self {
            config,
            state_tx,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> BackendState {
        *self.state_tx.borrow()
    }

    /// Read-only view of the lifecycle state
    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state_tx.subscribe()
    }

    pub fn handle(&self) -> BackendHandle {
        BackendHandle {
            pid: self.lifecycle.lock().pid,
            port: self.config.port,
        }
    }

    pub fn status(&self) -> BackendStatus {
        let lifecycle = self.lifecycle.lock();
        BackendStatus {
            state: self.state(),
            pid: lifecycle.pid,
            port: self.config.port,
            exit_code: lifecycle.exit_code,
            restarts: lifecycle.restarts,
        }
    }

    /// Spawn the backend and move to `Starting`.
    ///
    /// Returns the existing handle if the backend is already starting, ready,
    /// or waiting out a restart backoff.
    pub fn start(self: &Arc<Self>) -> Result<BackendHandle, SpawnError> {
        let mut lifecycle = self.lifecycle.lock();

        if lifecycle.stopping {
            return Err(SpawnError::SupervisorStopped);
        }

        let watcher_running = lifecycle
            .watcher
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished());

        match self.state() {
            BackendState::Starting | BackendState::Ready => {
                debug!("Backend already running or starting");
                return Ok(BackendHandle {
                    pid: lifecycle.pid,
                    port: self.config.port,
                });
            }
            BackendState::Crashed if watcher_running => {
                debug!("Backend restart already scheduled");
                return Ok(BackendHandle {
                    pid: lifecycle.pid,
                    port: self.config.port,
                });
            }
            BackendState::Stopped => return Err(SpawnError::SupervisorStopped),
            BackendState::NotStarted | BackendState::Crashed => {}
        }

        let child = self.spawn_child()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        lifecycle.pid = child.id();
        lifecycle.exit_code = None;
        lifecycle.stop_tx = Some(stop_tx);
        self.state_tx.send_replace(BackendState::Starting);

        let supervisor = Arc::clone(self);
        lifecycle.watcher = Some(tokio::spawn(async move {
            supervisor.watch_child(child, stop_rx).await;
        }));

        Ok(BackendHandle {
            pid: lifecycle.pid,
            port: self.config.port,
        })
    }

    /// Build and spawn the child command
    fn spawn_child(&self) -> Result<Child, SpawnError> {
        let argv = self.config.argv()?;
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group: a terminal Ctrl+C reaches the front door only,
        // and the supervisor decides when the backend goes down.
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(ref working_dir) = self.config.working_dir {
            if !Path::new(working_dir).is_dir() {
                return Err(SpawnError::InvalidWorkingDir {
                    path: working_dir.clone(),
                });
            }
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", self.config.port.to_string());

        info!(command = %self.config.command, port = self.config.port, "Starting backend");

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SpawnError::CommandNotFound {
                command: program.clone(),
            },
            _ => SpawnError::Io(e),
        })?;

        info!(pid = child.id().unwrap_or(0), "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(stream_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stream_output(stderr, "stderr"));
        }

        Ok(child)
    }

    /// Watch one child generation after another until stopped or given up
    async fn watch_child(self: Arc<Self>, mut child: Child, mut stop_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let exit_code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(error = %e, "Failed to wait on backend process");
                            None
                        }
                    };

                    let Some(backoff) = self.record_exit(exit_code) else {
                        return;
                    };

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_rx.changed() => {
                            debug!("Stop requested during restart backoff");
                            self.mark_stopped();
                            return;
                        }
                    }

                    match self.respawn() {
                        Ok(next) => child = next,
                        Err(e) => {
                            error!(error = %e, "Failed to restart backend");
                            return;
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    self.terminate(&mut child).await;
                    self.mark_stopped();
                    return;
                }
            }
        }
    }

    /// Record an unexpected exit. Returns the backoff before a restart, or
    /// `None` when the backend stays down.
    fn record_exit(&self, exit_code: Option<i32>) -> Option<Duration> {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.pid = None;
        lifecycle.exit_code = exit_code;

        if lifecycle.stopping {
            return None;
        }

        self.state_tx.send_replace(BackendState::Crashed);
        error!(?exit_code, "Backend exited unexpectedly");

        let restart = &self.config.restart;
        match restart.policy {
            RestartPolicy::Never => None,
            RestartPolicy::OnFailure if lifecycle.restarts < restart.max_restarts => {
                lifecycle.restarts += 1;
                info!(
                    attempt = lifecycle.restarts,
                    max_restarts = restart.max_restarts,
                    backoff_ms = restart.backoff_ms,
                    "Scheduling backend restart"
                );
                Some(restart.backoff())
            }
            RestartPolicy::OnFailure => {
                error!(
                    max_restarts = restart.max_restarts,
                    "Restart limit reached, backend stays down"
                );
                None
            }
        }
    }

    /// Spawn the next generation after a crash and check it in the background
    fn respawn(self: &Arc<Self>) -> Result<Child, SpawnError> {
        let child = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stopping {
                return Err(SpawnError::SupervisorStopped);
            }
            let child = self.spawn_child()?;
            lifecycle.pid = child.id();
            lifecycle.exit_code = None;
            self.state_tx.send_replace(BackendState::Starting);
            child
        };

        let supervisor = Arc::clone(self);
        let timeout = self.config.startup_timeout();
        tokio::spawn(async move {
            supervisor.await_ready(timeout).await;
        });

        Ok(child)
    }

    /// Stop the child with SIGTERM, escalating to SIGKILL after the grace period
    async fn terminate(&self, child: &mut Child) {
        let grace_period = self.config.shutdown_grace_period();

        let pid = child.id();

        if let Some(pid) = pid {
            info!(pid, "Sending SIGTERM to backend");

            // The child leads its own process group; signal the whole group so
            // wrappers like `npm start` take their server down with them.
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        let exit_code = match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Backend process exited gracefully");
                status.code()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend to exit");
                None
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill backend process");
                }
                None
            }
        };

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.pid = None;
        lifecycle.exit_code = exit_code;
    }

    /// Stop the backend and move to `Stopped`. Safe to call any number of
    /// times, in any state.
    ///
    /// Returns only once the child is gone: a call that overlaps another one
    /// waits for that call's termination to finish.
    pub async fn stop(&self) {
        let (stop_tx, watcher, already_stopping) = {
            let mut lifecycle = self.lifecycle.lock();
            let already_stopping = lifecycle.stopping;
            lifecycle.stopping = true;
            (
                lifecycle.stop_tx.take(),
                lifecycle.watcher.take(),
                already_stopping,
            )
        };

        if let Some(stop_tx) = stop_tx {
            // The watcher may already be gone after a crash
            let _ = stop_tx.send(true);
        }

        match watcher {
            Some(watcher) => {
                if let Err(e) = watcher.await {
                    warn!(error = %e, "Backend watcher task failed");
                }
            }
            None if already_stopping => {
                debug!("Stop already in progress, waiting for it");
                let mut state_rx = self.subscribe();
                let _ = state_rx.wait_for(|state| *state == BackendState::Stopped).await;
                return;
            }
            None => {}
        }

        self.mark_stopped();
    }

    fn mark_stopped(&self) {
        let previous = self.state_tx.send_replace(BackendState::Stopped);
        if previous != BackendState::Stopped {
            info!(%previous, "Backend stopped");
        }
    }

    /// Poll the backend until it answers or `timeout` passes.
    ///
    /// Moves `Starting` to `Ready` on success. On timeout the state is left
    /// alone and `false` is returned; a crash or stop ends the wait early.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let interval = self.config.health_check_interval();
        let deadline = Instant::now() + timeout;
        let mut state_rx = self.subscribe();

        debug!(address = %self.config.address(), health_path = ?self.config.health_path, "Waiting for backend readiness");

        loop {
            match self.state() {
                BackendState::Ready => return true,
                BackendState::Starting => {}
                state => {
                    debug!(%state, "Readiness wait ended, backend is not starting");
                    return false;
                }
            }

            // A single check never runs past the deadline
            let budget = CHECK_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            if self.check_once(budget).await {
                if self.mark_ready() {
                    info!(port = self.config.port, "Backend is now ready");
                }
                return self.state() == BackendState::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Backend did not become ready within the startup grace period"
                );
                return false;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
                _ = state_rx.changed() => {}
            }
        }
    }

    /// `Starting` -> `Ready`; any other state is left untouched
    fn mark_ready(&self) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == BackendState::Starting {
                *state = BackendState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// One readiness check, bounded by `budget` end to end
    async fn check_once(&self, budget: Duration) -> bool {
        let address = self.config.address();
        match self.config.health_path {
            Some(ref path) => check_health(&address, path, budget).await,
            None => matches!(
                tokio::time::timeout(budget, TcpStream::connect(&address)).await,
                Ok(Ok(_))
            ),
        }
    }
}

/// Issue `GET path` over a fresh connection and accept any 2xx status.
/// Connect and read share the same `budget`.
async fn check_health(address: &str, path: &str, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;

    let mut stream = match tokio::time::timeout_at(deadline, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, address
    );

    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout_at(deadline, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .is_some_and(|code| (200..300).contains(&code)),
        _ => false,
    }
}

/// Forward the child's output into the log, one event per line
async fn stream_output<R>(output: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if stream == "stderr" {
                    warn!(target: "backend", stream, "{}", line);
                } else {
                    info!(target: "backend", stream, "{}", line);
                }
            }
        }
    }

    debug!(stream, "Backend output closed");
}
