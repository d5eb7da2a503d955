//! Spawning, readiness and shutdown of interpreter endpoints.

use super::{InterpreterCommand, PortAllocator};
use crate::config::{BridgeConfig, EnvVars, SupervisorConfig};
use crate::error::{BridgeError, Result};
use crate::ipc::RpcClient;
use crate::marshal::Marshaller;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const INTERPRETER_TARGET: &str = "interp_bridge::interpreter";

/// Last lines the child wrote to stderr, kept for error reports.
#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<StdMutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == BridgeConfig::STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// A freshly spawned child with its output forwarders.
struct Spawned {
    child: Child,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

enum ReadyFailure {
    BindConflict,
    Failed(BridgeError),
}

/// Launches interpreter endpoints on deterministic ports.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    ports: Arc<PortAllocator>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let ports = Arc::new(PortAllocator::from_config(&config));
        Self { config, ports }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Start `command` on `port` without waiting for it to listen.
    ///
    /// The spill directory and inline threshold are passed down only when
    /// the parent environment or the command does not already set them.
    pub fn spawn(&self, command: &InterpreterCommand, port: u16) -> Result<Child> {
        self.spawn_child(command, port).map(|spawned| spawned.child)
    }

    fn spawn_child(&self, command: &InterpreterCommand, port: u16) -> Result<Spawned> {
        let command = command
            .clone()
            .set_if_absent(EnvVars::SPILL_DIR, self.config.spill_dir.to_string_lossy())
            .set_if_absent(
                EnvVars::INLINE_THRESHOLD,
                self.config.inline_threshold.to_string(),
            );

        let mut cmd = Command::new(&command.executable);
        cmd.args(command.args(port))
            .envs(command.resolved_env(|name| std::env::var_os(name)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        debug!(
            "Spawning {:?} {:?}",
            command.executable,
            command.args(port)
        );
        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            executable: command.executable.clone(),
            message: e.to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, port, None));
        }
        let stderr_tail = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_output(stderr, port, Some(stderr_tail.clone()))));

        Ok(Spawned {
            child,
            stderr_tail,
            stderr_task,
        })
    }

    /// Allocate a port, spawn the endpoint and wait until it answers `ping`.
    ///
    /// A child that exits with the bind-conflict status is retried on the
    /// next candidate port within the allocator's attempt budget.
    pub async fn launch(
        &self,
        handle: &str,
        command: &InterpreterCommand,
        marshaller: Arc<Marshaller>,
    ) -> Result<InterpreterProcess> {
        let mut next_attempt = 0;

        loop {
            let (port, attempt) = self.ports.probe(handle, next_attempt)?;
            next_attempt = attempt + 1;

            let mut spawned = match self.spawn_child(command, port) {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.ports.release(port);
                    return Err(e);
                }
            };

            match self.wait_ready(&mut spawned, port, &marshaller).await {
                Ok(client) => {
                    let pid = spawned.child.id();
                    let client = match self.config.call_timeout {
                        Some(limit) => client.with_call_timeout(limit),
                        None => client,
                    };
                    info!(
                        "Interpreter {} ready on port {} (pid {:?})",
                        handle, port, pid
                    );
                    return Ok(InterpreterProcess {
                        handle: handle.to_string(),
                        port,
                        pid,
                        client: Arc::new(client),
                        child: Mutex::new(Some(spawned.child)),
                        stderr_tail: spawned.stderr_tail,
                        ports: self.ports.clone(),
                        config: self.config.clone(),
                        stopped: AtomicBool::new(false),
                    });
                }
                Err(ReadyFailure::BindConflict) => {
                    warn!(
                        "Interpreter {} could not bind port {}, probing next",
                        handle, port
                    );
                    self.ports.release(port);
                }
                Err(ReadyFailure::Failed(e)) => {
                    self.ports.release(port);
                    return Err(e);
                }
            }
        }
    }

    async fn wait_ready(
        &self,
        spawned: &mut Spawned,
        port: u16,
        marshaller: &Arc<Marshaller>,
    ) -> std::result::Result<RpcClient, ReadyFailure> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;

        loop {
            match spawned.child.try_wait() {
                Ok(Some(status)) => return Err(self.early_exit(spawned, status).await),
                Ok(None) => {}
                Err(e) => return Err(ReadyFailure::Failed(e.into())),
            }

            if let Ok(client) = RpcClient::connect(addr, marshaller.clone()).await {
                match timeout(self.config.liveness_timeout, client.ping()).await {
                    Ok(Ok(())) => {
                        debug!("Port {} answered ping after {:?}", port, started.elapsed());
                        return Ok(client);
                    }
                    Ok(Err(e)) => debug!("Port {} not ready yet: {}", port, e),
                    Err(_) => debug!("Ping to port {} timed out", port),
                }
                client.close().await;
            }

            if Instant::now() >= deadline {
                if let Err(e) = spawned.child.kill().await {
                    warn!("Failed to kill unready interpreter on port {}: {}", port, e);
                }
                return Err(ReadyFailure::Failed(BridgeError::NotReady {
                    port,
                    timeout: self.config.ready_timeout,
                }));
            }
            sleep(BridgeConfig::READY_POLL_INTERVAL).await;
        }
    }

    async fn early_exit(&self, spawned: &mut Spawned, status: ExitStatus) -> ReadyFailure {
        if status.code() == Some(BridgeConfig::BIND_CONFLICT_EXIT_CODE) {
            return ReadyFailure::BindConflict;
        }
        // Let the forwarder drain whatever the child wrote before exiting.
        if let Some(task) = spawned.stderr_task.as_mut() {
            let _ = timeout(Duration::from_millis(500), task).await;
        }
        ReadyFailure::Failed(BridgeError::ChildExited {
            status: status.to_string(),
            stderr_tail: spawned.stderr_tail.snapshot(),
        })
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::from_env())
    }
}

async fn forward_output<R>(reader: R, port: u16, tail: Option<StderrTail>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match &tail {
                Some(tail) => {
                    info!(target: INTERPRETER_TARGET, port, "{}", line);
                    tail.push(line);
                }
                None if line.starts_with(BridgeConfig::READY_LINE_PREFIX) => {
                    debug!(target: INTERPRETER_TARGET, port, "{}", line);
                }
                None => info!(target: INTERPRETER_TARGET, port, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Output from interpreter on port {} ended: {}", port, e);
                break;
            }
        }
    }
}

/// A running interpreter endpoint and the client bound to it.
///
/// Dropping the value kills the child; [`stop`](Self::stop) asks it to exit
/// cleanly first.
#[derive(Debug)]
pub struct InterpreterProcess {
    handle: String,
    port: u16,
    pid: Option<u32>,
    client: Arc<RpcClient>,
    child: Mutex<Option<Child>>,
    stderr_tail: StderrTail,
    ports: Arc<PortAllocator>,
    config: SupervisorConfig,
    stopped: AtomicBool,
}

impl InterpreterProcess {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Recent stderr lines from the child.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// True when the endpoint answers `ping` within the liveness timeout.
    ///
    /// Uses its own connection so a long call on the main client does not
    /// make the endpoint look dead.
    pub async fn is_alive(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let probe = async {
            let client = RpcClient::connect(self.client.addr(), self.client.marshaller().clone()).await?;
            let result = client.ping().await;
            client.close().await;
            result
        };
        matches!(
            timeout(self.config.liveness_timeout, probe).await,
            Ok(Ok(()))
        )
    }

    /// Stop the endpoint. Safe to call more than once.
    ///
    /// Shutdown-request failures are logged and ignored; the child is always
    /// terminated and its port released.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping interpreter {} on port {}", self.handle, self.port);

        match timeout(self.config.shutdown_grace, self.client.request_shutdown()).await {
            Ok(Ok(())) => debug!("Interpreter {} accepted shutdown", self.handle),
            Ok(Err(e)) => debug!("Shutdown request to {} failed: {}", self.handle, e),
            Err(_) => debug!("Shutdown request to {} timed out", self.handle),
        }
        self.client.close().await;

        if let Some(mut child) = self.child.lock().await.take() {
            terminate(&mut child, self.config.shutdown_grace, self.config.kill_timeout).await;
        }

        self.ports.release(self.port);
        let removed = self.client.marshaller().cleanup();
        if removed > 0 {
            debug!("Removed {} spill files for {}", removed, self.handle);
        }
    }
}

impl Drop for InterpreterProcess {
    fn drop(&mut self) {
        // After stop() the port may already belong to a newer instance.
        if !self.is_stopped() {
            self.ports.release(self.port);
        }
    }
}

/// Wait for `child` to exit, escalating to SIGTERM and then a hard kill.
async fn terminate(child: &mut Child, grace: Duration, kill_timeout: Duration) {
    if let Ok(status) = timeout(grace, child.wait()).await {
        debug!("Interpreter exited: {:?}", status);
        return;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to interpreter {}", pid);
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if timeout(kill_timeout, child.wait()).await.is_ok() {
                        debug!("Interpreter {} terminated gracefully", pid);
                        return;
                    }
                }
                Err(Errno::ESRCH) => return,
                Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = kill_timeout;

    warn!("Interpreter did not exit, killing");
    if let Err(e) = child.kill().await {
        warn!("Failed to kill interpreter: {}", e);
    }
}
