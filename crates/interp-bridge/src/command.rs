//! Fire-and-forget statement channel.
//!
//! A [`StatementBatch`] is a list of source statements plus named inputs and
//! the names of outputs to read back afterwards. Each submitted batch runs
//! over its own connection, so a command that times out never blocks the
//! ones submitted after it.
//!
//! A timeout only stops the wait. The interpreter keeps executing; when the
//! late result arrives it is logged and dropped.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result, TransportErrorKind};
use crate::ipc::RpcClient;
use crate::marshal::{Marshaller, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Named values read back after a batch ran.
pub type CommandOutputs = BTreeMap<String, Value>;

/// Statements with their inputs and requested outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementBatch {
    pub statements: Vec<String>,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: Vec<String>,
    pub timeout: Option<Duration>,
}

impl StatementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(mut self, statement: impl Into<String>) -> Self {
        self.statements.push(statement.into());
        self
    }

    pub fn statements<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statements.extend(statements.into_iter().map(Into::into));
        self
    }

    /// Bind `name` in the namespace before the statements run.
    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Read `name` from the namespace after the statements ran.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Lifecycle of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Submitted,
    Running,
    Completed,
    TimedOut,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::TimedOut)
    }
}

/// Handle to a submitted batch.
#[derive(Debug)]
pub struct PendingCommand {
    id: Uuid,
    state: watch::Receiver<CommandState>,
    outcome: Arc<StdMutex<Option<Result<CommandOutputs>>>>,
}

impl PendingCommand {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CommandState {
        *self.state.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == CommandState::Completed
    }

    pub fn is_timed_out(&self) -> bool {
        self.state() == CommandState::TimedOut
    }

    /// Wait until the command completes or times out.
    pub async fn wait(&self) -> CommandState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }

    /// Take the outputs or the failure. `None` until the command is terminal
    /// and on every call after the first.
    pub fn outcome(&self) -> Option<Result<CommandOutputs>> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Decrements the in-flight counter when the command reaches a terminal state.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Submits statement batches to one endpoint.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    addr: SocketAddr,
    marshaller: Arc<Marshaller>,
    in_flight: Arc<watch::Sender<usize>>,
    debug: bool,
}

impl CommandChannel {
    /// Outputs are copied into `marshaller`'s spill directory, so they outlive
    /// the per-command connection.
    pub fn new(addr: SocketAddr, marshaller: Arc<Marshaller>) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            addr,
            marshaller,
            in_flight: Arc::new(in_flight),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn marshaller(&self) -> &Arc<Marshaller> {
        &self.marshaller
    }

    /// Submit `batch` and return immediately.
    pub fn async_exec(&self, batch: StatementBatch) -> PendingCommand {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(CommandState::Submitted);
        let outcome = Arc::new(StdMutex::new(None));
        let guard = InFlight::enter(&self.in_flight);

        let slot = outcome.clone();
        let addr = self.addr;
        let marshaller = self.marshaller.clone();
        let debug = self.debug;
        tokio::spawn(async move {
            let late_owner = marshaller.clone();
            let limit = batch.timeout;
            debug!(
                "Command {} submitted: {} statements, {} inputs",
                id,
                batch.statements.len(),
                batch.inputs.len()
            );
            state_tx.send_replace(CommandState::Running);

            let mut work = tokio::spawn(execute(addr, marshaller, debug, batch));
            let finished = match limit {
                Some(limit) => tokio::time::timeout(limit, &mut work).await.ok(),
                None => Some((&mut work).await),
            };

            match finished {
                Some(joined) => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(BridgeError::Other(format!("command task failed: {}", e)))
                    });
                    if let Err(e) = &result {
                        debug!("Command {} failed: {}", id, e);
                    }
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                    state_tx.send_replace(CommandState::Completed);
                    drop(guard);
                }
                None => {
                    let limit = limit.unwrap_or_default();
                    warn!(
                        "Command {} timed out after {:?}; the interpreter keeps running it",
                        id, limit
                    );
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(Err(BridgeError::Transport {
                            addr: addr.to_string(),
                            kind: TransportErrorKind::TimedOut,
                            message: format!("command {} did not finish within {:?}", id, limit),
                        }));
                    state_tx.send_replace(CommandState::TimedOut);
                    drop(guard);

                    match work.await {
                        Ok(Ok(outputs)) => {
                            let paths: Vec<_> = outputs.values().flat_map(Value::array_paths).collect();
                            let released = late_owner.release(paths);
                            info!(
                                "Command {} finished late; result discarded ({} spill files released)",
                                id, released
                            );
                        }
                        Ok(Err(e)) => info!("Command {} failed late: {}", id, e),
                        Err(e) => warn!("Command {} task failed: {}", id, e),
                    }
                }
            }
        });

        PendingCommand {
            id,
            state: state_rx,
            outcome,
        }
    }

    /// Submit `batch` and wait until it completes or times out.
    pub async fn sync_exec(&self, batch: StatementBatch) -> PendingCommand {
        let pending = self.async_exec(batch);
        pending.wait().await;
        pending
    }

    /// True while any submitted command is not yet terminal.
    pub fn is_active(&self) -> bool {
        self.in_flight() > 0
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no command is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn execute(
    addr: SocketAddr,
    marshaller: Arc<Marshaller>,
    debug: bool,
    batch: StatementBatch,
) -> Result<CommandOutputs> {
    let inputs = marshaller.enforce_inline_limit(Value::Map(batch.inputs))?;
    let args = vec![
        Value::List(batch.statements.into_iter().map(Value::String).collect()),
        inputs,
        Value::List(batch.outputs.into_iter().map(Value::String).collect()),
    ];

    let client = RpcClient::connect(addr, marshaller.clone()).await?;
    let result = match client.request(BridgeConfig::EXEC_HANDLER, args, debug).await {
        // Copy spilled outputs before the close lets the endpoint delete them.
        Ok(Ok(value)) => marshaller.adopt(value).and_then(into_outputs),
        Ok(Err(remote)) => Err(BridgeError::Remote(remote)),
        Err(e) => Err(e),
    };
    client.close().await;
    result
}

fn into_outputs(value: Value) -> Result<CommandOutputs> {
    match value {
        Value::Map(outputs) => Ok(outputs),
        Value::Null => Ok(CommandOutputs::new()),
        other => Err(BridgeError::protocol(format!(
            "{} returned {}, expected a map of outputs",
            BridgeConfig::EXEC_HANDLER,
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::handlers::{HandlerRegistry, HandlerResult};
    use crate::ipc::{RpcServer, RpcServerHandle};
    use tempfile::TempDir;

    /// Stand-in for the interpreter's `__exec__`: `sleep` pauses, `raise`
    /// fails, `ramp` binds a large output, outputs echo inputs.
    fn exec(
        statements: Vec<String>,
        inputs: BTreeMap<String, Value>,
        outputs: Vec<String>,
    ) -> HandlerResult<BTreeMap<String, Value>> {
        let mut namespace = inputs;
        for statement in &statements {
            match statement.as_str() {
                "sleep" => std::thread::sleep(Duration::from_millis(400)),
                "raise" => return Err(RemoteError::new("ZeroDivisionError", "division by zero")),
                "ramp" => {
                    let ramp = (0..2000).map(|i| Value::Float(i as f64)).collect();
                    namespace.insert("ramp".to_string(), Value::List(ramp));
                }
                _ => {}
            }
        }
        outputs
            .into_iter()
            .map(|name| match namespace.remove(&name) {
                Some(value) => Ok((name, value)),
                None => Err(RemoteError::new(
                    "NameError",
                    format!("name '{}' is not defined", name),
                )),
            })
            .collect()
    }

    async fn setup() -> (RpcServerHandle, CommandChannel, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = HandlerRegistry::new(Arc::new(Marshaller::new(64, dir.path().join("server"))));
        registry.register_fn(BridgeConfig::EXEC_HANDLER, exec).unwrap();
        let handle = RpcServer::start("127.0.0.1:0".parse().unwrap(), Arc::new(registry))
            .await
            .unwrap();
        let channel = CommandChannel::new(
            handle.addr(),
            Arc::new(Marshaller::new(64, dir.path().join("client"))),
        );
        (handle, channel, dir)
    }

    #[test]
    fn test_batch_builder() {
        let batch = StatementBatch::new()
            .statement("y = x * 2")
            .statements(["z = y + 1"])
            .input("x", 21i64)
            .output("z")
            .with_timeout(Duration::from_secs(1));

        assert_eq!(batch.statements.len(), 2);
        assert_eq!(batch.inputs.get("x"), Some(&Value::Int(21)));
        assert_eq!(batch.outputs, vec!["z".to_string()]);
        assert_eq!(batch.timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_exec_returns_outputs() {
        let (_handle, channel, _dir) = setup().await;

        let pending = channel
            .sync_exec(StatementBatch::new().statement("pass").input("x", 7i64).output("x"))
            .await;

        assert!(pending.is_complete());
        let outputs = pending.outcome().unwrap().unwrap();
        assert_eq!(outputs.get("x"), Some(&Value::Int(7)));
        assert!(pending.outcome().is_none());
        assert!(!channel.is_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_failure_completes_with_error() {
        let (_handle, channel, _dir) = setup().await;

        let pending = channel.sync_exec(StatementBatch::new().statement("raise")).await;

        assert_eq!(pending.state(), CommandState::Completed);
        let err = pending.outcome().unwrap().unwrap_err();
        assert!(err.remote().unwrap().is_type("ZeroDivisionError"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_does_not_block_later_commands() {
        let (_handle, channel, _dir) = setup().await;

        let slow = channel
            .sync_exec(
                StatementBatch::new()
                    .statement("sleep")
                    .with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(slow.is_timed_out());
        let err = slow.outcome().unwrap().unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::TimedOut));

        let fast = channel
            .sync_exec(StatementBatch::new().input("x", "ok").output("x"))
            .await;
        assert!(fast.is_complete());
        assert_eq!(
            fast.outcome().unwrap().unwrap().get("x"),
            Some(&Value::from("ok"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_outputs_are_released() {
        let (_handle, channel, _dir) = setup().await;

        let slow = channel
            .sync_exec(
                StatementBatch::new()
                    .statement("sleep")
                    .statement("ramp")
                    .output("ramp")
                    .with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(slow.is_timed_out());

        // The interpreter side finishes after about 400ms.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(channel.marshaller().owned_files().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clones_share_in_flight_counter() {
        let (_handle, channel, _dir) = setup().await;
        let other = channel.clone().with_debug(true);

        let pending = other.async_exec(StatementBatch::new().statement("sleep"));
        assert!(channel.is_active());
        assert_eq!(channel.in_flight(), 1);

        channel.wait_idle().await;
        assert!(pending.is_complete());
        assert!(!other.is_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_exec_tracks_in_flight() {
        let (_handle, channel, _dir) = setup().await;

        let pending = channel.async_exec(StatementBatch::new().statement("sleep"));
        assert!(channel.is_active());
        assert!(!pending.state().is_terminal());

        channel.wait_idle().await;
        assert!(pending.is_complete());
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spilled_outputs_are_adopted() {
        let (_handle, channel, dir) = setup().await;

        let pending = channel
            .sync_exec(StatementBatch::new().statement("ramp").output("ramp"))
            .await;
        let outputs = pending.outcome().unwrap().unwrap();

        let Some(Value::ArrayRef(reference)) = outputs.get("ramp") else {
            panic!("expected a spilled output, got {:?}", outputs.get("ramp"));
        };
        assert!(reference.path.starts_with(dir.path().join("client")));
        let values: Vec<f64> = channel
            .marshaller()
            .unflatten(Value::ArrayRef(reference.clone()))
            .unwrap();
        assert_eq!(values.len(), 2000);
        assert_eq!(values[1999], 1999.0);
    }
}
