//! TCP server side of the bridge.
//!
//! Binds a local port, accepts connections, and hands each decoded request to
//! an [`RpcDispatch`]. Every connection is served by its own task and
//! processes one request at a time.
//!
//! The reserved `shutdown` name is answered here, not by the dispatcher: the
//! server replies `null` and then stops accepting and closes all connections.
//!
//! Spill files referenced by a response stay on disk until the next request
//! arrives on the same connection or the connection closes, then
//! [`RpcDispatch::release`] is called with their paths.

use super::protocol::{read_frame, write_frame, Request, Response, RpcRequest, RpcResponse};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, RemoteError, Result};
use crate::marshal::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and close the active ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the server has been told to stop, locally or by a `shutdown` request.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        wait_for_stop(&mut rx).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Dispatches decoded requests to handlers.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    /// Run one request and produce its outcome.
    async fn dispatch(&self, request: Request) -> Response;

    /// The peer has consumed these response spill files.
    fn release(&self, paths: Vec<PathBuf>) {
        let _ = paths;
    }
}

/// Server that accepts bridge connections.
pub struct RpcServer;

impl RpcServer {
    /// Bind `addr` and start serving in background tasks.
    pub async fn start<D: RpcDispatch>(addr: SocketAddr, dispatch: Arc<D>) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::transport(addr, &e))?;
        Self::serve(listener, dispatch)
    }

    /// Serve on an already bound listener.
    pub fn serve<D: RpcDispatch>(listener: TcpListener, dispatch: Arc<D>) -> Result<RpcServerHandle> {
        let addr = listener.local_addr()?;
        info!("Bridge server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_tx.clone(),
            shutdown_rx,
            active_connections,
        ));

        Ok(RpcServerHandle {
            addr,
            shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: RpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        shutdown_tx: Arc<watch::Sender<bool>>,
        mut shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown_rx) => {
                    info!("Bridge server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= BridgeConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    BridgeConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let shutdown_tx = shutdown_tx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*dispatch, &shutdown_tx).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: RpcDispatch>(
        mut stream: TcpStream,
        dispatch: &D,
        shutdown_tx: &watch::Sender<bool>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let (mut reader, mut writer) = stream.split();
        let mut unreleased: Vec<PathBuf> = Vec::new();

        let outcome = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = wait_for_stop(&mut shutdown_rx) => break Ok(()),
            };

            if !unreleased.is_empty() {
                dispatch.release(std::mem::take(&mut unreleased));
            }

            let (response, stop_after) = Self::process_request(&frame, dispatch).await;
            if let Some(result) = &response.result {
                unreleased = result.array_paths();
            }

            let response_bytes = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => break Err(e.into()),
            };
            if let Err(e) = write_frame(&mut writer, &response_bytes).await {
                break Err(e);
            }

            if stop_after {
                info!("Shutdown requested by peer");
                let _ = shutdown_tx.send(true);
                break Ok(());
            }
        };

        if !unreleased.is_empty() {
            dispatch.release(unreleased);
        }
        outcome
    }

    /// Decode one frame and run it. The flag is set for a `shutdown` request.
    async fn process_request<D: RpcDispatch>(frame: &[u8], dispatch: &D) -> (RpcResponse, bool) {
        let json: serde_json::Value = match serde_json::from_slice(frame) {
            Ok(json) => json,
            Err(e) => {
                let err = RemoteError::new("ParseError", format!("Parse error: {}", e));
                return (RpcResponse::error(None, -32700, err), false);
            }
        };
        let raw_id = json.get("id").cloned();

        let request: RpcRequest = match serde_json::from_value(json) {
            Ok(req) => req,
            Err(e) => {
                let err = RemoteError::new("InvalidRequest", format!("Invalid Request: {}", e));
                return (RpcResponse::error(raw_id, -32600, err), false);
            }
        };

        if request.jsonrpc != super::protocol::JSONRPC_VERSION {
            let err = RemoteError::new("InvalidRequest", "Invalid Request: expected jsonrpc 2.0");
            return (RpcResponse::error(request.id, -32600, err), false);
        }

        let id = request.id.clone();
        if request.method == BridgeConfig::SHUTDOWN_HANDLER {
            return (RpcResponse::success(id, Value::Null), true);
        }

        let is_registration = request.method == BridgeConfig::REGISTER_HANDLER;
        match dispatch.dispatch(request.into_request()).await {
            Ok(result) => (RpcResponse::success(id, result), false),
            Err(remote) => {
                let code = if is_registration {
                    BridgeError::Registration(remote.clone())
                } else {
                    BridgeError::Remote(remote.clone())
                }
                .to_rpc_error_code();
                (RpcResponse::error(id, code, remote), false)
            }
        }
    }
}

/// Resolve once the stop flag is set or its sender is gone.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
