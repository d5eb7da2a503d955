//! TCP client side of the bridge.
//!
//! One request is in flight per client. Calls are serialized by a tokio
//! `Mutex` around the stream, so concurrency comes from using several clients.
//!
//! The stream is taken out of its slot for the duration of an exchange and put
//! back only when a well-formed response was read. A cancelled or failed call
//! therefore never leaves a half-read response behind; the next call simply
//! reconnects.

use super::protocol::{read_frame, write_frame, Request, Response, RpcRequest, RpcResponse};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result, TransportErrorKind};
use crate::marshal::{Marshaller, Unflatten, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Client for a bridge server.
#[derive(Debug)]
pub struct RpcClient {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
    marshaller: Arc<Marshaller>,
    call_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl RpcClient {
    /// Connect to a server.
    ///
    /// Uses `BridgeConfig::CONNECT_TIMEOUT` for the TCP handshake.
    pub async fn connect(addr: SocketAddr, marshaller: Arc<Marshaller>) -> Result<Self> {
        let stream = Self::open(addr).await?;
        debug!("Bridge client connected to {}", addr);

        Ok(Self {
            addr,
            stream: Mutex::new(Some(stream)),
            next_id: AtomicU64::new(1),
            marshaller,
            call_timeout: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Bound every `request()` by `timeout`. Unbounded by default.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    async fn open(addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(BridgeConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::Transport {
                addr: addr.to_string(),
                kind: TransportErrorKind::TimedOut,
                message: format!("connect timed out after {:?}", BridgeConfig::CONNECT_TIMEOUT),
            })?
            .map_err(|e| BridgeError::transport(addr, &e))?;
        stream.set_nodelay(true).map_err(|e| BridgeError::transport(addr, &e))?;
        Ok(stream)
    }

    /// Send one request and wait for its response.
    ///
    /// `ArrayRef`s in the returned value are owned by the server and stay
    /// valid until the next request on this client. Use [`call`](Self::call)
    /// to load them as part of the exchange.
    pub async fn request(&self, handler: &str, args: Vec<Value>, debug: bool) -> Result<Response> {
        self.request_with(Request::new(handler, args).with_debug(debug), Ok)
            .await
    }

    /// Call a handler and unflatten its result, folding a remote failure into `BridgeError::Remote`.
    pub async fn call<R: Unflatten>(&self, handler: &str, args: Vec<Value>, debug: bool) -> Result<R> {
        let marshaller = self.marshaller.clone();
        self.request_with(Request::new(handler, args).with_debug(debug), |response| {
            let value = response?;
            marshaller.unflatten(value)
        })
        .await
    }

    /// Run one exchange and hand the response to `consume` while the stream is still held.
    async fn request_with<T, F>(&self, request: Request, consume: F) -> Result<T>
    where
        F: FnOnce(Response) -> Result<T>,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let spilled_args: Vec<_> = request.args.iter().flat_map(Value::array_paths).collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&RpcRequest::new(request, id))?;

        let mut slot = self.stream.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => {
                debug!("Reconnecting to {}", self.addr);
                Self::open(self.addr).await?
            }
        };

        let exchange = Self::exchange(&mut stream, &payload, self.addr);
        let frame = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| BridgeError::Transport {
                    addr: self.addr.to_string(),
                    kind: TransportErrorKind::TimedOut,
                    message: format!("no response within {:?}", limit),
                })??,
            None => exchange.await?,
        };

        let response: RpcResponse = serde_json::from_slice(&frame)
            .map_err(|e| BridgeError::protocol(format!("unparsable response: {}", e)))?;

        let expected = serde_json::Value::Number(id.into());
        if response.id.as_ref() != Some(&expected) {
            warn!(
                "Response id {:?} does not match request id {} from {}",
                response.id, id, self.addr
            );
            return Err(BridgeError::Transport {
                addr: self.addr.to_string(),
                kind: TransportErrorKind::Desync,
                message: format!("expected response id {}, got {:?}", id, response.id),
            });
        }

        *slot = Some(stream);
        self.marshaller.release(spilled_args);
        consume(response.into_response())
    }

    async fn exchange(stream: &mut TcpStream, payload: &[u8], addr: SocketAddr) -> Result<Vec<u8>> {
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, payload)
            .await
            .map_err(|e| into_transport(addr, e))?;

        read_frame(&mut reader)
            .await
            .map_err(|e| into_transport(addr, e))?
            .ok_or_else(|| BridgeError::Transport {
                addr: addr.to_string(),
                kind: TransportErrorKind::Reset,
                message: "connection closed before a response arrived".to_string(),
            })
    }

    /// No-op round trip through the reserved `ping` handler.
    pub async fn ping(&self) -> Result<()> {
        match self.request(BridgeConfig::PING_HANDLER, Vec::new(), false).await? {
            Ok(_) => Ok(()),
            Err(remote) => Err(BridgeError::Remote(remote)),
        }
    }

    /// Ask the server to stop. It replies before closing.
    pub async fn request_shutdown(&self) -> Result<()> {
        match self
            .request(BridgeConfig::SHUTDOWN_HANDLER, Vec::new(), false)
            .await?
        {
            Ok(_) => Ok(()),
            Err(remote) => Err(BridgeError::Remote(remote)),
        }
    }

    /// Evaluate `source` remotely and bind each of `names` as a handler.
    ///
    /// Either every name is bound or none is. Failures are `BridgeError::Registration`.
    pub async fn register_source(&self, source: &str, names: &[&str], debug: bool) -> Result<()> {
        let args = vec![
            Value::from(source),
            Value::List(names.iter().map(|n| Value::from(*n)).collect()),
        ];
        match self
            .request(BridgeConfig::REGISTER_HANDLER, args, debug)
            .await?
        {
            Ok(_) => Ok(()),
            Err(remote) => Err(BridgeError::Registration(remote)),
        }
    }

    /// Single-name form of [`register_source`](Self::register_source).
    pub async fn register_handler(&self, source: &str, name: &str, debug: bool) -> Result<()> {
        self.register_source(source, &[name], debug).await
    }

    /// Names currently registered on the server, sorted.
    pub async fn handler_names(&self) -> Result<Vec<String>> {
        self.call(BridgeConfig::LIST_HANDLER, Vec::new(), false)
            .await
    }

    /// Close the connection. Every later request fails with `TransportErrorKind::Closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().await.take() {
            drop(stream);
            debug!("Bridge client to {} closed", self.addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::Transport {
            addr: self.addr.to_string(),
            kind: TransportErrorKind::Closed,
            message: "client has been closed".to_string(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn marshaller(&self) -> &Arc<Marshaller> {
        &self.marshaller
    }
}

/// Reclassify IO failures during an exchange as transport errors.
fn into_transport(addr: SocketAddr, err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Io {
            source: Some(io), ..
        } => BridgeError::transport(addr, &io),
        other => other,
    }
}
