//! Transport: request/response over local TCP.
//!
//! Uses length-prefixed JSON-RPC 2.0 over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Server**: accepts connections and dispatches named requests
//! - **Client**: issues one request at a time and waits for its response
//! - **Protocol**: shared framing and envelope types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{Request, Response, RpcRequest, RpcResponse};
pub use server::{RpcDispatch, RpcServer, RpcServerHandle};
