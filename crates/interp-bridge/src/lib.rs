//! interp-bridge - RPC bridge to a supervised, long-lived interpreter process.
//!
//! The host launches an interpreter endpoint on a deterministic local port,
//! then calls named handlers on it with positional arguments. Values cross the
//! boundary as JSON; large numeric arrays are spilled to `.npy` files and
//! passed by reference.
//!
//! The pieces, bottom up:
//! - [`Marshaller`]: native values to [`Value`] trees and back, with spilling
//! - [`ipc`]: length-prefixed JSON-RPC client and server
//! - [`HandlerRegistry`]: name to callable table served by a Rust endpoint
//! - [`ProxyFactory`]: typed interfaces forwarded one method per request
//! - [`ProcessSupervisor`]: port selection, spawn, readiness and shutdown
//! - [`ServiceCache`]: one interpreter per (project, interpreter) key
//! - [`CommandChannel`]: statement batches with named inputs and outputs
//!
//! # Example
//!
//! ```rust,no_run
//! use interp_bridge::{MainModule, ServiceCache, ServiceKey};
//!
//! #[tokio::main]
//! async fn main() -> interp_bridge::Result<()> {
//!     let cache = ServiceCache::default();
//!     let command = MainModule::command("python3", &std::env::temp_dir().join("interp-bridge"))?;
//!     let service = cache
//!         .get_or_create(&ServiceKey::new("demo", "python3"), &command)
//!         .await?;
//!
//!     let client = service.client();
//!     client
//!         .register_source("def plus(a, b):\n    return a + b\n", &["plus"], false)
//!         .await?;
//!     let sum: i64 = client.call("plus", vec![1.into(), 2.into()], false).await?;
//!     assert_eq!(sum, 3);
//!
//!     cache.clear().await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ipc;
pub mod marshal;
pub mod process;
pub mod proxy;
pub mod python;
pub mod service;

// Re-export commonly used types
pub use command::{CommandChannel, CommandOutputs, CommandState, PendingCommand, StatementBatch};
pub use config::{BridgeConfig, EnvVars, SupervisorConfig};
pub use error::{BridgeError, RemoteError, Result, TransportErrorKind};
pub use handlers::{
    ApprovedModule, Handler, HandlerRegistry, HandlerResult, IntoHandler, ModuleCatalog,
    RegistrationPolicy, SourceEvaluator,
};
pub use ipc::{Request, Response, RpcClient, RpcDispatch, RpcServer, RpcServerHandle};
pub use marshal::{ArrayRef, DType, Flatten, Marshaller, NdArray, Unflatten, Value};
pub use process::{EnvEdit, InterpreterCommand, InterpreterProcess, PortAllocator, ProcessSupervisor};
pub use proxy::{InterfaceDescriptor, MethodDescriptor, Proxy, ProxyFactory, RemoteInterface};
pub use python::MainModule;
pub use service::{ServiceCache, ServiceInstance, ServiceKey};
