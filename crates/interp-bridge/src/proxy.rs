//! Typed stand-ins for remote interfaces.
//!
//! Each declared method forwards as exactly one request whose handler name is
//! the method name and whose arguments are the method's parameters in order.
//! The remote side needs no knowledge of the interface; only the name and the
//! positional arity have to agree.
//!
//! Interfaces are declared with [`bridge_proxy!`](crate::bridge_proxy), which
//! generates one async forwarding method per declared method:
//!
//! ```rust,ignore
//! interp_bridge::bridge_proxy! {
//!     pub struct Arith {
//!         fn plus(a: i64, b: i64) -> i64;
//!         fn minus(a: i64, b: i64) -> i64;
//!     }
//! }
//!
//! let arith: Arith = ProxyFactory::new(client).new_proxy_instance(false);
//! assert_eq!(arith.plus(1, 2).await?, 3);
//! ```
//!
//! An error type may follow the struct name (`struct Arith: ArithError`); it
//! must implement `From<BridgeError>` and becomes the error of every method.

use crate::error::{BridgeError, Result};
use crate::ipc::RpcClient;
use crate::marshal::{Flatten, Unflatten, Value};
use std::sync::Arc;
use tracing::debug;

/// One declared method: handler name and positional arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub arity: usize,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
        }
    }
}

/// The methods a proxy may forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>, methods: Vec<MethodDescriptor>) -> Self {
        Self {
            name: name.into(),
            methods,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Untyped forwarding core shared by generated proxies.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: Arc<RpcClient>,
    descriptor: Arc<InterfaceDescriptor>,
    debug: bool,
}

impl Proxy {
    pub fn new(client: Arc<RpcClient>, descriptor: InterfaceDescriptor, debug: bool) -> Self {
        Self {
            client,
            descriptor: Arc::new(descriptor),
            debug,
        }
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Flatten one argument with the client's marshaller.
    pub fn flatten_arg<T: Flatten + ?Sized>(&self, value: &T) -> Result<Value> {
        self.client.marshaller().flatten(value)
    }

    /// Forward `method(args..)` as a single request and unflatten the result.
    pub async fn invoke<R: Unflatten>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let declared = self
            .descriptor
            .method(method)
            .ok_or_else(|| BridgeError::UndeclaredMethod {
                interface: self.descriptor.name.clone(),
                method: method.to_string(),
            })?;
        if declared.arity != args.len() {
            return Err(BridgeError::marshal(format!(
                "{}.{} takes {} arguments, {} given",
                self.descriptor.name,
                method,
                declared.arity,
                args.len()
            )));
        }

        debug!("{}.{} -> {}", self.descriptor.name, method, self.client.addr());
        self.client.call(method, args, self.debug).await
    }
}

/// An interface that can be backed by a [`Proxy`].
pub trait RemoteInterface: Sized {
    fn descriptor() -> InterfaceDescriptor;

    fn from_proxy(proxy: Proxy) -> Self;
}

/// Builds proxies bound to one client.
#[derive(Debug, Clone)]
pub struct ProxyFactory {
    client: Arc<RpcClient>,
}

impl ProxyFactory {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    /// Typed proxy for `T`. With `debug` set, remote failures carry source context.
    pub fn new_proxy_instance<T: RemoteInterface>(&self, debug: bool) -> T {
        T::from_proxy(self.proxy(T::descriptor(), debug))
    }

    /// Untyped proxy for a descriptor assembled at runtime.
    pub fn proxy(&self, descriptor: InterfaceDescriptor, debug: bool) -> Proxy {
        Proxy::new(self.client.clone(), descriptor, debug)
    }
}

/// Declare a remote interface and generate its forwarding proxy.
#[macro_export]
macro_rules! bridge_proxy {
    (
        @impl [$(#[$meta:meta])*] $vis:vis $name:ident [$err:ty] {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $($arg:ident : $arg_ty:ty),* $(,)? ) -> $ret:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            proxy: $crate::proxy::Proxy,
        }

        impl $name {
            $(
                $(#[$method_meta])*
                pub async fn $method(
                    &self,
                    $($arg: $arg_ty),*
                ) -> ::std::result::Result<$ret, $err> {
                    let args = ::std::vec![$(self.proxy.flatten_arg(&$arg)?),*];
                    ::std::result::Result::Ok(
                        self.proxy.invoke::<$ret>(::std::stringify!($method), args).await?,
                    )
                }
            )*

            pub fn proxy(&self) -> &$crate::proxy::Proxy {
                &self.proxy
            }
        }

        impl $crate::proxy::RemoteInterface for $name {
            fn descriptor() -> $crate::proxy::InterfaceDescriptor {
                $crate::proxy::InterfaceDescriptor::new(
                    ::std::stringify!($name),
                    ::std::vec![$(
                        $crate::proxy::MethodDescriptor::new(
                            ::std::stringify!($method),
                            <[&str]>::len(&[$(::std::stringify!($arg)),*]),
                        )
                    ),*],
                )
            }

            fn from_proxy(proxy: $crate::proxy::Proxy) -> Self {
                Self { proxy }
            }
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $err:ty { $($body:tt)* }
    ) => {
        $crate::bridge_proxy! { @impl [$(#[$meta])*] $vis $name [$err] { $($body)* } }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident { $($body:tt)* }
    ) => {
        $crate::bridge_proxy! { @impl [$(#[$meta])*] $vis $name [$crate::BridgeError] { $($body)* } }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::handlers::{HandlerRegistry, HandlerResult};
    use crate::ipc::{RpcServer, RpcServerHandle};
    use crate::marshal::Marshaller;
    use tempfile::TempDir;

    crate::bridge_proxy! {
        /// Integer arithmetic served remotely.
        pub struct Arith {
            fn plus(a: i64, b: i64) -> i64;
            fn minus(a: i64, b: i64) -> i64;
            fn describe(label: &str, values: Vec<f64>) -> String;
        }
    }

    #[derive(Debug)]
    enum CheckError {
        Bridge(BridgeError),
    }

    impl From<BridgeError> for CheckError {
        fn from(err: BridgeError) -> Self {
            CheckError::Bridge(err)
        }
    }

    crate::bridge_proxy! {
        struct Checks: CheckError {
            fn run() -> ();
        }
    }

    async fn setup() -> (RpcServerHandle, ProxyFactory, TempDir) {
        let dir = TempDir::new().unwrap();
        let marshaller = Arc::new(Marshaller::new(16, dir.path().join("server")));
        let registry = HandlerRegistry::new(marshaller);
        registry
            .register_fn("plus", |a: i64, b: i64| -> HandlerResult<i64> { Ok(a + b) })
            .unwrap();
        registry
            .register_fn("describe", |label: String, values: Vec<f64>| -> HandlerResult<String> {
                Ok(format!("{}:{}", label, values.len()))
            })
            .unwrap();
        registry
            .register_fn("run", || -> HandlerResult<()> {
                Err(RemoteError::new("AssertionError", "assertion failed"))
            })
            .unwrap();

        let handle = RpcServer::start("127.0.0.1:0".parse().unwrap(), Arc::new(registry))
            .await
            .unwrap();
        let client = RpcClient::connect(
            handle.addr(),
            Arc::new(Marshaller::new(16, dir.path().join("client"))),
        )
        .await
        .unwrap();
        (handle, ProxyFactory::new(Arc::new(client)), dir)
    }

    #[test]
    fn test_descriptor_lists_methods_with_arity() {
        let descriptor = Arith::descriptor();
        assert_eq!(descriptor.name, "Arith");
        assert_eq!(descriptor.methods.len(), 3);
        assert_eq!(descriptor.method("plus").unwrap().arity, 2);
        assert_eq!(Checks::descriptor().method("run").unwrap().arity, 0);
    }

    #[tokio::test]
    async fn test_proxy_forwards_plus() {
        let (_handle, factory, _dir) = setup().await;
        let arith: Arith = factory.new_proxy_instance(false);

        assert_eq!(arith.plus(1, 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_proxy_spills_large_arguments() {
        let (_handle, factory, _dir) = setup().await;
        let arith: Arith = factory.new_proxy_instance(false);

        let values: Vec<f64> = (0..500).map(|i| i as f64 * 0.5).collect();
        assert_eq!(arith.describe("ramp", values).await.unwrap(), "ramp:500");
        assert!(arith.proxy().client().marshaller().owned_files().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_method_is_remote_name_error() {
        let (_handle, factory, _dir) = setup().await;
        let arith: Arith = factory.new_proxy_instance(false);

        let err = arith.minus(3, 1).await.unwrap_err();
        assert!(err.remote().unwrap().is_type("NameError"));
    }

    #[tokio::test]
    async fn test_custom_error_type_receives_remote_error() {
        let (_handle, factory, _dir) = setup().await;
        let checks: Checks = factory.new_proxy_instance(true);

        let CheckError::Bridge(err) = checks.run().await.unwrap_err();
        let remote = err.remote().unwrap();
        assert!(remote.is_type("AssertionError"));
        assert!(remote.remote_traceback.contains("assertion failed"));
    }

    #[tokio::test]
    async fn test_untyped_proxy_checks_name_and_arity() {
        let (_handle, factory, _dir) = setup().await;
        let proxy = factory.proxy(
            InterfaceDescriptor::new("Arith", vec![MethodDescriptor::new("plus", 2)]),
            false,
        );

        let err = proxy.invoke::<i64>("times", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::UndeclaredMethod { .. }));

        let err = proxy
            .invoke::<i64>("plus", vec![Value::Int(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Marshal { .. }));

        let sum: i64 = proxy
            .invoke("plus", vec![Value::Int(2), Value::Int(2)])
            .await
            .unwrap();
        assert_eq!(sum, 4);
    }
}
