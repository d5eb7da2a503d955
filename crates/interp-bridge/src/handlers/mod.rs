//! Server-side handler registry.
//!
//! Maps handler names to callables. The map sits behind a `RwLock`, so
//! dispatched requests read concurrently while registration takes the write
//! lock briefly. Handlers run on the blocking pool; a panicking handler is
//! reported to the caller as a `Panic` remote error.
//!
//! Reserved names (`ping`, `shutdown`, `__register__`, `__exec__`,
//! `__handlers__`) cannot be registered, except `__exec__`, which an endpoint
//! may provide to serve the statement channel.

mod catalog;
mod typed;

pub use catalog::{ApprovedModule, ModuleCatalog};
pub use typed::IntoHandler;

use crate::config::{BridgeConfig, EnvVars};
use crate::error::RemoteError;
use crate::ipc::{Request, Response, RpcDispatch};
use crate::marshal::{Marshaller, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Return type of typed handler closures.
pub type HandlerResult<T> = std::result::Result<T, RemoteError>;

type HandlerFn = dyn Fn(Vec<Value>, &Marshaller) -> Response + Send + Sync;

/// A registered callable.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>, &Marshaller) -> Response + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Wrap a typed closure, see [`IntoHandler`].
    pub fn from_fn<Args, F: IntoHandler<Args>>(f: F) -> Self {
        f.into_handler()
    }

    pub fn call(&self, args: Vec<Value>, marshaller: &Marshaller) -> Response {
        (self.inner)(args, marshaller)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler(..)")
    }
}

/// A name bound to a callable.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub name: String,
    pub handler: Handler,
}

/// What happens when a name is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// The new callable replaces the old one.
    #[default]
    Overwrite,
    /// The registration fails and the old callable stays.
    Reject,
}

impl RegistrationPolicy {
    pub fn from_env() -> Self {
        std::env::var(EnvVars::REGISTRATION_POLICY)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationPolicy::Overwrite => "overwrite",
            RegistrationPolicy::Reject => "reject",
        }
    }
}

impl fmt::Display for RegistrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(RegistrationPolicy::Overwrite),
            "reject" => Ok(RegistrationPolicy::Reject),
            other => Err(format!("unknown registration policy: {}", other)),
        }
    }
}

/// Resolves handler names from source text.
///
/// Implementations evaluate `source` in a namespace of their own and return
/// one entry per requested name, or fail without side effects.
pub trait SourceEvaluator: Send + Sync {
    fn evaluate(&self, source: &str, names: &[String]) -> HandlerResult<Vec<HandlerEntry>>;
}

/// Name-to-callable map plus the builtin handlers.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
    policy: RegistrationPolicy,
    evaluator: Option<Arc<dyn SourceEvaluator>>,
    marshaller: Arc<Marshaller>,
}

impl HandlerRegistry {
    pub fn new(marshaller: Arc<Marshaller>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            policy: RegistrationPolicy::default(),
            evaluator: None,
            marshaller,
        }
    }

    pub fn with_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable `register_source` through `evaluator`.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn SourceEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    pub fn marshaller(&self) -> &Arc<Marshaller> {
        &self.marshaller
    }

    /// Bind `name` to `handler`, subject to the registration policy.
    pub fn register(&self, name: impl Into<String>, handler: Handler) -> HandlerResult<()> {
        self.register_all(vec![HandlerEntry {
            name: name.into(),
            handler,
        }])
    }

    /// Bind `name` to a typed closure.
    pub fn register_fn<Args, F: IntoHandler<Args>>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> HandlerResult<()> {
        self.register(name, f.into_handler())
    }

    /// Evaluate `source` and bind every name in `names`.
    ///
    /// Nothing is inserted unless every name resolves and passes the policy.
    pub fn register_source(&self, source: &str, names: &[String]) -> HandlerResult<()> {
        let evaluator = self.evaluator.as_ref().ok_or_else(|| {
            RemoteError::new(
                "NotImplementedError",
                "source registration is not enabled on this endpoint",
            )
        })?;
        if names.is_empty() {
            return Err(RemoteError::new(
                "ValueError",
                "at least one handler name is required",
            ));
        }

        let entries = evaluator.evaluate(source, names)?;
        for name in names {
            if !entries.iter().any(|e| &e.name == name) {
                return Err(RemoteError::new(
                    "NameError",
                    format!("name '{}' is not defined", name),
                ));
            }
        }
        self.register_all(entries)
    }

    fn register_all(&self, entries: Vec<HandlerEntry>) -> HandlerResult<()> {
        for entry in &entries {
            if is_reserved(&entry.name) {
                return Err(RemoteError::new(
                    "RegistrationError",
                    format!("'{}' is a reserved handler name", entry.name),
                ));
            }
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if self.policy == RegistrationPolicy::Reject {
            if let Some(taken) = entries.iter().find(|e| handlers.contains_key(&e.name)) {
                return Err(RemoteError::new(
                    "RegistrationError",
                    format!("handler '{}' is already registered", taken.name),
                ));
            }
        }
        for entry in entries {
            if handlers.insert(entry.name.clone(), entry.handler).is_some() {
                info!("Replaced handler '{}'", entry.name);
            } else {
                debug!("Registered handler '{}'", entry.name);
            }
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, sorted. Builtins are not listed.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one request against the builtins or the registered handlers.
    pub async fn dispatch_request(&self, request: Request) -> Response {
        let Request {
            handler: name,
            args,
            debug,
        } = request;
        let arg_kinds: Vec<&'static str> = args.iter().map(Value::kind).collect();

        let outcome = match name.as_str() {
            BridgeConfig::PING_HANDLER => Ok(Value::from("pong")),
            BridgeConfig::LIST_HANDLER => Ok(Value::List(
                self.names().into_iter().map(Value::String).collect(),
            )),
            BridgeConfig::REGISTER_HANDLER => self.builtin_register(args),
            _ => self.run_handler(&name, args).await,
        };

        match outcome {
            Err(err) if debug => Err(self.enrich(err, &name, &arg_kinds)),
            other => other,
        }
    }

    fn builtin_register(&self, args: Vec<Value>) -> Response {
        let mut args = args.into_iter();
        let source = match args.next() {
            Some(Value::String(source)) => source,
            _ => {
                return Err(RemoteError::new(
                    "TypeError",
                    "__register__ expects (source: str, names: list[str])",
                ))
            }
        };
        let names: Vec<String> = match args.next() {
            Some(Value::String(name)) => vec![name],
            Some(Value::List(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(RemoteError::new(
                        "TypeError",
                        format!("handler names must be strings, got {}", other.kind()),
                    )),
                })
                .collect::<HandlerResult<_>>()?,
            _ => {
                return Err(RemoteError::new(
                    "TypeError",
                    "__register__ expects (source: str, names: list[str])",
                ))
            }
        };
        self.register_source(&source, &names).map(|()| Value::Null)
    }

    async fn run_handler(&self, name: &str, args: Vec<Value>) -> Response {
        let handler = self
            .get(name)
            .ok_or_else(|| RemoteError::unknown_handler(name))?;
        let marshaller = self.marshaller.clone();

        match tokio::task::spawn_blocking(move || handler.call(args, &marshaller)).await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(RemoteError::new("Panic", format!("handler '{}' panicked: {}", name, message)))
            }
            Err(join_err) => Err(RemoteError::new("Cancelled", join_err.to_string())),
        }
    }

    /// Append call context to the traceback. The message stays untouched.
    fn enrich(&self, mut err: RemoteError, name: &str, arg_kinds: &[&str]) -> RemoteError {
        let mut context = String::new();
        if !err.remote_traceback.ends_with('\n') {
            context.push('\n');
        }
        context.push_str(&format!(
            "Debug context:\n  handler: {}\n  argument kinds: [{}]\n  registered handlers: [{}]\n",
            name,
            arg_kinds.join(", "),
            self.names().join(", ")
        ));
        err.remote_traceback.push_str(&context);
        err
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .field("policy", &self.policy)
            .field("source_registration", &self.evaluator.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl RpcDispatch for HandlerRegistry {
    async fn dispatch(&self, request: Request) -> Response {
        self.dispatch_request(request).await
    }

    fn release(&self, paths: Vec<PathBuf>) {
        let removed = self.marshaller.release(paths);
        if removed > 0 {
            debug!("Released {} response spill files", removed);
        }
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        BridgeConfig::PING_HANDLER
            | BridgeConfig::SHUTDOWN_HANDLER
            | BridgeConfig::REGISTER_HANDLER
            | BridgeConfig::LIST_HANDLER
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(Marshaller::new(16, dir.path())))
    }

    fn call(name: &str, args: Vec<Value>) -> Request {
        Request::new(name, args)
    }

    #[tokio::test]
    async fn test_builtins() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .register_fn("zeta", || -> HandlerResult<()> { Ok(()) })
            .unwrap();
        registry
            .register_fn("alpha", || -> HandlerResult<()> { Ok(()) })
            .unwrap();

        assert_eq!(
            registry.dispatch_request(call("ping", vec![])).await,
            Ok(Value::from("pong"))
        );
        assert_eq!(
            registry.dispatch_request(call("__handlers__", vec![])).await,
            Ok(Value::List(vec![Value::from("alpha"), Value::from("zeta")]))
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_is_deterministic_name_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let first = registry.dispatch_request(call("nope", vec![])).await.unwrap_err();
        let second = registry.dispatch_request(call("nope", vec![])).await.unwrap_err();
        assert!(first.is_type("NameError"));
        assert_eq!(first.message, "name 'nope' is not defined");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_overwrite_policy_replaces_handler() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        assert_eq!(registry.policy(), RegistrationPolicy::Overwrite);

        registry
            .register_fn("f", || -> HandlerResult<i64> { Ok(1) })
            .unwrap();
        registry
            .register_fn("f", || -> HandlerResult<i64> { Ok(2) })
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.dispatch_request(call("f", vec![])).await,
            Ok(Value::Int(2))
        );
    }

    #[tokio::test]
    async fn test_reject_policy_keeps_first_handler() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).with_policy(RegistrationPolicy::Reject);

        registry
            .register_fn("f", || -> HandlerResult<i64> { Ok(1) })
            .unwrap();
        let err = registry
            .register_fn("f", || -> HandlerResult<i64> { Ok(2) })
            .unwrap_err();

        assert!(err.is_type("RegistrationError"));
        assert_eq!(
            registry.dispatch_request(call("f", vec![])).await,
            Ok(Value::Int(1))
        );
    }

    #[test]
    fn test_reserved_names_cannot_be_registered() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let err = registry
            .register_fn("ping", || -> HandlerResult<()> { Ok(()) })
            .unwrap_err();
        assert!(err.is_type("RegistrationError"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_remote_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .register_fn("boom", || -> HandlerResult<()> { panic!("kaboom") })
            .unwrap();

        let err = registry.dispatch_request(call("boom", vec![])).await.unwrap_err();
        assert!(err.is_type("Panic"));
        assert!(err.message.contains("kaboom"));

        // The registry stays usable after a panic.
        assert!(registry.dispatch_request(call("ping", vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_debug_request_enriches_traceback_only() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .register_fn("known", || -> HandlerResult<()> { Ok(()) })
            .unwrap();

        let err = registry
            .dispatch_request(call("nope", vec![Value::Int(1), Value::from("x")]).with_debug(true))
            .await
            .unwrap_err();

        assert_eq!(err.message, "name 'nope' is not defined");
        assert!(err.remote_traceback.contains("handler: nope"));
        assert!(err.remote_traceback.contains("argument kinds: [int, string]"));
        assert!(err.remote_traceback.contains("registered handlers: [known]"));
    }

    #[tokio::test]
    async fn test_register_source_without_evaluator_fails() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let err = registry
            .dispatch_request(call(
                "__register__",
                vec![Value::from("def f(): pass"), Value::from("f")],
            ))
            .await
            .unwrap_err();
        assert!(err.is_type("NotImplementedError"));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "reject".parse::<RegistrationPolicy>(),
            Ok(RegistrationPolicy::Reject)
        );
        assert_eq!(
            " Overwrite ".parse::<RegistrationPolicy>(),
            Ok(RegistrationPolicy::Overwrite)
        );
        assert!("merge".parse::<RegistrationPolicy>().is_err());
        assert_eq!(RegistrationPolicy::Reject.to_string(), "reject");
    }
}
