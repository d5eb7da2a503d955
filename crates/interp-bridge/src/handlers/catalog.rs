//! Pre-approved source modules for Rust-hosted endpoints.
//!
//! `__register__` on a Rust endpoint never evaluates text. Instead each
//! approved source is pinned by its SHA-256 digest and maps to callables
//! compiled into the endpoint. A registration request is honored only when
//! its source hashes to an approved digest; the requested names are then
//! bound from that module.

use super::{Handler, HandlerEntry, HandlerResult, IntoHandler, SourceEvaluator};
use crate::error::RemoteError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Callables backing one approved source text.
#[derive(Debug, Clone, Default)]
pub struct ApprovedModule {
    name: String,
    functions: HashMap<String, Handler>,
}

impl ApprovedModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
        }
    }

    /// Add a callable under the identifier the source defines it as.
    pub fn function<Args, F: IntoHandler<Args>>(mut self, name: impl Into<String>, f: F) -> Self {
        self.functions.insert(name.into(), f.into_handler());
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.functions.insert(name.into(), handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Digest-keyed table of approved modules.
#[derive(Debug, Default)]
pub struct ModuleCatalog {
    modules: RwLock<HashMap<String, ApprovedModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex SHA-256 of the exact source text.
    pub fn digest(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// Approve `source`, returning its digest.
    pub fn approve(&self, source: &str, module: ApprovedModule) -> String {
        let digest = Self::digest(source);
        debug!(
            "Approved module '{}' ({} functions) as {}",
            module.name,
            module.functions.len(),
            digest
        );
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.clone(), module);
        digest
    }

    pub fn is_approved(&self, source: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&Self::digest(source))
    }

    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SourceEvaluator for ModuleCatalog {
    fn evaluate(&self, source: &str, names: &[String]) -> HandlerResult<Vec<HandlerEntry>> {
        let digest = Self::digest(source);
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let module = modules.get(&digest).ok_or_else(|| {
            warn!("Refused registration of unapproved source {}", digest);
            RemoteError::new(
                "ImportError",
                format!("source {} is not an approved module", &digest[..12]),
            )
        })?;

        names
            .iter()
            .map(|name| {
                module
                    .functions
                    .get(name)
                    .map(|handler| HandlerEntry {
                        name: name.clone(),
                        handler: handler.clone(),
                    })
                    .ok_or_else(|| {
                        RemoteError::new("NameError", format!("name '{}' is not defined", name))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRegistry;
    use crate::ipc::Request;
    use crate::marshal::{Marshaller, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SOURCE: &str = "def plus(a, b):\n    return a + b\n\ndef minus(a, b):\n    return a - b\n";

    fn catalog() -> Arc<ModuleCatalog> {
        let catalog = ModuleCatalog::new();
        catalog.approve(
            SOURCE,
            ApprovedModule::new("arith")
                .function("plus", |a: i64, b: i64| -> HandlerResult<i64> { Ok(a + b) })
                .function("minus", |a: i64, b: i64| -> HandlerResult<i64> { Ok(a - b) }),
        );
        Arc::new(catalog)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = ModuleCatalog::digest("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unapproved_source_is_import_error() {
        let err = catalog()
            .evaluate("import os\nos.system('true')\n", &names(&["plus"]))
            .unwrap_err();
        assert!(err.is_type("ImportError"));
    }

    #[test]
    fn test_missing_identifier_is_name_error() {
        let err = catalog()
            .evaluate(SOURCE, &names(&["plus", "times"]))
            .unwrap_err();
        assert!(err.is_type("NameError"));
        assert!(err.message.contains("'times'"));
    }

    #[tokio::test]
    async fn test_registry_binds_two_handlers_from_one_source() {
        let dir = TempDir::new().unwrap();
        let registry = HandlerRegistry::new(Arc::new(Marshaller::new(16, dir.path())))
            .with_evaluator(catalog());

        registry
            .register_source(SOURCE, &names(&["plus", "minus"]))
            .unwrap();

        let args = vec![Value::Int(5), Value::Int(3)];
        assert_eq!(
            registry.dispatch_request(Request::new("plus", args.clone())).await,
            Ok(Value::Int(8))
        );
        assert_eq!(
            registry.dispatch_request(Request::new("minus", args)).await,
            Ok(Value::Int(2))
        );
    }

    #[test]
    fn test_failed_registration_inserts_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = HandlerRegistry::new(Arc::new(Marshaller::new(16, dir.path())))
            .with_evaluator(catalog());

        assert!(registry
            .register_source(SOURCE, &names(&["plus", "times"]))
            .is_err());
        assert!(!registry.contains("plus"));
        assert!(registry.is_empty());
    }
}
