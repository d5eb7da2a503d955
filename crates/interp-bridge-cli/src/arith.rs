//! The `arith` handler set.
//!
//! `ARITH_SOURCE` is approved in the endpoint's module catalog, so a client
//! may also bind `plus`/`minus` through `__register__` by shipping that exact
//! text.

use interp_bridge::{
    ApprovedModule, HandlerRegistry, HandlerResult, ModuleCatalog, RemoteError, Value,
};

/// Source text whose functions this endpoint provides natively.
pub const ARITH_SOURCE: &str = "\
def plus(a, b):
    return a + b

def minus(a, b):
    return a - b
";

fn plus(a: i64, b: i64) -> HandlerResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| RemoteError::new("OverflowError", "integer addition overflowed"))
}

fn minus(a: i64, b: i64) -> HandlerResult<i64> {
    a.checked_sub(b)
        .ok_or_else(|| RemoteError::new("OverflowError", "integer subtraction overflowed"))
}

fn echo(value: Value) -> HandlerResult<Value> {
    Ok(value)
}

fn sum(values: Vec<f64>) -> HandlerResult<f64> {
    Ok(values.iter().sum())
}

/// Register the set's handlers on `registry`.
pub fn install(registry: &HandlerRegistry) -> HandlerResult<()> {
    registry.register_fn("plus", plus)?;
    registry.register_fn("minus", minus)?;
    registry.register_fn("echo", echo)?;
    registry.register_fn("sum", sum)?;
    Ok(())
}

/// Catalog approving [`ARITH_SOURCE`].
pub fn catalog() -> ModuleCatalog {
    let catalog = ModuleCatalog::new();
    catalog.approve(
        ARITH_SOURCE,
        ApprovedModule::new("arith")
            .function("plus", plus)
            .function("minus", minus),
    );
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use interp_bridge::{Marshaller, Request};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_installed_handlers() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = HandlerRegistry::new(Arc::new(Marshaller::new(8, dir.path())));
        install(&registry).unwrap();

        assert_eq!(registry.names(), vec!["echo", "minus", "plus", "sum"]);
        assert_eq!(
            registry
                .dispatch_request(Request::new("minus", vec![Value::Int(5), Value::Int(7)]))
                .await,
            Ok(Value::Int(-2))
        );

        let ramp: Vec<Value> = (1..=100).map(|i| Value::Float(i as f64)).collect();
        let spilled = registry
            .marshaller()
            .enforce_inline_limit(Value::List(ramp))
            .unwrap();
        assert!(matches!(spilled, Value::ArrayRef(_)));
        assert_eq!(
            registry
                .dispatch_request(Request::new("sum", vec![spilled]))
                .await,
            Ok(Value::Float(5050.0))
        );
    }

    #[test]
    fn test_overflow_is_remote_error() {
        let err = plus(i64::MAX, 1).unwrap_err();
        assert!(err.is_type("OverflowError"));
    }

    #[test]
    fn test_catalog_approves_source() {
        assert!(catalog().is_approved(ARITH_SOURCE));
        assert!(!catalog().is_approved("def plus(a, b): return 0\n"));
    }
}
