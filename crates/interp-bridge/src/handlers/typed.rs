//! Typed handler adapters.
//!
//! Any `Fn(A1, .., An) -> HandlerResult<R>` with up to four arguments
//! becomes a [`Handler`]. Arguments are unflattened positionally and the
//! result is flattened through the registry's marshaller, so oversized
//! numeric results are spilled like any other value.

use super::{Handler, HandlerResult};
use crate::error::RemoteError;
use crate::marshal::{Flatten, Marshaller, Unflatten, Value};

/// Conversion of a typed closure into a [`Handler`].
///
/// `Args` is the tuple of argument types and only disambiguates impls.
pub trait IntoHandler<Args>: Send + Sync + 'static {
    fn into_handler(self) -> Handler;
}

fn arity_error(expected: usize, given: usize) -> RemoteError {
    let plural = if expected == 1 { "" } else { "s" };
    RemoteError::new(
        "TypeError",
        format!(
            "takes {} positional argument{} but {} were given",
            expected, plural, given
        ),
    )
}

fn argument_error(position: usize, err: crate::error::BridgeError) -> RemoteError {
    RemoteError::new("TypeError", format!("argument {}: {}", position + 1, err))
}

fn result_error(err: crate::error::BridgeError) -> RemoteError {
    RemoteError::new("MarshalError", err.to_string())
}

macro_rules! impl_into_handler {
    ($($ty:ident $var:ident),*) => {
        impl<F, R, $($ty,)*> IntoHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> HandlerResult<R> + Send + Sync + 'static,
            R: Flatten,
            $($ty: Unflatten,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn into_handler(self) -> Handler {
                let arity = <[&str]>::len(&[$(stringify!($var)),*]);
                Handler::new(move |args: Vec<Value>, marshaller: &Marshaller| {
                    if args.len() != arity {
                        return Err(arity_error(arity, args.len()));
                    }
                    let mut args = args.into_iter().enumerate();
                    $(
                        let (position, raw) = args.next().unwrap_or_default();
                        let $var = <$ty as Unflatten>::unflatten(raw, marshaller)
                            .map_err(|e| argument_error(position, e))?;
                    )*
                    let out = (self)($($var),*)?;
                    marshaller.flatten(&out).map_err(result_error)
                })
            }
        }
    };
}

impl_into_handler!();
impl_into_handler!(A1 a1);
impl_into_handler!(A1 a1, A2 a2);
impl_into_handler!(A1 a1, A2 a2, A3 a3);
impl_into_handler!(A1 a1, A2 a2, A3 a3, A4 a4);
