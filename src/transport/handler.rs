//! Request handlers for inbound requests.
//!
//! A handler receives the request's `data` and produces a
//! [`HandlerResult`]: `Ok(Success)` or `Err(Failure)`. Synchronous closures,
//! async closures and typed closures are adapted to the one
//! [`RequestHandler`] trait, so the transport settles every request with a
//! single match.
//!
//! Handlers run in their own task. A handler that panics is answered with
//! `ServerError`; the panic message is logged locally and never sent.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::protocol::{Failure, HandlerResult, Success};

// ============================================================================
// RequestHandler
// ============================================================================

/// Responder for one request name.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use controlws::{HandlerResult, RequestHandler, Success};
///
/// struct Clock;
///
/// #[async_trait]
/// impl RequestHandler for Clock {
///     async fn handle(&self, _data: serde_json::Value) -> HandlerResult {
///         Ok(Success::new(serde_json::json!({ "now": 0 })))
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request.
    async fn handle(&self, data: Value) -> HandlerResult;
}

// ============================================================================
// Adapters
// ============================================================================

/// Adapts `Fn(Value) -> impl Future<Output = HandlerResult>`.
pub(crate) struct AsyncFnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> RequestHandler for AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: Value) -> HandlerResult {
        (self.0)(data).await
    }
}

/// Adapts `Fn(Value) -> HandlerResult`.
pub(crate) struct SyncFnHandler<F>(pub(crate) F);

#[async_trait]
impl<F> RequestHandler for SyncFnHandler<F>
where
    F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, data: Value) -> HandlerResult {
        (self.0)(data)
    }
}

/// Deserializes the input into `T` and serializes the output `R`.
///
/// Input that does not fit `T` is declined with `InvalidType`.
pub(crate) struct TypedHandler<F, T, R> {
    handler: F,
    _types: PhantomData<fn(T) -> R>,
}

impl<F, T, R> TypedHandler<F, T, R> {
    pub(crate) fn new(handler: F) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T, R> RequestHandler for TypedHandler<F, T, R>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Failure>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn handle(&self, data: Value) -> HandlerResult {
        let input = match serde_json::from_value::<T>(data) {
            Ok(input) => input,
            Err(e) => {
                debug!(error = %e, "Request data rejected by type guard");
                return Err(Failure::invalid_type());
            }
        };

        let output = (self.handler)(input).await?;

        serde_json::to_value(output).map(Success::new).map_err(|e| {
            error!(error = %e, "Failed to serialize handler output");
            Failure::server_error()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use serde_json::json;

    use crate::protocol::INVALID_TYPE;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_sync_handler() {
        let handler = SyncFnHandler(|data: Value| Ok::<_, Failure>(Success::new(data)));
        let outcome = handler.handle(json!({"x": 1})).await;
        assert_eq!(outcome, Ok(Success::new(json!({"x": 1}))));
    }

    #[tokio::test]
    async fn test_async_handler_failure() {
        let handler = AsyncFnHandler(|_data: Value| async {
            Err::<Success, _>(Failure::new("Busy", "try later"))
        });
        let outcome = handler.handle(Value::Null).await;
        assert_eq!(outcome, Err(Failure::new("Busy", "try later")));
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let handler = TypedHandler::<_, Add, i64>::new(|add: Add| async move {
            Ok::<_, Failure>(add.a + add.b)
        });

        let outcome = handler.handle(json!({"a": 2, "b": 3})).await;
        assert_eq!(outcome, Ok(Success::new(json!(5))));

        let rejected = handler.handle(json!({"a": "two"})).await;
        assert_eq!(rejected.map_err(|f| f.code), Err(INVALID_TYPE.to_string()));
    }
}
