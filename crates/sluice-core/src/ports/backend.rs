//! Backend port: the one capability the engine needs from a transport.

use async_trait::async_trait;
use std::future::Future;

/// A worker-driven backend: accept one request, eventually yield one raw
/// reply.
///
/// The engine bounds every call with the item's remaining deadline, so an
/// implementation does not need its own timeout. `Err` means the transport
/// itself failed (connection refused, encode error, ...) and is treated as a
/// retryable application failure; classifying a reply that *did* arrive is
/// the [`ResultChecker`](crate::ports::ResultChecker)'s job.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Adapter that lifts an async closure into a [`Backend`].
///
/// This is the call-site adapter construction the engine expects: wrap
/// whatever client you have in a closure instead of implementing the trait
/// on it.
pub struct FnBackend<F> {
    f: F,
}

impl<F> FnBackend<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send,
{
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, String> {
        (self.f)(request.clone()).await
    }
}
