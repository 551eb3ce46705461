//! SecretsResolver port - secret values consumed by operators.
//!
//! Secret storage is somebody else's problem; the engine only asks for a key
//! on behalf of an operator and caches the answer for one execution context.

use async_trait::async_trait;

/// Looks up secret values by key.
///
/// `operator_uri` is passed so an implementation can scope or audit access
/// per operator; the bundled resolvers ignore it.
///
/// # Errors
/// - `Ok(None)` is an unset secret; `ctx.secret(key)` returns `None` for it.
///   `Err` is a resolver failure and ends `prepare` with a captured
///   `ExecutionResult` error.
#[async_trait]
pub trait SecretsResolver: Send + Sync {
    /// Resolve `key` for `operator_uri`. `Ok(None)` means the secret is unset.
    async fn resolve(&self, key: &str, operator_uri: &str) -> anyhow::Result<Option<String>>;
}
