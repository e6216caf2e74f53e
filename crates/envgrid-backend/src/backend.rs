//! The uniform backend capability.

use serde_json::Value;

use envgrid_core::{BoxFuture, MethodInfo};

use crate::error::BackendResult;

/// Anything that can serve remote method calls: one container, one HTTP
/// endpoint, or a pool of either.
///
/// Pools and the registry only see this trait, never a concrete type.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn call_method<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, BackendResult<Value>>;

    fn list_methods(&self) -> BoxFuture<'_, BackendResult<Vec<MethodInfo>>>;

    /// Liveness. Degrades to `false` instead of erroring.
    fn health_check(&self) -> BoxFuture<'_, bool>;

    /// Release whatever the backend owns. Safe to call more than once.
    fn cleanup(&self) -> BoxFuture<'_, BackendResult<()>>;

    /// `true` between successful construction and `cleanup`.
    fn is_ready(&self) -> bool;

    /// `(host, port)` this backend is reached at, if it has a single address.
    fn endpoint(&self) -> Option<(String, u16)> {
        None
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}
