use async_trait::async_trait;

use cumulo_common::{ActivationId, Result};
use cumulo_job::InvocationPayload;

/// Fire-and-forget compute contract consumed by the invoker.
///
/// An implementation dispatches one remote execution unit per `invoke` call.
/// Returning `Ok(None)` means the backend refused the dispatch (rate limit,
/// transient unavailability) and the invoker should try again; only
/// transport-level breakage is an `Err`.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Dispatches one execution unit and returns its activation id, or
    /// `None` when the backend asks for a retry.
    async fn invoke(
        &self,
        runtime_name: &str,
        runtime_memory_mb: u32,
        payload: &InvocationPayload,
    ) -> Result<Option<ActivationId>>;

    /// Modules already present in the named runtime image; the job builder
    /// strips these from uploaded bundles.
    fn preinstalled_modules(&self, _runtime_name: &str) -> Vec<String> {
        Vec::new()
    }
}
