//! Output sinks for check results
//!
//! A sink receives every result of the checks bound to it. The console sink
//! writes formatted lines synchronously; the network sink batches points and
//! flushes them from a dedicated background task.

pub mod console;
pub mod network;

use async_trait::async_trait;

use crate::CheckResult;

/// A delivery target for check results.
///
/// `emit` is best-effort: it returns once the result has been handed off to
/// the sink, not once it has been durably written. Implementations must be
/// safe to share across concurrently running check loops.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Stable type name, used when logging delivery failures.
    fn name(&self) -> &'static str;

    async fn emit(&self, check_name: &str, check_type: &str, result: &CheckResult);
}

impl std::fmt::Debug for dyn Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("name", &self.name()).finish()
    }
}
