//! The single capability interface every phase implements.

use async_trait::async_trait;

use super::context::{ExecutionContext, Outcome};
use crate::errors::EngineError;

/// A stateless unit implementing one phase's logic.
///
/// Contract: recoverable upstream failures (e.g. a generation service being
/// unreachable) must come back as a `status = error` Outcome, never as `Err` —
/// the engine still records those as an assistant turn. `Err` is reserved for
/// engine-level faults (malformed context, broken invariants) and aborts the
/// stream without recording a turn.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Stable registry name, e.g. `"phase1"`.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError>;
}

impl std::fmt::Debug for dyn PhaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseHandler")
            .field("name", &self.name())
            .finish()
    }
}
