//! The phase execution engine: handler contract, registry, dispatch, and the
//! built-in phase implementations.

pub mod context;
pub mod dispatch;
pub mod handler;
pub mod phases;
pub mod registry;
pub mod templates;

pub use context::{ArtifactMap, ConversationTurn, ExecutionContext, Outcome, OutcomeStatus};
pub use dispatch::{FallbackPolicy, PHASE_COUNT, PhaseDispatcher, handler_name_for};
pub use handler::PhaseHandler;
pub use phases::build_registry;
pub use registry::HandlerRegistry;
