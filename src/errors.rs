//! Typed error hierarchy for the phase execution engine.
//!
//! `EngineError` covers the dispatch path end to end: registry misuse (fatal
//! at startup, never at request time), phase resolution, handler execution,
//! streaming, and persistence. Handler-local failures are NOT errors — a
//! handler reports those as a `status = error` Outcome so the turn is still
//! recorded; only engine-level faults surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Handler '{name}' is already registered")]
    DuplicateHandler { name: String },

    #[error("No handler registered under '{name}'")]
    UnknownHandler { name: String },

    #[error("Phase {phase} is outside the known phase table")]
    InvalidPhase { phase: i64 },

    #[error("Phase {phase} handler failed: {message}")]
    HandlerFailed { phase: i64, message: String },

    #[error("Phase {phase} exceeded the {seconds}s dispatch budget")]
    Timeout { phase: i64, seconds: u64 },

    #[error("Listener disconnected mid-stream")]
    StreamAborted,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}
