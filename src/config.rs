//! Engine tuning knobs, read once at startup.

use std::time::Duration;

use tracing::warn;

use crate::engine::dispatch::FallbackPolicy;
use crate::stream::ChunkMode;

/// Runtime configuration for dispatch and streaming. Environment variables
/// override the defaults; an unparseable value falls back with a warning
/// rather than failing startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Granularity of the streamed replay of handler output.
    pub chunk_mode: ChunkMode,
    /// Pause between streamed chunks, in milliseconds. Zero disables pacing.
    pub token_delay_ms: u64,
    /// Wall-clock budget for one handler invocation, in seconds.
    pub handler_timeout_secs: u64,
    /// What to do with phase numbers outside the table.
    pub fallback_policy: FallbackPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_mode: ChunkMode::Char,
            token_delay_ms: 5,
            handler_timeout_secs: 120,
            fallback_policy: FallbackPolicy::PhaseOne,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(mode) = parse_env("ATELIER_CHUNK_MODE") {
            config.chunk_mode = mode;
        }
        if let Some(ms) = parse_env("ATELIER_TOKEN_DELAY_MS") {
            config.token_delay_ms = ms;
        }
        if let Some(secs) = parse_env("ATELIER_HANDLER_TIMEOUT_SECS") {
            config.handler_timeout_secs = secs;
        }
        if let Some(policy) = parse_env("ATELIER_PHASE_FALLBACK") {
            config.fallback_policy = policy;
        }
        config
    }

    pub fn token_delay(&self) -> Duration {
        Duration::from_millis(self.token_delay_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

fn parse_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparseable config value");
            None
        }
    }
}
