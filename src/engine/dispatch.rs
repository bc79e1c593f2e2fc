//! Phase number to handler resolution.
//!
//! The table is fixed at 14 entries. What happens outside the table is an
//! explicit policy: the observed behavior of the system this replaces was to
//! silently substitute phase 1, which never hard-fails a malformed phase
//! number but can mask caller bugs. Both policies are available; the
//! substitution is logged either way.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineError;

use super::handler::PhaseHandler;
use super::registry::HandlerRegistry;

pub const PHASE_COUNT: i64 = 14;

/// `phase -> handler name`; index is `phase - 1`.
const PHASE_TABLE: [&str; PHASE_COUNT as usize] = [
    "phase1",  // requirements gathering
    "phase2",  // code generation
    "phase3",  // deployment-script generation
    "phase4",  // self-improvement proposal
    "phase5",  // test generation
    "phase6",  // documentation generation
    "phase7",  // debug report
    "phase8",  // performance report
    "phase9",  // security audit
    "phase10", // database design
    "phase11", // API design
    "phase12", // UX review
    "phase13", // refactor plan
    "phase14", // monitoring setup
];

/// Handler name for a phase number, if the phase is in the table.
pub fn handler_name_for(phase: i64) -> Option<&'static str> {
    if (1..=PHASE_COUNT).contains(&phase) {
        Some(PHASE_TABLE[(phase - 1) as usize])
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Out-of-table phases resolve to phase 1's handler (observed behavior).
    #[default]
    PhaseOne,
    /// Out-of-table phases fail the request with `InvalidPhase`.
    Strict,
}

impl FallbackPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseOne => "phase_one",
            Self::Strict => "strict",
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase_one" => Ok(Self::PhaseOne),
            "strict" => Ok(Self::Strict),
            _ => Err(format!("Invalid fallback policy: {}", s)),
        }
    }
}

#[derive(Clone)]
pub struct PhaseDispatcher {
    registry: Arc<HandlerRegistry>,
    policy: FallbackPolicy,
}

impl PhaseDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, policy: FallbackPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn resolve(&self, phase: i64) -> Result<Arc<dyn PhaseHandler>, EngineError> {
        match handler_name_for(phase) {
            Some(name) => self.registry.lookup(name),
            None => match self.policy {
                FallbackPolicy::PhaseOne => {
                    warn!(phase, "phase outside table, falling back to phase 1");
                    self.registry.lookup(PHASE_TABLE[0])
                }
                FallbackPolicy::Strict => Err(EngineError::InvalidPhase { phase }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::phases::build_registry;

    fn dispatcher(policy: FallbackPolicy) -> PhaseDispatcher {
        PhaseDispatcher::new(Arc::new(build_registry().unwrap()), policy)
    }

    #[test]
    fn every_phase_resolves_to_a_distinct_handler() {
        let d = dispatcher(FallbackPolicy::PhaseOne);
        let mut seen = std::collections::BTreeSet::new();
        for phase in 1..=PHASE_COUNT {
            let handler = d.resolve(phase).unwrap();
            assert_eq!(handler.name(), handler_name_for(phase).unwrap());
            assert!(seen.insert(handler.name()), "duplicate handler for {phase}");
        }
        assert_eq!(seen.len(), PHASE_COUNT as usize);
    }

    #[test]
    fn out_of_range_falls_back_to_phase_one() {
        let d = dispatcher(FallbackPolicy::PhaseOne);
        let baseline = d.resolve(1).unwrap().name();
        assert_eq!(d.resolve(0).unwrap().name(), baseline);
        assert_eq!(d.resolve(99).unwrap().name(), baseline);
        assert_eq!(d.resolve(-3).unwrap().name(), baseline);
    }

    #[test]
    fn strict_policy_rejects_out_of_range() {
        let d = dispatcher(FallbackPolicy::Strict);
        assert!(d.resolve(7).is_ok());
        let err = d.resolve(15).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPhase { phase: 15 }));
        assert!(matches!(
            d.resolve(0).unwrap_err(),
            EngineError::InvalidPhase { phase: 0 }
        ));
    }

    #[test]
    fn handler_name_table_bounds() {
        assert_eq!(handler_name_for(1), Some("phase1"));
        assert_eq!(handler_name_for(14), Some("phase14"));
        assert_eq!(handler_name_for(0), None);
        assert_eq!(handler_name_for(15), None);
    }

    #[test]
    fn fallback_policy_roundtrip() {
        for s in &["phase_one", "strict"] {
            let parsed: FallbackPolicy = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("lenient".parse::<FallbackPolicy>().is_err());
    }
}
