//! The input and output contracts for a single handler invocation.
//!
//! `ExecutionContext` is the immutable bundle a handler reads; `Outcome` is
//! the transient result it returns. Neither is persisted as its own entity —
//! the streaming executor and file synchronizer own the Outcome for the
//! duration of one dispatch.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Generated files keyed by collection, then by relative path.
/// `BTreeMap` keeps iteration order deterministic across runs.
pub type ArtifactMap = BTreeMap<String, BTreeMap<String, String>>;

/// One prior conversation turn, as handed to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Read-only input for one dispatch. Handlers must be pure with respect to
/// this context: same context, semantically equivalent output.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user_text: String,
    pub project_id: String,
    pub project_name: String,
    /// Prior turns for this project+phase, oldest first. May be empty.
    pub prior_messages: Vec<ConversationTurn>,
    /// Previously reconciled files, collection -> path -> content. May be empty.
    pub prior_artifacts: ArtifactMap,
}

impl ExecutionContext {
    pub fn new(project_id: &str, project_name: &str, user_text: &str) -> Self {
        Self {
            user_text: user_text.to_string(),
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            prior_messages: Vec::new(),
            prior_artifacts: ArtifactMap::new(),
        }
    }

    /// Total number of previously reconciled files across all collections.
    pub fn prior_file_count(&self) -> usize {
        self.prior_artifacts.values().map(|c| c.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    PendingApproval,
    Simulated,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::PendingApproval => "pending_approval",
            Self::Simulated => "simulated",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "pending_approval" => Ok(Self::PendingApproval),
            "simulated" => Ok(Self::Simulated),
            _ => Err(format!("Invalid outcome status: {}", s)),
        }
    }
}

/// The structured result of one handler invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub text: String,
    pub artifacts: ArtifactMap,
}

impl Outcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            text: text.into(),
            artifacts: ArtifactMap::new(),
        }
    }

    /// A recoverable failure, reported as a normal assistant turn so the
    /// conversation history stays coherent.
    pub fn soft_error(text: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            text: text.into(),
            artifacts: ArtifactMap::new(),
        }
    }

    pub fn with_status(mut self, status: OutcomeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactMap) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn has_artifacts(&self) -> bool {
        self.artifacts.values().any(|c| !c.is_empty())
    }
}
