//! Model router ("brain").
//!
//! Chooses between the free local backend and the metered cloud backend per
//! request:
//! - forced local, or no cloud backend: local task model, then default model
//! - under today's cloud budget: cloud primary, cloud fallbacks, then local
//! - over budget: human approval gate, cloud if approved, local otherwise
//!
//! Every successful cloud call is appended to the spend ledger; the budget
//! check is always a fresh aggregation over that ledger.

pub mod approval;
pub mod router;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TaskKind;
use crate::store::StoreError;

pub use approval::{ApprovalGate, ApprovalOutcome};
pub use router::ModelRouter;

/// Which backend answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Cloud,
}

/// An inference request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainRequest {
    pub prompt: String,
    pub task: TaskKind,
    #[serde(default)]
    pub system: Option<String>,
    /// Never use the metered backend
    #[serde(default)]
    pub force_local: bool,
    /// Base64-encoded images; routes to the local vision model
    #[serde(default)]
    pub images: Vec<String>,
    pub max_tokens: u32,
}

impl BrainRequest {
    pub fn new(task: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            task,
            system: None,
            force_local: false,
            images: Vec::new(),
            max_tokens: 2048,
        }
    }

    pub fn force_local(mut self, force: bool) -> Self {
        self.force_local = force;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A successful answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainResponse {
    pub text: String,
    pub backend: BackendKind,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD; zero for local
    pub cost_usd: f64,
}

/// One failed backend attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    pub backend: BackendKind,
    pub model: String,
    pub error: String,
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            BackendKind::Local => "local",
            BackendKind::Cloud => "cloud",
        };
        write!(f, "{backend}/{}: {}", self.model, self.error)
    }
}

fn join_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BrainError {
    /// Every backend in the chain failed
    #[error("All inference backends failed for {task}: {}", join_attempts(.attempts))]
    Exhausted {
        task: TaskKind,
        attempts: Vec<Attempt>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
