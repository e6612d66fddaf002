//! Adapter interfaces for external collaborators.
//!
//! The orchestration core only talks to the outside world through these
//! traits:
//! - `InferenceBackend`: local (Ollama) and cloud (Anthropic) models
//! - `Sensor`: discovers opportunities and inserts them as `new`
//! - `Notifier`: fire-and-forget operator messages
//! - `Launcher`: validation launches and final builds
//! - `Reflector`: survival assessment and self-tuning

pub mod anthropic;
pub mod command;
pub mod ollama;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Opportunity, Survival};

pub use anthropic::AnthropicBackend;
pub use command::{CommandLauncher, CommandSensor};
pub use ollama::OllamaBackend;
pub use telegram::TelegramNotifier;

/// Input to an inference backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,

    /// Optional system instruction
    pub system: Option<String>,

    /// Base64-encoded images
    #[serde(default)]
    pub images: Vec<String>,

    pub max_tokens: u32,
}

impl Prompt {
    pub fn new(text: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            text: text.into(),
            max_tokens,
            ..Self::default()
        }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Output from an inference backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,

    /// Model that actually answered
    pub model: String,

    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Language model backend
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn generate(&self, model: &str, prompt: &Prompt) -> Result<Generation>;

    async fn health_check(&self) -> Result<()>;
}

/// Opportunity discovery collaborator
#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    /// Insert whatever was found as `new` opportunities
    async fn sense(&self) -> Result<()>;
}

/// Operator notification channel. Never fails into the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Externally side-effecting validation and build steps.
///
/// `Ok(None)` means the collaborator declined or produced nothing.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch_validation(&self, opportunity: &Opportunity) -> Result<Option<String>>;

    async fn build_final(&self, opportunity: &Opportunity) -> Result<Option<String>>;
}

/// Reflection and self-tuning collaborator
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self) -> Result<Survival>;

    async fn self_improve(&self) -> Result<()>;
}

/// Notifier that writes to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        info!(subject, body, "Notification");
    }
}
