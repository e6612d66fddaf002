//! Configuration for prospector.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PROSPECTOR_HOME, PROSPECTOR_DB, OLLAMA_URL,
//!    ANTHROPIC_API_KEY, TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID)
//! 2. Config file (.prospector/config.yaml)
//! 3. Defaults (~/.prospector)
//!
//! Config file discovery:
//! - Searches current directory and parents for .prospector/config.yaml
//! - Paths in config file are relative to the .prospector/ directory
//!
//! Policy values (thresholds, budgets, caps) are NOT configuration: they live
//! in the store and are tuned at runtime. See [`crate::policy`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::TaskKind;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub launcher: Option<LauncherConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .prospector/)
    pub home: Option<String>,
    /// Database file (relative to .prospector/)
    pub database: Option<String>,
}

/// Timer periods of the independent loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    /// Cycle scheduler tick (default: 1 hour)
    pub tick_secs: u64,
    /// Job queue poll (default: 10s)
    pub worker_poll_secs: u64,
    /// Validation controller pass (default: 15 min)
    pub controller_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            tick_secs: 3600,
            worker_poll_secs: 10,
            controller_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Jobs claimed and processed concurrently per poll
    pub concurrency: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

/// Free, self-hosted inference backend (Ollama)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub url: String,
    /// Fallback when a task model fails
    pub default_model: String,
    /// Used for requests carrying images; never falls back to a text model
    pub vision_model: String,
    /// Task-specific models
    pub models: HashMap<TaskKind, String>,
    pub timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            default_model: "llama3.1:8b".to_string(),
            vision_model: "llava:13b".to_string(),
            models: [
                (TaskKind::Code, "qwen2.5-coder:14b".to_string()),
                (TaskKind::Planning, "qwen2.5:14b".to_string()),
            ]
            .into_iter()
            .collect(),
            timeout_secs: 300,
        }
    }
}

impl LocalConfig {
    pub fn model_for(&self, task: TaskKind) -> &str {
        self.models
            .get(&task)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }
}

/// Primary model plus ordered fallbacks for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudRoute {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl CloudRoute {
    pub fn new(primary: impl Into<String>, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: fallbacks.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Primary first, then fallbacks in order
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_per_mtok / 1_000_000.0
            + output_tokens as f64 * self.output_per_mtok / 1_000_000.0
    }
}

/// Metered cloud backend (Anthropic Messages API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub url: String,
    pub routes: HashMap<TaskKind, CloudRoute>,
    pub pricing: HashMap<String, ModelPricing>,
    /// Rates for models without a pricing entry
    pub default_pricing: ModelPricing,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        const SONNET: &str = "claude-sonnet-4-5";
        const HAIKU: &str = "claude-haiku-4-5";

        Self {
            url: "https://api.anthropic.com".to_string(),
            routes: [
                (TaskKind::Code, CloudRoute::new(SONNET, &[HAIKU])),
                (TaskKind::Planning, CloudRoute::new(SONNET, &[HAIKU])),
                (TaskKind::Reflection, CloudRoute::new(SONNET, &[HAIKU])),
                (TaskKind::Chat, CloudRoute::new(HAIKU, &[])),
                (TaskKind::Scoring, CloudRoute::new(HAIKU, &[SONNET])),
            ]
            .into_iter()
            .collect(),
            pricing: [
                (
                    SONNET.to_string(),
                    ModelPricing {
                        input_per_mtok: 3.0,
                        output_per_mtok: 15.0,
                    },
                ),
                (
                    HAIKU.to_string(),
                    ModelPricing {
                        input_per_mtok: 1.0,
                        output_per_mtok: 5.0,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            default_pricing: ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
            timeout_secs: 120,
        }
    }
}

impl CloudConfig {
    pub fn route_for(&self, task: TaskKind) -> Option<&CloudRoute> {
        self.routes.get(&task)
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing
            .get(model)
            .copied()
            .unwrap_or(self.default_pricing)
    }
}

/// Human approval gate for over-budget cloud calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Bounded wait before falling back to local (default: 5 min)
    pub timeout_secs: u64,
    pub poll_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_secs: 5,
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }
}

/// External command that prints one opportunity JSON object per line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

/// External command that launches validations and final builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    600
}

/// Telegram Bot API credentials
#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

/// Resolved configuration with absolute paths and secrets
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to prospector home (state)
    pub home: PathBuf,
    /// Absolute path to the SQLite database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub intervals: IntervalsConfig,
    pub workers: WorkersConfig,
    pub local: LocalConfig,
    pub cloud: CloudConfig,
    /// Absent disables the cloud backend
    pub anthropic_api_key: Option<String>,
    pub approval: ApprovalConfig,
    pub sensors: Vec<SensorConfig>,
    pub launcher: Option<LauncherConfig>,
    pub telegram: Option<TelegramSettings>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".prospector").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Apply file contents and environment over defaults
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = if let Some(env_home) = non_empty_env("PROSPECTOR_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(&base_dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = non_empty_env("PROSPECTOR_DB") {
        PathBuf::from(env_db)
    } else if let Some(ref db_path) = file.paths.database {
        resolve_path(&base_dir, db_path)
    } else {
        home.join("prospector.db")
    };

    let mut local = file.local;
    if let Some(url) = non_empty_env("OLLAMA_URL") {
        local.url = url;
    }

    let telegram = match (
        non_empty_env("TELEGRAM_BOT_TOKEN"),
        non_empty_env("TELEGRAM_CHAT_ID"),
    ) {
        (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
        _ => None,
    };

    ResolvedConfig {
        home,
        database,
        config_file,
        intervals: file.intervals,
        workers: file.workers,
        local,
        cloud: file.cloud,
        anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
        approval: file.approval,
        sensors: file.sensors,
        launcher: file.launcher,
        telegram,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".prospector");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".prospector");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
intervals:
  tick_secs: 600
workers:
  concurrency: 4
local:
  default_model: mistral:7b
  models:
    scoring: phi3:mini
cloud:
  routes:
    planning:
      primary: claude-opus-4-1
      fallbacks: [claude-sonnet-4-5]
approval:
  timeout_secs: 60
sensors:
  - name: hn
    command: ./sensors/hn.sh
launcher:
  command: ./launch.sh
  args: ["--dry-run"]
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1.0"));
        assert_eq!(config.intervals.tick_secs, 600);
        // Unset fields in a present section keep their defaults
        assert_eq!(config.intervals.worker_poll_secs, 10);
        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.local.model_for(TaskKind::Scoring), "phi3:mini");
        assert_eq!(config.local.model_for(TaskKind::Chat), "mistral:7b");

        let route = config.cloud.route_for(TaskKind::Planning).unwrap();
        let chain: Vec<&str> = route.chain().collect();
        assert_eq!(chain, vec!["claude-opus-4-1", "claude-sonnet-4-5"]);

        assert_eq!(config.approval.timeout(), Duration::from_secs(60));
        assert_eq!(config.sensors[0].timeout_secs, 600);
        assert_eq!(config.launcher.unwrap().args, vec!["--dry-run"]);
    }

    #[test]
    fn test_resolve_paths_relative_to_config_dir() {
        let file = ConfigFile {
            paths: PathsConfig {
                home: Some("state".to_string()),
                database: Some("/var/lib/prospector.db".to_string()),
            },
            ..ConfigFile::default()
        };
        let resolved = resolve(
            file,
            Some(PathBuf::from("/project/.prospector/config.yaml")),
            PathBuf::from("/home/user/.prospector"),
        );

        if std::env::var("PROSPECTOR_HOME").is_err() {
            assert_eq!(resolved.home, PathBuf::from("/project/.prospector/state"));
        }
        if std::env::var("PROSPECTOR_DB").is_err() {
            assert_eq!(resolved.database, PathBuf::from("/var/lib/prospector.db"));
        }
    }

    #[test]
    fn test_pricing_cost_is_linear() {
        let cloud = CloudConfig::default();
        let haiku = cloud.pricing_for("claude-haiku-4-5");
        assert!((haiku.cost(1_000_000, 200_000) - 2.0).abs() < 1e-9);

        let unknown = cloud.pricing_for("some-new-model");
        assert_eq!(unknown, cloud.default_pricing);
    }
}
