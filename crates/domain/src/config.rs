//! Runtime configuration, loaded from a TOML file with serde defaults.
//!
//! Every section has a `Default` impl so a missing section or a missing
//! key falls back to a sane value; `Config::validate` reports issues
//! without aborting (the caller decides what is fatal).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::llm::Tier;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub iteration: IterationConfig,
    pub middleware: MiddlewareToggles,
    pub tools: ToolsConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8460".into(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for all persisted state (runs, traces, sessions, snapshots).
    pub state_dir: PathBuf,
    /// Root directory workers are allowed to touch.
    pub workspace_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data"),
            workspace_root: PathBuf::from("."),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM tiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One concrete model endpoint for a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierEndpoint {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "FOREMAN_API_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Tier name → endpoint. Keys are `small`, `medium`, `large`.
    pub tiers: HashMap<String, TierEndpoint>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            tiers: HashMap::new(),
            temperature: 0.2,
            request_timeout_secs: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running subtasks.
    pub max_parallel_workers: usize,
    /// Per-subtask retry ceiling (ladder steps and verification retries).
    pub max_retries: u32,
    /// Base for exponential backoff between ladder retries.
    pub backoff_base_ms: u64,
    /// Default ladder for workers that do not declare one.
    pub escalation_ladder: Vec<Tier>,
    pub enable_escalation: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 4,
            max_retries: 2,
            backoff_base_ms: 500,
            escalation_ladder: vec![Tier::Small, Tier::Medium, Tier::Large],
            enable_escalation: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iteration loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    pub max_iterations: u32,
    pub max_tokens: u64,
    /// Fraction of `max_tokens` at which a convergence nudge is injected.
    pub soft_limit_ratio: f64,
    /// Fraction of `max_tokens` at which the loop is stopped.
    pub hard_limit_ratio: f64,
    pub force_synthesis_on_hard_limit: bool,
    /// Iterations without progress before the stuck signal fires.
    pub stuck_threshold: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_tokens: 200_000,
            soft_limit_ratio: 0.8,
            hard_limit_ratio: 1.0,
            force_synthesis_on_hard_limit: true,
            stuck_threshold: 4,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middlewares
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareToggles {
    pub analytics: bool,
    pub search_signal: bool,
    pub todo_sync: bool,
    pub task_classifier: bool,
    pub reflection: bool,
    /// Reflection every N tool calls.
    pub reflection_interval: u32,
    /// FactSheet LLM summarization every N iterations.
    pub summarization_interval: u32,
    /// Tool outputs longer than this are truncated.
    pub max_output_length: usize,
    pub factsheet_max_entries: usize,
    pub factsheet_max_tokens: usize,
    /// Per-hook timeout. 0 = unlimited.
    pub hook_timeout_ms: u64,
}

impl Default for MiddlewareToggles {
    fn default() -> Self {
        Self {
            analytics: false,
            search_signal: false,
            todo_sync: false,
            task_classifier: false,
            reflection: true,
            reflection_interval: 8,
            summarization_interval: 5,
            max_output_length: 16_384,
            factsheet_max_entries: 64,
            factsheet_max_tokens: 4_000,
            hook_timeout_ms: 5_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Glob patterns of tool names a worker may use. Empty = all.
    pub allow: Vec<String>,
    /// Glob patterns of tool names that are always denied. Deny wins.
    pub deny: Vec<String>,
    /// Glob patterns of filesystem paths writes are restricted to.
    pub path_allow: Vec<String>,
    pub path_deny: Vec<String>,
    pub shell_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            path_allow: Vec::new(),
            path_deny: vec!["**/.git/**".into()],
            shell_timeout_secs: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File history retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_sessions: usize,
    pub max_age_days: u32,
    pub max_total_size_mb: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_age_days: 30,
            max_total_size_mb: 512,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Parse a TOML document into a config.
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        toml::from_str(raw).map_err(|e| crate::Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.iteration.soft_limit_ratio >= self.iteration.hard_limit_ratio {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!(
                    "iteration.soft_limit_ratio ({}) must be below hard_limit_ratio ({})",
                    self.iteration.soft_limit_ratio, self.iteration.hard_limit_ratio
                ),
            });
        }
        if self.iteration.max_iterations == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "iteration.max_iterations must be at least 1".into(),
            });
        }
        if self.orchestrator.max_parallel_workers == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "orchestrator.max_parallel_workers must be at least 1".into(),
            });
        }
        for name in self.llm.tiers.keys() {
            if name.parse::<Tier>().is_err() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!("llm.tiers.{name} is not a known tier (small|medium|large)"),
                });
            }
        }
        if self.llm.tiers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "no llm.tiers configured; only mock clients will be available".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_with_warnings_only() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            [iteration]
            max_iterations = 10

            [llm.tiers.small]
            base_url = "http://localhost:11434/v1"
            model = "qwen2.5:7b"
            "#,
        )
        .unwrap();
        assert_eq!(config.iteration.max_iterations, 10);
        assert_eq!(config.iteration.stuck_threshold, 4);
        assert_eq!(config.llm.tiers["small"].model, "qwen2.5:7b");
        assert_eq!(config.llm.tiers["small"].api_key_env, "FOREMAN_API_KEY");
    }

    #[test]
    fn inverted_ratios_are_an_error() {
        let mut config = Config::default();
        config.iteration.soft_limit_ratio = 1.0;
        config.iteration.hard_limit_ratio = 0.8;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn unknown_tier_name_warns() {
        let config = Config::from_toml(
            r#"
            [llm.tiers.huge]
            base_url = "http://x"
            model = "m"
            "#,
        )
        .unwrap();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.message.contains("huge") && i.severity == ConfigSeverity::Warning));
    }
}
