use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{ProjectScope, DEFAULT_FEATURES_PATH};

pub const CONFIG_FILE: &str = "feature-golem.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FeatureGolemConfig {
    pub project: ProjectConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub prefix: String,
    pub features_path: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: u32,
    pub tick_interval_ms: u64,
    pub max_attempts: u32,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub cli: CliTool,
    pub model: Option<String>,
    pub timeout_minutes: u32,
}

/// Which AI coding CLI the subprocess executor drives.
#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            CliTool::Claude => "Claude CLI",
            CliTool::OpenCode => "OpenCode CLI",
        }
    }

    /// Arguments for a non-interactive run. The prompt is always last.
    pub fn build_args(&self, prompt: &str, model: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            CliTool::Claude => {
                args.push("--dangerously-skip-permissions".to_string());
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("-p".to_string());
            }
            CliTool::OpenCode => {
                args.push("run".to_string());
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("--quiet".to_string());
            }
        }
        args.push(prompt.to_string());
        args
    }

    pub fn version_args(&self) -> Vec<&'static str> {
        vec!["--version"]
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            CliTool::Claude => "Install with: npm install -g @anthropic-ai/claude-code",
            CliTool::OpenCode => "Install with: npm install -g opencode-ai",
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            prefix: "FG".to_string(),
            features_path: DEFAULT_FEATURES_PATH.to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            tick_interval_ms: 5000,
            max_attempts: 3,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli: CliTool::default(),
            model: None,
            timeout_minutes: 60,
        }
    }
}

impl FeatureGolemConfig {
    pub fn scope(&self, project_root: &Path) -> ProjectScope {
        ProjectScope::with_features_path(project_root, Path::new(&self.project.features_path))
    }
}

pub fn validate(config: &FeatureGolemConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let prefix = &config.project.prefix;
    if prefix.is_empty() {
        errors.push("project.prefix must not be empty".to_string());
    } else if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        errors.push(format!(
            "project.prefix '{}' may only contain ASCII letters, digits and '_'",
            prefix
        ));
    }

    if config.project.features_path.trim().is_empty() {
        errors.push("project.features_path must not be empty".to_string());
    }

    if config.scheduler.max_concurrency < 1 {
        errors.push("scheduler.max_concurrency must be >= 1".to_string());
    }

    if config.scheduler.tick_interval_ms < 10 {
        errors.push("scheduler.tick_interval_ms must be >= 10".to_string());
    }

    if config.scheduler.max_attempts < 1 {
        errors.push("scheduler.max_attempts must be >= 1".to_string());
    }

    if config.agent.timeout_minutes < 1 {
        errors.push("agent.timeout_minutes must be >= 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Blank model strings mean "use the CLI's default".
pub fn normalize_agent_config(config: &mut FeatureGolemConfig) {
    if config
        .agent
        .model
        .as_deref()
        .is_some_and(|m| m.trim().is_empty())
    {
        config.agent.model = None;
    }
}

/// Load `feature-golem.toml` from the project root, or defaults if absent.
pub fn load_config(project_root: &Path) -> Result<FeatureGolemConfig, String> {
    load_config_from(None, project_root)
}

/// Load config from an explicit path, falling back to `<root>/feature-golem.toml`.
///
/// An explicit path that does not exist is an error; a missing default file
/// yields the defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<FeatureGolemConfig, String> {
    let path: PathBuf = match config_path {
        Some(p) => {
            if !p.exists() {
                return Err(format!("Config file not found: {}", p.display()));
            }
            p.to_path_buf()
        }
        None => {
            let default_path = project_root.join(CONFIG_FILE);
            if !default_path.exists() {
                return Ok(FeatureGolemConfig::default());
            }
            default_path
        }
    };

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: FeatureGolemConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize_agent_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
