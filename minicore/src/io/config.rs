//! Agent configuration stored under `.miniswe/configs/<profile>.toml`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::cost::Budget;
use crate::io::write_atomic;

/// Profile used when `--profile` is not given.
pub const DEFAULT_PROFILE: &str = "default";

/// Environment variable naming an extra directory searched for profiles.
pub const CONFIG_DIR_ENV: &str = "MINI_CONFIG_DIR";

/// Agent configuration (TOML).
///
/// Every section and field has a default, so a config file only needs the
/// values it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub model: ModelConfig,
    pub environment: EnvironmentConfig,
    pub agent: AgentSettings,
    pub headless: HeadlessConfig,
}

/// Which model backend serves queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// OpenAI-compatible chat completions over HTTP.
    #[default]
    Openai,
    /// A local program speaking JSON over stdin/stdout.
    Command,
}

/// What to do when a model's price is unknown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CostTracking {
    /// Unknown pricing is a terminal model error.
    #[default]
    Default,
    /// Unknown pricing counts as zero cost.
    IgnoreErrors,
}

impl CostTracking {
    fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "default" => Ok(CostTracking::Default),
            "ignore_errors" => Ok(CostTracking::IgnoreErrors),
            other => Err(anyhow!(
                "cost tracking must be \"default\" or \"ignore_errors\", got {other:?}"
            )),
        }
    }
}

/// Per-million-token prices overriding the built-in table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricingOverride {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    /// Model identifier; `provider/model` is accepted and split by the backend.
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub cost_tracking: CostTracking,
    /// Total attempts for retryable failures (rate limits, 5xx, transport).
    pub retry_attempts: u32,
    /// Program and arguments for the `command` backend.
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingOverride>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: ModelBackend::Openai,
            model_name: "gpt-4o-mini".to_string(),
            api_base: None,
            api_key: None,
            timeout_secs: 120,
            temperature: 0.0,
            max_tokens: None,
            cost_tracking: CostTracking::Default,
            retry_attempts: 10,
            command: Vec::new(),
            pricing: None,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Per-command timeout.
    pub timeout_secs: u64,
    /// Shell program and arguments; the command is appended as the last argument.
    pub shell: Vec<String>,
    /// Captured bytes per stream before the process layer starts dropping output.
    pub output_limit_bytes: usize,
    /// Extra environment variables for every command.
    pub env: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            shell: vec!["bash".to_string(), "-c".to_string()],
            output_limit_bytes: 1_000_000,
            env: BTreeMap::from([
                ("PAGER".to_string(), "cat".to_string()),
                ("MANPAGER".to_string(), "cat".to_string()),
                ("LESS".to_string(), "-R".to_string()),
                ("PIP_PROGRESS_BAR".to_string(), "off".to_string()),
                ("TQDM_DISABLE".to_string(), "1".to_string()),
            ]),
        }
    }
}

impl EnvironmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Maximum steps; 0 disables the check.
    pub step_limit: u32,
    /// Maximum cumulative cost in dollars; 0 disables the check.
    pub cost_limit: f64,
    /// Consecutive unparseable responses tolerated before the run stops.
    pub max_format_errors: u32,
    /// Stop with an error on the first command timeout.
    pub abort_on_timeout: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_template: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            step_limit: 50,
            cost_limit: 5.0,
            max_format_errors: 3,
            abort_on_timeout: false,
            system_template: None,
            instance_template: None,
        }
    }
}

impl AgentSettings {
    pub fn budget(&self) -> Budget {
        Budget {
            cost_limit: self.cost_limit,
            step_limit: self.step_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeadlessConfig {
    pub include_timestamps: bool,
    /// Characters of stdout/stderr kept per step.
    pub max_output_length: usize,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            include_timestamps: true,
            max_output_length: 10_000,
        }
    }
}

/// Values given on the command line. Applied after files and environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub model: Option<String>,
    pub cost_limit: Option<f64>,
    pub step_limit: Option<u32>,
}

impl AgentConfig {
    /// Conservative configuration used when no profile can be found.
    pub fn safe_mode() -> Self {
        let mut cfg = AgentConfig::default();
        cfg.model.model_name = "gpt-4o-mini".to_string();
        cfg.model.cost_tracking = CostTracking::IgnoreErrors;
        cfg.model.timeout_secs = 60;
        cfg.environment.timeout_secs = 60;
        cfg.agent.cost_limit = 1.0;
        cfg.agent.step_limit = 20;
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.model_name.trim().is_empty() {
            return Err(anyhow!("model.model_name must not be empty"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.retry_attempts == 0 {
            return Err(anyhow!("model.retry_attempts must be > 0"));
        }
        if !self.model.temperature.is_finite() || self.model.temperature < 0.0 {
            return Err(anyhow!("model.temperature must be a non-negative number"));
        }
        if self.model.backend == ModelBackend::Command
            && self.model.command.first().is_none_or(|p| p.trim().is_empty())
        {
            return Err(anyhow!(
                "model.command must be a non-empty array for the command backend"
            ));
        }
        if let Some(pricing) = self.model.pricing {
            let valid = |p: f64| p.is_finite() && p >= 0.0;
            if !valid(pricing.input_per_m) || !valid(pricing.output_per_m) {
                return Err(anyhow!("model.pricing values must be non-negative"));
            }
        }
        if self.environment.timeout_secs == 0 {
            return Err(anyhow!("environment.timeout_secs must be > 0"));
        }
        if self.environment.output_limit_bytes == 0 {
            return Err(anyhow!("environment.output_limit_bytes must be > 0"));
        }
        if self.environment.shell.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("environment.shell must be a non-empty array"));
        }
        if !self.agent.cost_limit.is_finite() {
            return Err(anyhow!("agent.cost_limit must be a finite number"));
        }
        if self.headless.max_output_length == 0 {
            return Err(anyhow!("headless.max_output_length must be > 0"));
        }
        Ok(())
    }

    /// Apply `MINI_*` environment variables to the model section.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(base) = get("MINI_API_BASE") {
            self.model.api_base = Some(base);
        }
        if let Some(key) = get("MINI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if self.model.api_key.is_none()
            && let Some(key) = get("OPENAI_API_KEY")
        {
            self.model.api_key = Some(key);
        }
        if let Some(timeout) = get("MINI_API_TIMEOUT") {
            self.model.timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("parse MINI_API_TIMEOUT={timeout:?}"))?;
        }
        if let Some(tracking) = get("MINI_COST_TRACKING") {
            self.model.cost_tracking =
                CostTracking::parse(&tracking).context("parse MINI_COST_TRACKING")?;
        }
        if let Some(attempts) = get("MINI_MODEL_RETRY_ATTEMPTS") {
            self.model.retry_attempts = attempts
                .trim()
                .parse()
                .with_context(|| format!("parse MINI_MODEL_RETRY_ATTEMPTS={attempts:?}"))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(model) = &overrides.model {
            self.model.model_name = model.clone();
        }
        if let Some(cost_limit) = overrides.cost_limit {
            self.agent.cost_limit = cost_limit;
        }
        if let Some(step_limit) = overrides.step_limit {
            self.agent.step_limit = step_limit;
        }
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    SafeMode,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::SafeMode => f.write_str("safe mode"),
        }
    }
}

/// Inputs for [`resolve_config_path`].
#[derive(Debug, Clone)]
pub struct ConfigLookup<'a> {
    /// `--config`; must exist when given.
    pub explicit: Option<&'a Path>,
    /// `--profile`; defaults to [`DEFAULT_PROFILE`].
    pub profile: Option<&'a str>,
    /// Directory holding `.miniswe/`.
    pub workdir: &'a Path,
    /// `$MINI_CONFIG_DIR`, if set.
    pub config_dir: Option<&'a Path>,
}

impl<'a> ConfigLookup<'a> {
    pub fn new(workdir: &'a Path) -> Self {
        Self {
            explicit: None,
            profile: None,
            workdir,
            config_dir: None,
        }
    }
}

/// Find the config file to load, or `None` for safe mode.
///
/// Order: explicit path, then `{workdir}/.miniswe/configs/NAME.toml`, then
/// `{config_dir}/NAME.toml`.
pub fn resolve_config_path(lookup: &ConfigLookup<'_>) -> Result<Option<PathBuf>> {
    if let Some(path) = lookup.explicit {
        if !path.is_file() {
            return Err(anyhow!("config file not found: {}", path.display()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let profile = lookup.profile.unwrap_or(DEFAULT_PROFILE);
    if profile.is_empty() || profile.contains(['/', '\\']) || profile.starts_with('.') {
        return Err(anyhow!("invalid profile name {profile:?}"));
    }
    let file_name = format!("{profile}.toml");
    let mut candidates = vec![
        lookup
            .workdir
            .join(".miniswe")
            .join("configs")
            .join(&file_name),
    ];
    if let Some(dir) = lookup.config_dir {
        candidates.push(dir.join(&file_name));
    }

    for candidate in candidates {
        if candidate.is_file() {
            debug!(path = %candidate.display(), profile, "resolved config");
            return Ok(Some(candidate));
        }
    }
    if lookup.profile.is_some() {
        warn!(profile, "profile not found, using safe mode");
    } else {
        info!("no default profile, using safe mode");
    }
    Ok(None)
}

/// Load config from a TOML file and validate it.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Resolve, load, and apply environment and CLI overrides.
pub fn resolve_config<F>(
    lookup: &ConfigLookup<'_>,
    env: F,
    overrides: &Overrides,
) -> Result<(AgentConfig, ConfigSource)>
where
    F: Fn(&str) -> Option<String>,
{
    let (mut cfg, source) = match resolve_config_path(lookup)? {
        Some(path) => (load_config(&path)?, ConfigSource::File(path)),
        None => (AgentConfig::safe_mode(), ConfigSource::SafeMode),
    };
    cfg.apply_env_overrides(env)?;
    cfg.apply_overrides(overrides);
    cfg.validate()?;
    info!(source = %source, model = %cfg.model.model_name, "configuration loaded");
    Ok((cfg, source))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
