use crate::core::orchestrator::OrchestratorSettings;
use crate::core::resolver::RequirementPolicy;
use crate::domain::ports::PluginKind;
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_one_of, validate_positive_number, validate_range,
    validate_unique, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub orchestrator: OrchestratorSection,
    pub runtime: RuntimeSection,
    pub logging: LoggingSection,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub sync: bool,
    pub requirement_policy: RequirementPolicy,
    pub poll_interval_ms: u64,
    pub max_wait_seconds: u64,
    pub max_retries: u32,
    pub retry_countdown_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            sync: false,
            requirement_policy: RequirementPolicy::Lenient,
            poll_interval_ms: 1000,
            max_wait_seconds: 600,
            max_retries: 5,
            retry_countdown_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub worker_threads: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: String,
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: "compact".to_string(),
            level: "info".to_string(),
        }
    }
}

/// 模擬外掛的設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub plugin_type: String,
    #[serde(default = "default_plugin_kind")]
    pub kind: PluginKind,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub fail_on_create: bool,
}

fn default_plugin_kind() -> PluginKind {
    PluginKind::Simple
}

impl OrchestratorConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(OrchestratorError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| OrchestratorError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    pub fn settings(&self) -> OrchestratorSettings {
        let o = &self.orchestrator;
        OrchestratorSettings {
            sync: o.sync,
            requirement_policy: o.requirement_policy,
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            max_wait: Duration::from_secs(o.max_wait_seconds),
            retry_countdown: Duration::from_millis(o.retry_countdown_ms),
            max_retries: o.max_retries,
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.runtime.worker_threads
    }

    pub fn json_logging(&self) -> bool {
        self.logging.format == "json"
    }
}

/// 替換環境變數 (例如 ${PLUGIN_LATENCY})
pub(crate) fn substitute_env_vars(content: &str) -> Result<String> {
    use regex::Regex;
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| OrchestratorError::ConfigError {
        message: format!("invalid substitution pattern: {}", e),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl Validate for OrchestratorConfig {
    fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        validate_positive_number("orchestrator.poll_interval_ms", o.poll_interval_ms, 1)?;
        validate_positive_number("orchestrator.max_wait_seconds", o.max_wait_seconds, 1)?;
        validate_range("orchestrator.max_retries", o.max_retries, 0, 100)?;

        if o.poll_interval_ms > o.max_wait_seconds * 1000 {
            return Err(OrchestratorError::ConfigValidationError {
                field: "orchestrator.poll_interval_ms".to_string(),
                message: "poll interval must not exceed max_wait_seconds".to_string(),
            });
        }

        validate_range("runtime.worker_threads", self.runtime.worker_threads, 1, 256)?;
        validate_one_of("logging.format", &self.logging.format, &["compact", "json"])?;
        validate_one_of(
            "logging.level",
            &self.logging.level,
            &["trace", "debug", "info", "warn", "error"],
        )?;

        for plugin in &self.plugins {
            validate_non_empty_string("plugins.plugin_type", &plugin.plugin_type)?;
        }
        validate_unique(
            "plugins.plugin_type",
            self.plugins.iter().map(|p| &p.plugin_type),
        )?;

        Ok(())
    }
}
