use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Dependency cycle detected between services: {}", services.join(", "))]
    CyclicDependency { services: Vec<String> },

    #[error("Service '{service}' requires '{requires}' which is missing or not active")]
    DependencyNotSatisfied { service: String, requires: String },

    #[error("Resource creation failed for instance {instance}: {message}")]
    ResourceCreationError { instance: String, message: String },

    #[error("Instance {instance} did not reach {expected} within {waited:?}")]
    TimeoutError {
        instance: String,
        expected: String,
        waited: Duration,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("No plugin registered for type '{plugin_type}'")]
    PluginNotRegistered { plugin_type: String },

    #[error("No job registered under name '{name}'")]
    JobNotRegistered { name: String },

    #[error("Job '{job}' gave up on step '{step}' after {attempts} retries: {reason}")]
    RetryExhausted {
        job: String,
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("Illegal status transition {from} -> {to} for instance {instance}")]
    InvalidTransition {
        instance: String,
        from: String,
        to: String,
    },

    #[error("Instance {instance} changed underneath: expected {expected}, found {actual}")]
    StaleInstance {
        instance: String,
        expected: String,
        actual: String,
    },

    #[error("Plugin '{plugin_type}' failed: {message}")]
    PluginError {
        plugin_type: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Dependency,
    Provisioning,
    Scheduling,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl OrchestratorError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    pub fn plugin(plugin_type: &str, message: impl Into<String>) -> Self {
        Self::PluginError {
            plugin_type: plugin_type.to_string(),
            message: message.into(),
        }
    }

    /// 是否為「找不到」類錯誤 (失敗處理器中需容忍並發刪除)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError { .. }
            | Self::ConfigValidationError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. } => ErrorCategory::Configuration,
            Self::ValidationError { .. } | Self::CyclicDependency { .. } => {
                ErrorCategory::Validation
            }
            Self::DependencyNotSatisfied { .. } => ErrorCategory::Dependency,
            Self::ResourceCreationError { .. }
            | Self::TimeoutError { .. }
            | Self::PluginError { .. }
            | Self::PluginNotRegistered { .. }
            | Self::InvalidTransition { .. } => ErrorCategory::Provisioning,
            Self::JobNotRegistered { .. } | Self::RetryExhausted { .. } => {
                ErrorCategory::Scheduling
            }
            Self::IoError(_)
            | Self::SerializationError(_)
            | Self::NotFound { .. }
            | Self::StaleInstance { .. } => ErrorCategory::Storage,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::DependencyNotSatisfied { .. } => ErrorSeverity::Low,
            Self::TimeoutError { .. }
            | Self::RetryExhausted { .. }
            | Self::StaleInstance { .. } => ErrorSeverity::Medium,
            Self::IoError(_) | Self::JobNotRegistered { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => "Check the TOML configuration file and CLI flags",
            ErrorCategory::Validation => {
                "Fix the capability manifest: service names, plugin types, templates and requires links"
            }
            ErrorCategory::Dependency => "Provision the required service first, then re-apply",
            ErrorCategory::Provisioning => {
                "Inspect the instance error message; re-applying the capability repairs failed instances"
            }
            ErrorCategory::Scheduling => {
                "Wait for the other capability build on this account to finish, then retry"
            }
            ErrorCategory::Storage => "Verify the account and capability still exist",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::TimeoutError { instance, .. } => {
                format!("Provisioning of instance {} timed out", instance)
            }
            Self::CyclicDependency { services } => {
                format!("Services depend on each other in a loop: {}", services.join(" -> "))
            }
            Self::RetryExhausted { job, .. } => {
                format!("Job '{}' could not start because the account is busy", job)
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
