use crate::config::toml_config::substitute_env_vars;
use crate::domain::model::{Capability, Definition, Params, ServiceDescription};
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::validation::{validate_non_empty_string, validate_unique, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// TOML 格式的 Capability 文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub capability: CapabilitySection,
    #[serde(default)]
    pub definitions: Vec<DefinitionEntry>,
    #[serde(default)]
    pub services: Vec<ServiceDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySection {
    pub name: String,
    /// 要掛到帳戶上的定義名稱
    #[serde(default)]
    pub definitions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionEntry {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl CapabilityManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(OrchestratorError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| OrchestratorError::ConfigValidationError {
            field: "manifest".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 轉為可寫入 store 的 Capability 與定義
    pub fn into_parts(self) -> (Capability, Vec<Definition>) {
        let definitions = self
            .definitions
            .into_iter()
            .map(|d| Definition::new(&d.name, d.params))
            .collect();
        let capability = Capability::new(&self.capability.name, self.services)
            .with_definitions(self.capability.definitions);
        (capability, definitions)
    }

    fn is_declared(&self, definition: &str) -> bool {
        self.definitions.iter().any(|d| d.name == definition)
    }
}

impl Validate for CapabilityManifest {
    fn validate(&self) -> Result<()> {
        validate_non_empty_string("capability.name", &self.capability.name)?;

        for definition in &self.definitions {
            validate_non_empty_string("definitions.name", &definition.name)?;
        }
        validate_unique("definitions.name", self.definitions.iter().map(|d| &d.name))?;

        for name in &self.capability.definitions {
            if !self.is_declared(name) {
                return Err(OrchestratorError::InvalidConfigValueError {
                    field: "capability.definitions".to_string(),
                    value: name.clone(),
                    reason: "Definition is not declared in [[definitions]]".to_string(),
                });
            }
        }

        for service in &self.services {
            validate_non_empty_string("services.name", &service.name)?;
            validate_non_empty_string("services.plugin_type", &service.plugin_type)?;
            if let Some(template) = &service.template {
                if !self.is_declared(template) {
                    return Err(OrchestratorError::InvalidConfigValueError {
                        field: "services.template".to_string(),
                        value: template.clone(),
                        reason: format!("Template of '{}' is not declared", service.key()),
                    });
                }
            }
        }
        let keys: Vec<String> = self.services.iter().map(|s| s.key()).collect();
        validate_unique("services", &keys)?;

        Ok(())
    }
}
