use crate::domain::ports::{PluginKind, ResourcePlugin};
use crate::utils::error::{OrchestratorError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// 外掛類型名稱 -> 實作 的明確對照表，於啟動時建立完成
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ResourcePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn ResourcePlugin>) -> &mut Self {
        let plugin_type = plugin.plugin_type().to_string();
        if self.plugins.insert(plugin_type.clone(), plugin).is_some() {
            tracing::warn!("🔁 Plugin '{}' registered twice, keeping the latest", plugin_type);
        }
        self
    }

    pub fn with(mut self, plugin: Arc<dyn ResourcePlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn resolve(&self, plugin_type: &str) -> Result<Arc<dyn ResourcePlugin>> {
        self.plugins
            .get(plugin_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::PluginNotRegistered {
                plugin_type: plugin_type.to_string(),
            })
    }

    pub fn kind(&self, plugin_type: &str) -> Result<PluginKind> {
        self.resolve(plugin_type).map(|plugin| plugin.kind())
    }

    pub fn contains(&self, plugin_type: &str) -> bool {
        self.plugins.contains_key(plugin_type)
    }

    pub fn plugin_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
