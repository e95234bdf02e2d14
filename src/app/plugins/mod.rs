pub mod simulated;

pub use simulated::SimulatedPlugin;

use crate::config::PluginConfig;
use crate::core::registry::PluginRegistry;
use std::sync::Arc;

/// 依設定建立模擬外掛的 registry
pub fn registry_from_config(plugins: &[PluginConfig]) -> PluginRegistry {
    plugins.iter().fold(PluginRegistry::new(), |registry, config| {
        registry.with(Arc::new(SimulatedPlugin::from_config(config)))
    })
}
