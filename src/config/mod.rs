#[cfg(feature = "cli")]
pub mod cli;
pub mod manifest;
pub mod toml_config;

#[cfg(feature = "cli")]
pub use cli::CliConfig;
pub use manifest::CapabilityManifest;
pub use toml_config::{OrchestratorConfig, PluginConfig};
