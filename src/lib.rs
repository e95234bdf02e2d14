pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::{CapabilityManifest, OrchestratorConfig};

pub use adapters::InMemoryStore;
pub use crate::core::{
    CapabilityProvisioningOrchestrator, OrchestratorSettings, PluginRegistry, RequirementPolicy,
    ServiceInstanceLifecycleManager, TaskExecutionBridge,
};
pub use utils::error::{OrchestratorError, Result};
