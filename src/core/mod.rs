pub mod bridge;
pub mod job;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod resolver;

pub use crate::domain::ports::{PluginKind, ResourcePlugin, ServiceInstanceStore};
pub use crate::utils::error::Result;
pub use bridge::{BridgeSettings, TaskExecutionBridge};
pub use lifecycle::ServiceInstanceLifecycleManager;
pub use orchestrator::{CapabilityProvisioningOrchestrator, OrchestratorSettings};
pub use registry::PluginRegistry;
pub use resolver::{DependencyGraphResolver, RequirementPolicy};
