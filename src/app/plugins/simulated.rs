use crate::config::PluginConfig;
use crate::domain::model::{InstanceStatus, Params, ServiceInstance};
use crate::domain::ports::{PluginKind, ResourcePlugin};
use crate::utils::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// 不接外部系統的外掛，以延遲模擬資源建立
#[derive(Debug, Clone)]
pub struct SimulatedPlugin {
    plugin_type: String,
    kind: PluginKind,
    latency: Duration,
    fail_on_create: bool,
}

impl SimulatedPlugin {
    pub fn new(plugin_type: &str, kind: PluginKind) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            kind,
            latency: Duration::ZERO,
            fail_on_create: false,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            plugin_type: config.plugin_type.clone(),
            kind: config.kind,
            latency: Duration::from_millis(config.latency_ms),
            fail_on_create: config.fail_on_create,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_on_create = true;
        self
    }

    async fn simulate(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ResourcePlugin for SimulatedPlugin {
    fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    async fn create_resource(&self, instance: &ServiceInstance, params: &Params) -> Result<String> {
        self.simulate().await;
        if self.fail_on_create {
            return Err(OrchestratorError::plugin(
                &self.plugin_type,
                format!("simulated failure creating '{}'", instance.name),
            ));
        }

        let resource_id = format!("{}-{}", self.plugin_type, instance.id.simple());
        tracing::debug!(
            "🧪 Simulated {} for '{}' with {} param(s)",
            resource_id,
            instance.name,
            params.len()
        );
        Ok(resource_id)
    }

    async fn update_resource(&self, _instance: &ServiceInstance, _params: &Params) -> Result<()> {
        self.simulate().await;
        Ok(())
    }

    async fn patch_resource(&self, _instance: &ServiceInstance, _params: &Params) -> Result<()> {
        self.simulate().await;
        Ok(())
    }

    async fn action_resource(
        &self,
        _instance: &ServiceInstance,
        params: &Params,
    ) -> Result<Option<InstanceStatus>> {
        self.simulate().await;
        match params.get("action").and_then(|v| v.as_str()) {
            Some("stop") => Ok(Some(InstanceStatus::Stopping)),
            Some("start") => Ok(Some(InstanceStatus::Active)),
            Some("shutdown") => Ok(Some(InstanceStatus::ShuttingDown)),
            Some(other) => Err(OrchestratorError::plugin(
                &self.plugin_type,
                format!("unsupported action '{}'", other),
            )),
            None => Ok(None),
        }
    }

    async fn delete_resource(&self, _instance: &ServiceInstance, _params: &Params) -> Result<()> {
        self.simulate().await;
        Ok(())
    }
}
