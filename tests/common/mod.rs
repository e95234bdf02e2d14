#![allow(dead_code)]

use async_trait::async_trait;
use capability_orchestrator::domain::model::{
    Account, AccountId, Capability, CapabilityId, InstanceStatus, Params, ServiceInstance,
};
use capability_orchestrator::domain::ports::{PluginKind, ResourcePlugin};
use capability_orchestrator::{
    CapabilityProvisioningOrchestrator, InMemoryStore, OrchestratorError, OrchestratorSettings,
    PluginRegistry, RequirementPolicy,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 跨外掛共用的呼叫紀錄，格式為 "op:type/name"
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct RecordingPlugin {
    plugin_type: String,
    kind: PluginKind,
    create_latency: Duration,
    fail_create: bool,
    log: CallLog,
}

impl RecordingPlugin {
    pub fn new(plugin_type: &str, kind: PluginKind, log: &CallLog) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            kind,
            create_latency: Duration::ZERO,
            fail_create: false,
            log: log.clone(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_create = true;
        self
    }

    fn record(&self, op: &str, instance: &ServiceInstance) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}/{}", op, instance.plugin_type, instance.name));
    }
}

#[async_trait]
impl ResourcePlugin for RecordingPlugin {
    fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    async fn create_resource(
        &self,
        instance: &ServiceInstance,
        _params: &Params,
    ) -> capability_orchestrator::Result<String> {
        self.record("create", instance);
        if !self.create_latency.is_zero() {
            tokio::time::sleep(self.create_latency).await;
        }
        if self.fail_create {
            return Err(OrchestratorError::plugin(&self.plugin_type, "quota exceeded"));
        }
        Ok(format!("res-{}", instance.name))
    }

    async fn update_resource(
        &self,
        instance: &ServiceInstance,
        _params: &Params,
    ) -> capability_orchestrator::Result<()> {
        self.record("update", instance);
        Ok(())
    }

    async fn patch_resource(
        &self,
        instance: &ServiceInstance,
        _params: &Params,
    ) -> capability_orchestrator::Result<()> {
        self.record("patch", instance);
        Ok(())
    }

    async fn action_resource(
        &self,
        instance: &ServiceInstance,
        _params: &Params,
    ) -> capability_orchestrator::Result<Option<InstanceStatus>> {
        self.record("action", instance);
        Ok(None)
    }

    async fn delete_resource(
        &self,
        instance: &ServiceInstance,
        _params: &Params,
    ) -> capability_orchestrator::Result<()> {
        self.record("delete", instance);
        Ok(())
    }

    async fn expunge_instance(&self, instance: &ServiceInstance) -> capability_orchestrator::Result<()> {
        self.record("expunge", instance);
        Ok(())
    }
}

/// 測試用的短間隔設定
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        sync: true,
        requirement_policy: RequirementPolicy::Lenient,
        poll_interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(2),
        retry_countdown: Duration::from_millis(20),
        max_retries: 3,
    }
}

/// core 為嵌入式外掛，其餘為一般外掛
pub fn standard_plugins(log: &CallLog) -> Vec<RecordingPlugin> {
    vec![
        RecordingPlugin::new("core", PluginKind::Core, log),
        RecordingPlugin::new("database", PluginKind::Simple, log),
        RecordingPlugin::new("cache", PluginKind::Simple, log),
        RecordingPlugin::new("T", PluginKind::Simple, log),
    ]
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub orchestrator: CapabilityProvisioningOrchestrator,
    pub log: CallLog,
    pub account: AccountId,
}

impl Harness {
    pub async fn new(
        settings: OrchestratorSettings,
        plugins: impl FnOnce(&CallLog) -> Vec<RecordingPlugin>,
    ) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let registry = plugins(&log)
            .into_iter()
            .fold(PluginRegistry::new(), |registry, plugin| {
                registry.with(Arc::new(plugin))
            });

        let store = Arc::new(InMemoryStore::new());
        let account = store.insert_account(Account::new("acme")).await;
        let orchestrator = CapabilityProvisioningOrchestrator::new(store.clone(), registry, settings);

        Self {
            store,
            orchestrator,
            log,
            account,
        }
    }

    pub async fn standard() -> Self {
        Self::new(fast_settings(), standard_plugins).await
    }

    pub async fn capability(&self, capability: Capability) -> CapabilityId {
        self.store.insert_capability(capability).await
    }

    /// 取出某種操作的呼叫，回傳 "type/name"
    pub fn calls(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}
