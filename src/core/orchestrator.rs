use crate::core::bridge::{BridgeSettings, TaskExecutionBridge};
use crate::core::job::{
    EntityRef, JobContext, JobFactory, JobHooks, JobId, JobOutcome, JobRecord, JobRegistry,
    JobStep, PreparedJob, StepOutcome,
};
use crate::core::lifecycle::{
    merge_params, register_lifecycle_jobs, ServiceInstanceLifecycleManager, CREATE_INSTANCE_JOB,
    DELETE_INSTANCE_JOB,
};
use crate::core::registry::PluginRegistry;
use crate::core::resolver::{DependencyGraphResolver, RequirementPolicy};
use crate::domain::model::{
    AccountId, Capability, CapabilityId, CapabilityStatus, InstanceId, InstanceStatus, Params,
    ServiceDescription,
};
use crate::domain::ports::{PluginKind, ServiceInstanceStore};
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::validation::validate_non_empty_string;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const APPLY_CAPABILITY_JOB: &str = "apply_capability";

const PROVISION_STEP: &str = "provision_services";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// true 時 apply 在呼叫端同步執行
    pub sync: bool,
    pub requirement_policy: RequirementPolicy,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub retry_countdown: Duration,
    pub max_retries: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            sync: false,
            requirement_policy: RequirementPolicy::Lenient,
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(600),
            retry_countdown: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

/// 單一服務描述的處理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Repaired,
    Skipped,
    Deferred,
}

/// provision_services step 的摘要，作為 job 結果保存
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProvisionReport {
    pub levels: usize,
    pub created: Vec<String>,
    pub repaired: Vec<String>,
    pub skipped: Vec<String>,
    pub deferred: Vec<String>,
}

impl ProvisionReport {
    fn record(&mut self, description: &ServiceDescription, outcome: ApplyOutcome) {
        let bucket = match outcome {
            ApplyOutcome::Created => &mut self.created,
            ApplyOutcome::Repaired => &mut self.repaired,
            ApplyOutcome::Skipped => &mut self.skipped,
            ApplyOutcome::Deferred => &mut self.deferred,
        };
        bucket.push(description.key());
    }
}

/// 同一帳戶同時只允許一個 apply job 持有租約
#[derive(Debug, Default)]
struct LeaseTable {
    held: Mutex<HashMap<AccountId, (CapabilityId, JobId)>>,
}

impl LeaseTable {
    fn acquire(
        &self,
        account: AccountId,
        capability: CapabilityId,
        job: JobId,
    ) -> std::result::Result<(), &'static str> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(&account) {
            Some((_, holder)) if *holder == job => Ok(()),
            Some((cap, _)) if *cap == capability => {
                Err("capability is already being applied by another job")
            }
            Some(_) => Err("another capability is building for this account"),
            None => {
                held.insert(account, (capability, job));
                Ok(())
            }
        }
    }

    /// 同一個 Capability 是否正由另一個 job 套用中
    fn held_by_other(&self, account: AccountId, capability: CapabilityId, job: JobId) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        matches!(held.get(&account), Some((cap, holder)) if *cap == capability && *holder != job)
    }

    fn release(&self, account: AccountId, job: JobId) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(held.get(&account), Some((_, holder)) if *holder == job) {
            held.remove(&account);
        }
    }
}

/// 供各 step 共用的狀態
struct OrchestratorCore {
    store: Arc<dyn ServiceInstanceStore>,
    lifecycle: Arc<ServiceInstanceLifecycleManager>,
    resolver: DependencyGraphResolver,
    settings: OrchestratorSettings,
    leases: LeaseTable,
}

impl OrchestratorCore {
    /// 在任何變更之前檢查 Capability 是否可佈建
    async fn validate(&self, capability: &Capability) -> Result<Vec<Vec<ServiceDescription>>> {
        let mut seen = HashSet::new();
        for description in &capability.services {
            validate_non_empty_string("service.name", &description.name)
                .map_err(|e| OrchestratorError::validation(e.to_string()))?;

            if !seen.insert((description.plugin_type.as_str(), description.name.as_str())) {
                return Err(OrchestratorError::validation(format!(
                    "service '{}' is declared twice in capability '{}'",
                    description.key(),
                    capability.name
                )));
            }
            if !self.lifecycle.plugins().contains(&description.plugin_type) {
                return Err(OrchestratorError::validation(format!(
                    "service '{}' uses unregistered plugin type '{}'",
                    description.name, description.plugin_type
                )));
            }
            if let Some(template) = &description.template {
                if let Err(e) = self.store.get_service_definition(template).await {
                    return Err(OrchestratorError::validation(format!(
                        "service '{}' references template '{}': {}",
                        description.name, template, e
                    )));
                }
            }
        }

        self.resolver.resolve(&capability.services)
    }

    async fn effective_params(&self, description: &ServiceDescription) -> Result<Params> {
        match &description.template {
            Some(template) => {
                let definition = self.store.get_service_definition(template).await?;
                Ok(merge_params(&definition.params, &description.params))
            }
            None => Ok(description.params.clone()),
        }
    }

    /// 冪等地處理單一服務描述：略過、修復或建立
    async fn apply_one(
        &self,
        ctx: &JobContext,
        bridge: &Arc<TaskExecutionBridge>,
        account: AccountId,
        description: &ServiceDescription,
    ) -> Result<ApplyOutcome> {
        let mut repaired = false;

        if let Some(existing) = self
            .store
            .get_service_instance(account, &description.plugin_type, &description.name)
            .await?
        {
            if existing.is_active() {
                tracing::debug!("⏭️ '{}' already ACTIVE, skipping", description.key());
                return Ok(ApplyOutcome::Skipped);
            }

            tracing::warn!(
                "🔧 '{}' found in {}, deleting before recreate",
                description.key(),
                existing.status
            );
            let mut force = Params::new();
            force.insert("force".to_string(), serde_json::Value::Bool(true));
            bridge
                .prepare_or_run(EntityRef::Instance(existing.id), DELETE_INSTANCE_JOB, force, true)
                .await?;
            repaired = true;
        }

        let parent = match &description.requires {
            Some(requirement) => {
                let required = self
                    .store
                    .get_service_instance(account, &requirement.plugin_type, &requirement.name)
                    .await?;
                match required {
                    Some(instance) if instance.is_active() => Some(instance.id),
                    _ => {
                        let unmet = OrchestratorError::DependencyNotSatisfied {
                            service: description.key(),
                            requires: requirement.to_string(),
                        };
                        tracing::warn!("⏸️ {}", unmet);
                        return Ok(ApplyOutcome::Deferred);
                    }
                }
            }
            None => None,
        };

        let params = self.effective_params(description).await?;
        let instance = self
            .store
            .add_service_instance(account, description, params)
            .await?;
        if let Some(parent) = parent {
            self.store.link_instances(instance.id, parent).await?;
        }

        match self.lifecycle.plugins().kind(&description.plugin_type)? {
            PluginKind::Core => {
                let job = bridge
                    .prepare(CREATE_INSTANCE_JOB, EntityRef::Instance(instance.id), Params::new())
                    .await?;
                bridge.run_embedded(job, ctx, PROVISION_STEP).await?;
            }
            PluginKind::Simple => self.create_simple(bridge, instance.id).await?,
        }

        tracing::info!("✅ '{}' is ACTIVE ({})", description.key(), instance.id);
        Ok(if repaired {
            ApplyOutcome::Repaired
        } else {
            ApplyOutcome::Created
        })
    }

    /// 一般服務：交給背景 worker 建立，再等待 ACTIVE
    async fn create_simple(&self, bridge: &Arc<TaskExecutionBridge>, id: InstanceId) -> Result<()> {
        self.lifecycle.mark_pending(id).await?;
        bridge
            .prepare_or_run(EntityRef::Instance(id), CREATE_INSTANCE_JOB, Params::new(), false)
            .await?;

        let waited = bridge
            .wait_for_active(
                id,
                self.settings.poll_interval,
                InstanceStatus::Active,
                self.settings.max_wait,
            )
            .await;
        if let Err(e) = &waited {
            self.lifecycle.fail(id, e).await;
        }
        waited.map(|_| ())
    }
}

fn capability_of(entity: EntityRef) -> Result<(AccountId, CapabilityId)> {
    match entity {
        EntityRef::Capability {
            account,
            capability,
        } => Ok((account, capability)),
        other => Err(OrchestratorError::validation(format!(
            "apply_capability acts on capabilities, got {}",
            other
        ))),
    }
}

struct ClaimStep {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobStep for ClaimStep {
    fn id(&self) -> &str {
        "claim"
    }

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome> {
        let (account_id, capability_id) = capability_of(ctx.entity)?;
        let account = self.core.store.get_account(account_id).await?;
        let capability = self.core.store.get_capability(capability_id).await?;

        let retry = |reason: &str| StepOutcome::Retry {
            countdown: self.core.settings.retry_countdown,
            reason: reason.to_string(),
        };

        if account.is_building_other(capability_id) {
            return Ok(retry("another capability is building for this account"));
        }
        if let Err(reason) = self.core.leases.acquire(account_id, capability_id, ctx.job_id) {
            return Ok(retry(reason));
        }

        self.core
            .store
            .set_capability_status(account_id, capability_id, CapabilityStatus::Building)
            .await?;
        bridge
            .progress(
                ctx.job_id,
                self.id(),
                format!("'{}' is BUILDING on account '{}'", capability.name, account.name),
            )
            .await;
        Ok(StepOutcome::done())
    }
}

/// 掛上帳戶層級定義；個別失敗只記錄不中斷
struct AttachDefinitionsStep {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobStep for AttachDefinitionsStep {
    fn id(&self) -> &str {
        "attach_definitions"
    }

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome> {
        let (account_id, capability_id) = capability_of(ctx.entity)?;
        let capability = self.core.store.get_capability(capability_id).await?;

        let mut attached = 0usize;
        for name in &capability.definitions {
            let definition = match self.core.store.get_service_definition(name).await {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping definition '{}': {}", name, e);
                    continue;
                }
            };
            match self
                .core
                .store
                .attach_definition_to_account(account_id, &definition)
                .await
            {
                Ok(true) => attached += 1,
                Ok(false) => tracing::debug!("Definition '{}' already attached", name),
                Err(e) => tracing::warn!("⚠️ Could not attach definition '{}': {}", name, e),
            }
        }

        bridge
            .progress(ctx.job_id, self.id(), format!("{} definition(s) attached", attached))
            .await;
        Ok(StepOutcome::done())
    }
}

struct ProvisionServicesStep {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobStep for ProvisionServicesStep {
    fn id(&self) -> &str {
        PROVISION_STEP
    }

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome> {
        let (account_id, capability_id) = capability_of(ctx.entity)?;
        let capability = self.core.store.get_capability(capability_id).await?;
        let levels = self.core.resolver.resolve(&capability.services)?;

        let mut report = ProvisionReport {
            levels: levels.len(),
            ..Default::default()
        };

        // 層級之間完全序列化；同一層依輸入順序處理
        for (depth, level) in levels.iter().enumerate() {
            bridge
                .progress(
                    ctx.job_id,
                    self.id(),
                    format!("level {}: {} service(s)", depth, level.len()),
                )
                .await;

            for description in level {
                let outcome = self
                    .core
                    .apply_one(ctx, bridge, account_id, description)
                    .await?;
                report.record(description, outcome);
            }
        }

        Ok(StepOutcome::Done(Some(serde_json::to_value(&report)?)))
    }
}

struct FinalizeStep {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobStep for FinalizeStep {
    fn id(&self) -> &str {
        "finalize"
    }

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome> {
        let (account_id, capability_id) = capability_of(ctx.entity)?;
        let account = self.core.store.get_account(account_id).await?;
        let capability = self.core.store.get_capability(capability_id).await?;

        self.core
            .store
            .set_capability_status(account.id, capability.id, CapabilityStatus::Active)
            .await?;
        bridge
            .progress(ctx.job_id, self.id(), format!("'{}' is ACTIVE", capability.name))
            .await;
        Ok(StepOutcome::done())
    }
}

struct ApplyHooks {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobHooks for ApplyHooks {
    async fn on_success(&self, ctx: &JobContext) {
        if let Ok((account, _)) = capability_of(ctx.entity) {
            self.core.leases.release(account, ctx.job_id);
        }
    }

    async fn on_failure(&self, ctx: &JobContext, error: &OrchestratorError) {
        let Ok((account, capability)) = capability_of(ctx.entity) else {
            return;
        };

        // 狀態屬於持有租約的 job，輸家不得覆寫
        if self.core.leases.held_by_other(account, capability, ctx.job_id) {
            tracing::warn!(
                "⚠️ Job {} failed while capability {} is applied by another job: {}",
                ctx.job_id,
                capability,
                error
            );
            return;
        }

        let marked = self
            .core
            .store
            .set_capability_status(account, capability, CapabilityStatus::ErrorCreation)
            .await;
        match marked {
            Ok(()) => tracing::error!(
                "❌ Capability {} on account {} -> ERROR_CREATION: {}",
                capability,
                account,
                error
            ),
            Err(e) if e.is_not_found() => {
                tracing::warn!("⚠️ Capability {} vanished during apply: {}", capability, e)
            }
            Err(e) => tracing::error!("💥 Could not record ERROR_CREATION: {}", e),
        }

        self.core.leases.release(account, ctx.job_id);
    }
}

struct ApplyCapabilityFactory {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl JobFactory for ApplyCapabilityFactory {
    async fn prepare(&self, entity: EntityRef, params: Params) -> Result<PreparedJob> {
        let (account_id, capability_id) = capability_of(entity)?;
        self.core.store.get_account(account_id).await?;
        let capability = self.core.store.get_capability(capability_id).await?;
        self.core.validate(&capability).await?;

        let core = &self.core;
        Ok(PreparedJob::new(APPLY_CAPABILITY_JOB, entity, params)
            .step(ClaimStep { core: core.clone() })
            .step(AttachDefinitionsStep { core: core.clone() })
            .step(ProvisionServicesStep { core: core.clone() })
            .step(FinalizeStep { core: core.clone() })
            .hooks(Arc::new(ApplyHooks { core: core.clone() })))
    }
}

/// 將 Capability 套用到帳戶的最上層流程
pub struct CapabilityProvisioningOrchestrator {
    core: Arc<OrchestratorCore>,
    bridge: Arc<TaskExecutionBridge>,
}

impl CapabilityProvisioningOrchestrator {
    pub fn new(
        store: Arc<dyn ServiceInstanceStore>,
        plugins: PluginRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        let lifecycle = Arc::new(ServiceInstanceLifecycleManager::new(store.clone(), plugins));
        let core = Arc::new(OrchestratorCore {
            store: store.clone(),
            lifecycle: lifecycle.clone(),
            resolver: DependencyGraphResolver::new(settings.requirement_policy),
            leases: LeaseTable::default(),
            settings: settings.clone(),
        });

        let mut jobs = JobRegistry::new();
        register_lifecycle_jobs(&mut jobs, lifecycle);
        jobs.register(
            APPLY_CAPABILITY_JOB,
            Arc::new(ApplyCapabilityFactory { core: core.clone() }),
        );

        let bridge = TaskExecutionBridge::new(
            jobs,
            store,
            BridgeSettings {
                max_retries: settings.max_retries,
                ..Default::default()
            },
        );

        Self { core, bridge }
    }

    /// 依設定決定同步或背景執行
    pub async fn apply(&self, account: AccountId, capability: CapabilityId) -> Result<JobOutcome> {
        self.apply_with(account, capability, self.core.settings.sync)
            .await
    }

    pub async fn apply_with(
        &self,
        account: AccountId,
        capability: CapabilityId,
        sync: bool,
    ) -> Result<JobOutcome> {
        tracing::info!(
            "🚀 Applying capability {} to account {} ({})",
            capability,
            account,
            if sync { "sync" } else { "async" }
        );
        self.bridge
            .prepare_or_run(
                EntityRef::Capability {
                    account,
                    capability,
                },
                APPLY_CAPABILITY_JOB,
                Params::new(),
                sync,
            )
            .await
    }

    pub async fn capability_status(
        &self,
        account: AccountId,
        capability: CapabilityId,
    ) -> Result<Option<CapabilityStatus>> {
        self.core
            .store
            .get_capability_status(account, capability)
            .await
    }

    /// 只解析並驗證，不做任何變更 (dry run)
    pub async fn plan(&self, capability: CapabilityId) -> Result<Vec<Vec<ServiceDescription>>> {
        let capability = self.core.store.get_capability(capability).await?;
        self.core.validate(&capability).await
    }

    /// 等待 apply 結束並回傳 job 紀錄
    pub async fn wait(&self, outcome: &JobOutcome) -> Result<JobRecord> {
        match outcome {
            JobOutcome::Dispatched(handle) => self.bridge.join(*handle).await,
            JobOutcome::Completed { job_id, .. } => self
                .bridge
                .job(*job_id)
                .await
                .ok_or_else(|| OrchestratorError::not_found("Job", job_id)),
        }
    }

    pub fn bridge(&self) -> &Arc<TaskExecutionBridge> {
        &self.bridge
    }

    pub fn lifecycle(&self) -> &Arc<ServiceInstanceLifecycleManager> {
        &self.core.lifecycle
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.core.settings
    }
}
