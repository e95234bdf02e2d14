use crate::core::bridge::TaskExecutionBridge;
use crate::core::job::{
    EntityRef, JobContext, JobFactory, JobHooks, JobRegistry, JobStep, PreparedJob, StepOutcome,
};
use crate::core::registry::PluginRegistry;
use crate::domain::model::{InstanceId, InstanceStatus, Params, ServiceInstance};
use crate::domain::ports::{ResourcePlugin, ServiceInstanceStore};
use crate::utils::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

pub const CREATE_INSTANCE_JOB: &str = "create_service_instance";
pub const UPDATE_INSTANCE_JOB: &str = "update_service_instance";
pub const PATCH_INSTANCE_JOB: &str = "patch_service_instance";
pub const ACTION_INSTANCE_JOB: &str = "action_service_instance";
pub const DELETE_INSTANCE_JOB: &str = "delete_service_instance";

const MARK_ERROR_ATTEMPTS: u32 = 3;

/// 所有外掛類型共用的建立/更新/動作/刪除執行器與狀態機
pub struct ServiceInstanceLifecycleManager {
    store: Arc<dyn ServiceInstanceStore>,
    plugins: PluginRegistry,
}

impl ServiceInstanceLifecycleManager {
    pub fn new(store: Arc<dyn ServiceInstanceStore>, plugins: PluginRegistry) -> Self {
        Self { store, plugins }
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub async fn pre_create(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_pre_create(id, params)).await
    }

    pub async fn create_resource(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_create(id, params)).await
    }

    pub async fn post_create(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_post_create(id, params)).await
    }

    /// 只有已存在 resource_id 時才更新，完成後回到 ACTIVE
    pub async fn update_resource(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_modify(id, params, LifecycleOp::UpdateResource))
            .await
    }

    pub async fn patch_resource(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_modify(id, params, LifecycleOp::PatchResource))
            .await
    }

    /// 不強制回到 ACTIVE；只套用外掛回報的新狀態
    pub async fn action_resource(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_action(id, params)).await
    }

    /// 有 resource_id 才呼叫外掛刪除；之後一律軟刪除。`force` 時忽略外掛錯誤。
    pub async fn delete_resource(&self, id: InstanceId, params: &Params) -> Result<()> {
        self.guarded(id, self.run_delete(id, params)).await
    }

    pub async fn mark_pending(&self, id: InstanceId) -> Result<()> {
        let mut instance = self.store.get_instance(id).await?;
        self.transition(&mut instance, InstanceStatus::Pending).await
    }

    /// 將實例標記為 ERROR 並保存錯誤訊息
    pub async fn mark_error(&self, id: InstanceId, message: &str) -> Result<()> {
        let mut attempts = 0;
        loop {
            let mut instance = self.store.get_instance(id).await?;
            if instance.status == InstanceStatus::Error {
                tracing::debug!("Instance {} already in ERROR, keeping first message", id);
                return Ok(());
            }
            if !instance.status.can_transition_to(InstanceStatus::Error) {
                tracing::warn!(
                    "⚠️ Instance {} is {}, not recording error: {}",
                    id,
                    instance.status,
                    message
                );
                return Ok(());
            }

            let loaded = instance.status;
            instance.status = InstanceStatus::Error;
            instance.error_message = Some(message.to_string());
            match self.store.update_instance(&instance, loaded).await {
                // 讀取後狀態被別人改掉，重新判斷一次
                Err(OrchestratorError::StaleInstance { .. }) if attempts < MARK_ERROR_ATTEMPTS => {
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    /// 失敗處理：NotFound 代表實例可能已被並發刪除，直接容忍
    pub async fn fail(&self, id: InstanceId, error: &OrchestratorError) {
        if error.is_not_found() {
            tracing::debug!("Instance {} vanished during step: {}", id, error);
            return;
        }
        if let Err(e) = self.mark_error(id, &error.to_string()).await {
            tracing::warn!("⚠️ Could not mark instance {} as ERROR: {}", id, e);
        }
    }

    async fn run_pre_create(&self, id: InstanceId, params: &Params) -> Result<()> {
        let (mut instance, plugin) = self.load(id).await?;
        self.transition(&mut instance, InstanceStatus::Building).await?;

        let merged = merge_params(&instance.params, params);
        instance.params = plugin.pre_create(&instance, merged).await?;
        self.store.update_instance(&instance, instance.status).await
    }

    async fn run_create(&self, id: InstanceId, params: &Params) -> Result<()> {
        let (mut instance, plugin) = self.load(id).await?;
        if instance.is_active() && instance.resource_id.is_some() {
            tracing::debug!("⏭️ Instance {} already has resource, skipping create", id);
            return Ok(());
        }

        let merged = merge_params(&instance.params, params);
        let resource_id = plugin.create_resource(&instance, &merged).await?;
        tracing::info!(
            "🏗️ Created {} resource '{}' for '{}'",
            instance.plugin_type,
            resource_id,
            instance.name
        );

        instance.resource_id = Some(resource_id);
        if let Err(e) = self.transition(&mut instance, InstanceStatus::Created).await {
            if matches!(e, OrchestratorError::StaleInstance { .. }) {
                tracing::warn!(
                    "⚠️ Instance {} changed while its resource was being created; {:?} is not recorded",
                    id,
                    instance.resource_id
                );
            }
            return Err(e);
        }
        self.transition(&mut instance, InstanceStatus::Active).await
    }

    async fn run_post_create(&self, id: InstanceId, params: &Params) -> Result<()> {
        let (instance, plugin) = self.load(id).await?;
        let merged = merge_params(&instance.params, params);
        plugin.post_create(&instance, &merged).await
    }

    async fn run_modify(&self, id: InstanceId, params: &Params, op: LifecycleOp) -> Result<()> {
        let (mut instance, plugin) = self.load(id).await?;
        if instance.resource_id.is_none() {
            tracing::debug!("⏭️ Instance {} has no resource yet, skipping {}", id, op.step_id());
            return Ok(());
        }

        self.transition(&mut instance, InstanceStatus::Updating).await?;
        match op {
            LifecycleOp::PatchResource => plugin.patch_resource(&instance, params).await?,
            _ => plugin.update_resource(&instance, params).await?,
        }
        self.transition(&mut instance, InstanceStatus::Active).await
    }

    async fn run_action(&self, id: InstanceId, params: &Params) -> Result<()> {
        let (mut instance, plugin) = self.load(id).await?;
        if instance.resource_id.is_none() {
            tracing::debug!("⏭️ Instance {} has no resource yet, skipping action", id);
            return Ok(());
        }

        if let Some(next) = plugin.action_resource(&instance, params).await? {
            self.transition(&mut instance, next).await?;
        }
        Ok(())
    }

    async fn run_delete(&self, id: InstanceId, params: &Params) -> Result<()> {
        let force = force_requested(params);
        let mut instance = self.store.get_instance(id).await?;
        if instance.is_deleted() {
            return Ok(());
        }

        match self.plugins.resolve(&instance.plugin_type) {
            Ok(plugin) => self.teardown(&instance, plugin, params, force).await?,
            Err(e) if force => {
                tracing::warn!("⚠️ Force-deleting {} without plugin: {}", id, e);
            }
            Err(e) => return Err(e),
        }

        self.transition(&mut instance, InstanceStatus::Deleted).await?;
        tracing::info!("🗑️ Instance '{}' ({}) deleted", instance.name, id);
        Ok(())
    }

    async fn teardown(
        &self,
        instance: &ServiceInstance,
        plugin: Arc<dyn ResourcePlugin>,
        params: &Params,
        force: bool,
    ) -> Result<()> {
        if instance.resource_id.is_some() {
            if let Err(e) = plugin.delete_resource(instance, params).await {
                if !force {
                    return Err(e);
                }
                tracing::warn!("⚠️ Ignoring delete failure for {}: {}", instance.id, e);
            }
        }
        if let Err(e) = plugin.expunge_instance(instance).await {
            if !force {
                return Err(e);
            }
            tracing::warn!("⚠️ Ignoring expunge failure for {}: {}", instance.id, e);
        }
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<(ServiceInstance, Arc<dyn ResourcePlugin>)> {
        let instance = self.store.get_instance(id).await?;
        let plugin = self.plugins.resolve(&instance.plugin_type)?;
        Ok((instance, plugin))
    }

    async fn transition(&self, instance: &mut ServiceInstance, next: InstanceStatus) -> Result<()> {
        if !instance.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                instance: instance.id.to_string(),
                from: instance.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("🔀 {} '{}': {} -> {}", instance.plugin_type, instance.name, instance.status, next);
        let loaded = instance.status;
        instance.status = next;
        if next != InstanceStatus::Error {
            instance.error_message = None;
        }
        // 儲存中的狀態若已不是讀取時的狀態 (例如逾時被標為 ERROR)，寫入會被拒絕
        self.store.update_instance(instance, loaded).await
    }

    async fn guarded<T>(&self, id: InstanceId, op: impl Future<Output = Result<T>>) -> Result<T> {
        match op.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }
}

/// 以 overrides 覆蓋 base 的同名鍵
pub fn merge_params(base: &Params, overrides: &Params) -> Params {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    PreCreate,
    CreateResource,
    PostCreate,
    UpdateResource,
    PatchResource,
    ActionResource,
    DeleteResource,
}

impl LifecycleOp {
    pub fn step_id(self) -> &'static str {
        match self {
            Self::PreCreate => "pre_create",
            Self::CreateResource => "create_resource",
            Self::PostCreate => "post_create",
            Self::UpdateResource => "update_resource",
            Self::PatchResource => "patch_resource",
            Self::ActionResource => "action_resource",
            Self::DeleteResource => "delete_resource",
        }
    }
}

struct LifecycleStep {
    op: LifecycleOp,
    lifecycle: Arc<ServiceInstanceLifecycleManager>,
}

#[async_trait]
impl JobStep for LifecycleStep {
    fn id(&self) -> &str {
        self.op.step_id()
    }

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome> {
        let id = instance_of(ctx.entity)?;
        let params = ctx.params.as_ref();

        match self.op {
            LifecycleOp::PreCreate => self.lifecycle.pre_create(id, params).await?,
            LifecycleOp::CreateResource => self.lifecycle.create_resource(id, params).await?,
            LifecycleOp::PostCreate => self.lifecycle.post_create(id, params).await?,
            LifecycleOp::UpdateResource => self.lifecycle.update_resource(id, params).await?,
            LifecycleOp::PatchResource => self.lifecycle.patch_resource(id, params).await?,
            LifecycleOp::ActionResource => self.lifecycle.action_resource(id, params).await?,
            LifecycleOp::DeleteResource => self.lifecycle.delete_resource(id, params).await?,
        }

        bridge
            .progress(ctx.job_id, &ctx.qualify(self.id()), format!("instance {} done", id))
            .await;
        Ok(StepOutcome::done())
    }
}

struct InstanceJobHooks {
    lifecycle: Arc<ServiceInstanceLifecycleManager>,
}

#[async_trait]
impl JobHooks for InstanceJobHooks {
    async fn on_failure(&self, ctx: &JobContext, error: &OrchestratorError) {
        if let Ok(id) = instance_of(ctx.entity) {
            self.lifecycle.fail(id, error).await;
        }
    }
}

fn force_requested(params: &Params) -> bool {
    params.get("force").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// 以固定的 step 序列組成實例 job
struct LifecycleJobFactory {
    name: &'static str,
    ops: &'static [LifecycleOp],
    lifecycle: Arc<ServiceInstanceLifecycleManager>,
}

#[async_trait]
impl JobFactory for LifecycleJobFactory {
    async fn prepare(&self, entity: EntityRef, params: Params) -> Result<PreparedJob> {
        let id = instance_of(entity)?;
        let instance = self.lifecycle.store.get_instance(id).await?;
        if !force_requested(&params) && !self.lifecycle.plugins.contains(&instance.plugin_type) {
            return Err(OrchestratorError::PluginNotRegistered {
                plugin_type: instance.plugin_type,
            });
        }

        let mut job = PreparedJob::new(self.name, entity, params).hooks(Arc::new(InstanceJobHooks {
            lifecycle: Arc::clone(&self.lifecycle),
        }));
        for &op in self.ops {
            job = job.step(LifecycleStep {
                op,
                lifecycle: Arc::clone(&self.lifecycle),
            });
        }
        Ok(job)
    }
}

/// 註冊所有實例層級的 job
pub fn register_lifecycle_jobs(
    registry: &mut JobRegistry,
    lifecycle: Arc<ServiceInstanceLifecycleManager>,
) {
    const JOBS: [(&str, &[LifecycleOp]); 5] = [
        (
            CREATE_INSTANCE_JOB,
            &[
                LifecycleOp::PreCreate,
                LifecycleOp::CreateResource,
                LifecycleOp::PostCreate,
            ],
        ),
        (UPDATE_INSTANCE_JOB, &[LifecycleOp::UpdateResource]),
        (PATCH_INSTANCE_JOB, &[LifecycleOp::PatchResource]),
        (ACTION_INSTANCE_JOB, &[LifecycleOp::ActionResource]),
        (DELETE_INSTANCE_JOB, &[LifecycleOp::DeleteResource]),
    ];

    for (name, ops) in JOBS {
        registry.register(
            name,
            Arc::new(LifecycleJobFactory {
                name,
                ops,
                lifecycle: Arc::clone(&lifecycle),
            }),
        );
    }
}

fn instance_of(entity: EntityRef) -> Result<InstanceId> {
    match entity {
        EntityRef::Instance(id) => Ok(id),
        other => Err(OrchestratorError::validation(format!(
            "lifecycle jobs act on instances, got {}",
            other
        ))),
    }
}
