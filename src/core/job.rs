use crate::core::bridge::TaskExecutionBridge;
use crate::domain::model::{AccountId, CapabilityId, InstanceId, Params};
use crate::utils::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Job 作用的實體
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Account(AccountId),
    Capability {
        account: AccountId,
        capability: CapabilityId,
    },
    Instance(InstanceId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account(id) => write!(f, "account:{}", id),
            Self::Capability {
                account,
                capability,
            } => write!(f, "capability:{}@{}", capability, account),
            Self::Instance(id) => write!(f, "instance:{}", id),
        }
    }
}

/// 每個 step 都會收到的不可變執行上下文
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub entity: EntityRef,
    pub params: Arc<Params>,
    /// 嵌入執行時的父 step 路徑，例如 "provision_services"
    pub step_path: Option<String>,
}

impl JobContext {
    pub fn new(job_id: JobId, job_name: &str, entity: EntityRef, params: Params) -> Self {
        Self {
            job_id,
            job_name: job_name.to_string(),
            entity,
            params: Arc::new(params),
            step_path: None,
        }
    }

    /// 供嵌入子 job 使用：沿用父 job 的 id，實體與參數換成子 job 的
    pub fn embedded(&self, step_id: &str, child: &PreparedJob) -> Self {
        let step_path = match &self.step_path {
            Some(prefix) => format!("{}/{}", prefix, step_id),
            None => step_id.to_string(),
        };
        Self {
            job_id: self.job_id,
            job_name: child.name.clone(),
            entity: child.entity,
            params: Arc::new(child.params.clone()),
            step_path: Some(step_path),
        }
    }

    /// 進度回報用的完整 step 名稱
    pub fn qualify(&self, step_id: &str) -> String {
        match &self.step_path {
            Some(prefix) => format!("{}/{}", prefix, step_id),
            None => step_id.to_string(),
        }
    }
}

/// step 執行結果
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Done(Option<serde_json::Value>),
    /// 前置條件尚未滿足：倒數後重試同一個 step
    Retry { countdown: Duration, reason: String },
}

impl StepOutcome {
    pub fn done() -> Self {
        Self::Done(None)
    }
}

#[async_trait]
pub trait JobStep: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: &JobContext, bridge: &Arc<TaskExecutionBridge>) -> Result<StepOutcome>;
}

/// job 結束時的掛鉤，取代動態掛上的 callback
#[async_trait]
pub trait JobHooks: Send + Sync {
    async fn on_success(&self, _ctx: &JobContext) {}

    async fn on_failure(&self, _ctx: &JobContext, _error: &OrchestratorError) {}
}

/// 已準備好、尚未執行的 job
pub struct PreparedJob {
    pub name: String,
    pub entity: EntityRef,
    pub params: Params,
    pub steps: Vec<Box<dyn JobStep>>,
    pub hooks: Option<Arc<dyn JobHooks>>,
}

impl PreparedJob {
    pub fn new(name: &str, entity: EntityRef, params: Params) -> Self {
        Self {
            name: name.to_string(),
            entity,
            params,
            steps: Vec::new(),
            hooks: None,
        }
    }

    pub fn step(mut self, step: impl JobStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn JobHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id()).collect()
    }
}

impl fmt::Debug for PreparedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedJob")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("steps", &self.step_ids())
            .finish()
    }
}

/// 依名稱註冊的 job 工廠
#[async_trait]
pub trait JobFactory: Send + Sync {
    async fn prepare(&self, entity: EntityRef, params: Params) -> Result<PreparedJob>;
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, Arc<dyn JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn JobFactory>) -> &mut Self {
        self.factories.insert(name.to_string(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn JobFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotRegistered {
                name: name.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub step: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// job 的可觀察紀錄
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub entity: EntityRef,
    pub state: JobState,
    pub progress: Vec<ProgressEntry>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, name: &str, entity: EntityRef) -> Self {
        Self {
            id,
            name: name.to_string(),
            entity,
            state: JobState::Queued,
            progress: Vec::new(),
            result: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        job_id: JobId,
        result: Option<serde_json::Value>,
    },
    Dispatched(JobHandle),
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id, .. } => *job_id,
            Self::Dispatched(handle) => handle.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_context_keeps_parent_job_id() {
        let parent = JobContext::new(
            Uuid::new_v4(),
            "apply_capability",
            EntityRef::Account(Uuid::new_v4()),
            Params::new(),
        );
        let instance = Uuid::new_v4();
        let child = PreparedJob::new("create_service_instance", EntityRef::Instance(instance), Params::new());

        let ctx = parent.embedded("provision_services", &child);
        assert_eq!(ctx.job_id, parent.job_id);
        assert_eq!(ctx.entity, EntityRef::Instance(instance));
        assert_eq!(ctx.qualify("create_resource"), "provision_services/create_resource");

        let nested = ctx.embedded("inner", &child);
        assert_eq!(nested.qualify("x"), "provision_services/inner/x");
    }

    #[test]
    fn test_unknown_job_name_is_an_error() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(OrchestratorError::JobNotRegistered { .. })
        ));
    }
}
