use crate::core::job::{
    EntityRef, JobContext, JobHandle, JobId, JobOutcome, JobRecord, JobRegistry, JobState,
    JobStep, PreparedJob, ProgressEntry, StepOutcome,
};
use crate::domain::model::{InstanceId, InstanceStatus, Params, ServiceInstance};
use crate::domain::ports::ServiceInstanceStore;
use crate::utils::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// 單一 step 最多可要求的重試次數
    pub max_retries: u32,
    /// 保留多少筆已結束的 JobRecord，超過時先淘汰最早結束的
    pub retained_jobs: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retained_jobs: 1024,
        }
    }
}

/// 讓多步驟 job 能同步內嵌執行，或交給背景 worker 執行後再等待
pub struct TaskExecutionBridge {
    jobs: JobRegistry,
    store: Arc<dyn ServiceInstanceStore>,
    settings: BridgeSettings,
    records: Mutex<HashMap<JobId, JobRecord>>,
    handles: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl TaskExecutionBridge {
    pub fn new(
        jobs: JobRegistry,
        store: Arc<dyn ServiceInstanceStore>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            store,
            settings,
            records: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// 依名稱準備 job (不執行)
    pub async fn prepare(
        &self,
        job_name: &str,
        entity: EntityRef,
        params: Params,
    ) -> Result<PreparedJob> {
        let factory = self.jobs.get(job_name)?;
        factory.prepare(entity, params).await
    }

    /// sync 時在呼叫端直接執行並回傳結果；否則交給背景執行並立即回傳 handle
    pub async fn prepare_or_run(
        self: &Arc<Self>,
        entity: EntityRef,
        job_name: &str,
        params: Params,
        sync: bool,
    ) -> Result<JobOutcome> {
        let job = self.prepare(job_name, entity, params).await?;
        let job_id = Uuid::new_v4();
        self.records
            .lock()
            .await
            .insert(job_id, JobRecord::new(job_id, job_name, entity));

        if sync {
            tracing::debug!("▶️ Running job '{}' inline for {}", job_name, entity);
            let result = self.execute(job_id, job).await?;
            return Ok(JobOutcome::Completed { job_id, result });
        }

        tracing::debug!("📤 Dispatching job '{}' ({}) for {}", job_name, job_id, entity);
        let bridge = Arc::clone(self);
        // 先持有鎖再 spawn，確保 worker 移除 handle 時它已經登記
        let mut handles = self.handles.lock().await;
        let handle = tokio::spawn(async move {
            // 失敗已寫入 JobRecord 並交由 hooks 處理
            let _ = bridge.execute(job_id, job).await;
            bridge.handles.lock().await.remove(&job_id);
        });
        handles.insert(job_id, handle);
        drop(handles);

        Ok(JobOutcome::Dispatched(JobHandle { id: job_id }))
    }

    /// 把另一個元件準備好的 job 當作目前 job 的一個 step 執行
    pub async fn run_embedded(
        self: &Arc<Self>,
        job: PreparedJob,
        parent: &JobContext,
        step_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let ctx = parent.embedded(step_id, &job);
        self.progress(
            ctx.job_id,
            &parent.qualify(step_id),
            format!("embedding '{}' for {}", job.name, job.entity),
        )
        .await;

        let outcome = self.run_steps(&ctx, &job.steps).await;
        if let Some(hooks) = &job.hooks {
            match &outcome {
                Ok(_) => hooks.on_success(&ctx).await,
                Err(e) => hooks.on_failure(&ctx, e).await,
            }
        }
        outcome
    }

    /// 以計時器輪詢實例狀態，直到 accepted、ERROR 或逾時
    pub async fn wait_for_active(
        &self,
        instance_id: InstanceId,
        poll_interval: Duration,
        accepted: InstanceStatus,
        max_wait: Duration,
    ) -> Result<ServiceInstance> {
        let started = Instant::now();

        loop {
            let instance = self.store.get_instance(instance_id).await?;

            if instance.status == accepted {
                return Ok(instance);
            }
            if matches!(instance.status, InstanceStatus::Error | InstanceStatus::Deleted) {
                return Err(OrchestratorError::ResourceCreationError {
                    instance: instance_id.to_string(),
                    message: instance
                        .error_message
                        .unwrap_or_else(|| format!("instance entered {}", instance.status)),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                return Err(OrchestratorError::TimeoutError {
                    instance: instance_id.to_string(),
                    expected: accepted.to_string(),
                    waited: elapsed,
                });
            }

            tracing::trace!(
                "⏳ Instance {} is {}, waiting for {}",
                instance_id,
                instance.status,
                accepted
            );
            tokio::time::sleep(poll_interval.min(max_wait - elapsed)).await;
        }
    }

    /// 記錄進度 (同時寫入 tracing)
    pub async fn progress(&self, job_id: JobId, step: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("🔧 [{}] {}: {}", job_id, step, message);

        if let Some(record) = self.records.lock().await.get_mut(&job_id) {
            record.progress.push(ProgressEntry {
                step: step.to_string(),
                message,
                at: Utc::now(),
            });
        }
    }

    pub async fn job(&self, job_id: JobId) -> Option<JobRecord> {
        self.records.lock().await.get(&job_id).cloned()
    }

    /// 等待背景 job 結束並回傳最終紀錄；已結束的 job 直接讀取紀錄
    pub async fn join(&self, handle: JobHandle) -> Result<JobRecord> {
        let join = self.handles.lock().await.remove(&handle.id);
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::error!("💥 Job {} worker aborted: {}", handle.id, e);
                self.finish(handle.id, JobState::Failed(e.to_string()), None)
                    .await;
            }
        }

        self.job(handle.id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("Job", handle.id))
    }

    async fn execute(
        self: &Arc<Self>,
        job_id: JobId,
        job: PreparedJob,
    ) -> Result<Option<serde_json::Value>> {
        let ctx = JobContext::new(job_id, &job.name, job.entity, job.params.clone());
        self.set_state(job_id, JobState::Running).await;

        let outcome = self.run_steps(&ctx, &job.steps).await;
        match &outcome {
            Ok(result) => {
                if let Some(hooks) = &job.hooks {
                    hooks.on_success(&ctx).await;
                }
                tracing::info!("✅ Job '{}' ({}) succeeded", job.name, job_id);
                self.finish(job_id, JobState::Succeeded, result.clone())
                    .await;
            }
            Err(e) => {
                tracing::error!("❌ Job '{}' ({}) failed: {}", job.name, job_id, e);
                if let Some(hooks) = &job.hooks {
                    hooks.on_failure(&ctx, e).await;
                }
                self.finish(job_id, JobState::Failed(e.to_string()), None)
                    .await;
            }
        }
        outcome
    }

    /// 依序執行 step；Retry 會在倒數後重跑同一個 step
    async fn run_steps(
        self: &Arc<Self>,
        ctx: &JobContext,
        steps: &[Box<dyn JobStep>],
    ) -> Result<Option<serde_json::Value>> {
        let mut result = None;

        for step in steps {
            let step_name = ctx.qualify(step.id());
            let mut attempts = 0u32;

            loop {
                match step.run(ctx, self).await? {
                    StepOutcome::Done(value) => {
                        if value.is_some() {
                            result = value;
                        }
                        break;
                    }
                    StepOutcome::Retry { countdown, reason } => {
                        if attempts >= self.settings.max_retries {
                            return Err(OrchestratorError::RetryExhausted {
                                job: ctx.job_name.clone(),
                                step: step_name,
                                attempts,
                                reason,
                            });
                        }
                        attempts += 1;
                        self.progress(
                            ctx.job_id,
                            &step_name,
                            format!(
                                "retry {}/{} in {:?}: {}",
                                attempts, self.settings.max_retries, countdown, reason
                            ),
                        )
                        .await;
                        tokio::time::sleep(countdown).await;
                    }
                }
            }
        }

        Ok(result)
    }

    async fn set_state(&self, job_id: JobId, state: JobState) {
        if let Some(record) = self.records.lock().await.get_mut(&job_id) {
            record.state = state;
        }
    }

    async fn finish(&self, job_id: JobId, state: JobState, result: Option<serde_json::Value>) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&job_id) {
            record.state = state;
            record.result = result;
            record.finished_at = Some(Utc::now());
        }
        prune_finished(&mut records, self.settings.retained_jobs);
    }
}

/// 只淘汰已結束的紀錄；執行中的 job 一律保留
fn prune_finished(records: &mut HashMap<JobId, JobRecord>, retained: usize) {
    let excess = records.len().saturating_sub(retained);
    if excess == 0 {
        return;
    }

    let mut finished: Vec<(DateTime<Utc>, JobId)> = records
        .values()
        .filter(|record| record.state.is_finished())
        .filter_map(|record| record.finished_at.map(|at| (at, record.id)))
        .collect();
    finished.sort();
    for (_, id) in finished.into_iter().take(excess) {
        records.remove(&id);
    }
    tracing::trace!("🧹 Pruned finished job records, {} kept", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::core::job::{JobFactory, JobHooks};
    use crate::domain::model::{Account, ServiceDescription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStep {
        id: &'static str,
        runs: Arc<AtomicU32>,
        retry_until: u32,
        fail: bool,
    }

    #[async_trait]
    impl JobStep for CountingStep {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(
            &self,
            _ctx: &JobContext,
            _bridge: &Arc<TaskExecutionBridge>,
        ) -> Result<StepOutcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(OrchestratorError::plugin("test", "boom"));
            }
            if run <= self.retry_until {
                return Ok(StepOutcome::Retry {
                    countdown: Duration::from_millis(1),
                    reason: "not yet".to_string(),
                });
            }
            Ok(StepOutcome::Done(Some(serde_json::json!({ "step": self.id, "runs": run }))))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        successes: AtomicU32,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobHooks for RecordingHooks {
        async fn on_success(&self, _ctx: &JobContext) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_failure(&self, _ctx: &JobContext, _error: &OrchestratorError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestFactory {
        runs: Arc<AtomicU32>,
        retry_until: u32,
        fail: bool,
        hooks: Arc<RecordingHooks>,
    }

    #[async_trait]
    impl JobFactory for TestFactory {
        async fn prepare(&self, entity: EntityRef, params: Params) -> Result<PreparedJob> {
            Ok(PreparedJob::new("test_job", entity, params)
                .step(CountingStep {
                    id: "first",
                    runs: Arc::new(AtomicU32::new(0)),
                    retry_until: 0,
                    fail: false,
                })
                .step(CountingStep {
                    id: "second",
                    runs: Arc::clone(&self.runs),
                    retry_until: self.retry_until,
                    fail: self.fail,
                })
                .hooks(self.hooks.clone()))
        }
    }

    fn bridge_with(
        retry_until: u32,
        fail: bool,
        max_retries: u32,
    ) -> (Arc<TaskExecutionBridge>, Arc<AtomicU32>, Arc<RecordingHooks>, Arc<InMemoryStore>) {
        bridge_from(
            retry_until,
            fail,
            BridgeSettings {
                max_retries,
                ..Default::default()
            },
        )
    }

    fn bridge_from(
        retry_until: u32,
        fail: bool,
        settings: BridgeSettings,
    ) -> (Arc<TaskExecutionBridge>, Arc<AtomicU32>, Arc<RecordingHooks>, Arc<InMemoryStore>) {
        let runs = Arc::new(AtomicU32::new(0));
        let hooks = Arc::new(RecordingHooks::default());
        let mut jobs = JobRegistry::new();
        jobs.register(
            "test_job",
            Arc::new(TestFactory {
                runs: runs.clone(),
                retry_until,
                fail,
                hooks: hooks.clone(),
            }),
        );
        let store = Arc::new(InMemoryStore::new());
        let bridge = TaskExecutionBridge::new(jobs, store.clone(), settings);
        (bridge, runs, hooks, store)
    }

    fn entity() -> EntityRef {
        EntityRef::Account(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_sync_run_returns_last_step_result() {
        let (bridge, runs, hooks, _) = bridge_with(0, false, 3);

        let outcome = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), true)
            .await
            .unwrap();

        match outcome {
            JobOutcome::Completed { job_id, result } => {
                assert_eq!(result.unwrap()["step"], "second");
                let record = bridge.job(job_id).await.unwrap();
                assert_eq!(record.state, JobState::Succeeded);
            }
            other => panic!("expected inline completion, got {other:?}"),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_dispatch_returns_handle_and_completes() {
        let (bridge, _, _, _) = bridge_with(0, false, 3);

        let outcome = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), false)
            .await
            .unwrap();
        let JobOutcome::Dispatched(handle) = outcome else {
            panic!("expected a dispatched job");
        };

        let record = bridge.join(handle).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finished_worker_drops_its_handle() {
        let (bridge, _, hooks, _) = bridge_with(0, false, 3);

        for _ in 0..5 {
            bridge
                .prepare_or_run(entity(), "test_job", Params::new(), false)
                .await
                .unwrap();
        }
        for _ in 0..200 {
            if bridge.handles.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // 沒有人 join，handle 也不會留下
        assert!(bridge.handles.lock().await.is_empty());
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_join_after_worker_finished_reads_record() {
        let (bridge, _, _, _) = bridge_with(0, false, 3);

        let outcome = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), false)
            .await
            .unwrap();
        let JobOutcome::Dispatched(handle) = outcome else {
            panic!("expected a dispatched job");
        };
        for _ in 0..200 {
            if !bridge.handles.lock().await.contains_key(&handle.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let record = bridge.join(handle).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_finished_records_are_pruned_oldest_first() {
        let (bridge, _, _, _) = bridge_from(
            0,
            false,
            BridgeSettings {
                max_retries: 1,
                retained_jobs: 2,
            },
        );
        // 執行中的 job 不會被淘汰
        let running = Uuid::new_v4();
        bridge
            .records
            .lock()
            .await
            .insert(running, JobRecord::new(running, "long", entity()));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let outcome = bridge
                .prepare_or_run(entity(), "test_job", Params::new(), true)
                .await
                .unwrap();
            ids.push(outcome.job_id());
        }

        let records = bridge.records.lock().await;
        assert_eq!(records.len(), 2);
        assert!(records.contains_key(&running));
        assert!(records.contains_key(&ids[3]));
        assert!(!records.contains_key(&ids[0]));
    }

    #[tokio::test]
    async fn test_retry_reruns_step_until_ready() {
        let (bridge, runs, _, _) = bridge_with(2, false, 3);

        let outcome = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), true)
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let record = bridge.job(outcome.job_id()).await.unwrap();
        let retries = record
            .progress
            .iter()
            .filter(|p| p.message.starts_with("retry"))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let (bridge, runs, hooks, _) = bridge_with(10, false, 2);

        let err = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), true)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::RetryExhausted { attempts: 2, .. }
        ));
        // 初次執行 + 兩次重試
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_background_job_is_recorded() {
        let (bridge, _, hooks, _) = bridge_with(0, true, 2);

        let outcome = bridge
            .prepare_or_run(entity(), "test_job", Params::new(), false)
            .await
            .unwrap();
        let JobOutcome::Dispatched(handle) = outcome else {
            panic!("expected a dispatched job");
        };

        let record = bridge.join(handle).await.unwrap();
        assert!(matches!(record.state, JobState::Failed(ref msg) if msg.contains("boom")));
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedded_job_reports_under_parent() {
        let (bridge, _, hooks, _) = bridge_with(0, false, 2);
        let parent_id = Uuid::new_v4();
        bridge
            .records
            .lock()
            .await
            .insert(parent_id, JobRecord::new(parent_id, "parent", entity()));
        let parent = JobContext::new(parent_id, "parent", entity(), Params::new());

        let child = bridge
            .prepare("test_job", entity(), Params::new())
            .await
            .unwrap();
        let result = bridge.run_embedded(child, &parent, "outer").await.unwrap();

        assert_eq!(result.unwrap()["step"], "second");
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
        let record = bridge.job(parent_id).await.unwrap();
        assert_eq!(record.progress[0].step, "outer");
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected_before_dispatch() {
        let (bridge, _, _, _) = bridge_with(0, false, 2);
        let err = bridge
            .prepare_or_run(entity(), "missing", Params::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotRegistered { .. }));
    }

    async fn instance_in(store: &InMemoryStore, status: InstanceStatus) -> ServiceInstance {
        let account = store.insert_account(Account::new("acme")).await;
        let mut instance = store
            .add_service_instance(account, &ServiceDescription::new("vm", "compute"), Params::new())
            .await
            .unwrap();
        instance.status = status;
        instance.error_message = Some("quota exceeded".to_string());
        store
            .update_instance(&instance, InstanceStatus::Draft)
            .await
            .unwrap();
        instance
    }

    #[tokio::test]
    async fn test_wait_for_active_returns_on_accepted_state() {
        let (bridge, _, _, store) = bridge_with(0, false, 2);
        let instance = instance_in(&store, InstanceStatus::Building).await;

        let flip = {
            let store = store.clone();
            let mut ready = instance.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ready.status = InstanceStatus::Active;
                store
                    .update_instance(&ready, InstanceStatus::Building)
                    .await
                    .unwrap();
            })
        };

        let active = bridge
            .wait_for_active(
                instance.id,
                Duration::from_millis(5),
                InstanceStatus::Active,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(active.status, InstanceStatus::Active);
        flip.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_active_raises_on_error_state() {
        let (bridge, _, _, store) = bridge_with(0, false, 2);
        let instance = instance_in(&store, InstanceStatus::Error).await;

        let err = bridge
            .wait_for_active(
                instance.id,
                Duration::from_millis(5),
                InstanceStatus::Active,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, OrchestratorError::ResourceCreationError { ref message, .. } if message == "quota exceeded")
        );
    }

    #[tokio::test]
    async fn test_wait_for_active_times_out() {
        let (bridge, _, _, store) = bridge_with(0, false, 2);
        let instance = instance_in(&store, InstanceStatus::Pending).await;

        let err = bridge
            .wait_for_active(
                instance.id,
                Duration::from_millis(5),
                InstanceStatus::Active,
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TimeoutError { .. }));
    }
}
