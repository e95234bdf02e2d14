use crate::domain::model::{
    Account, AccountId, Capability, CapabilityId, CapabilityStatus, Definition, InstanceId,
    InstanceStatus, Params, ServiceDescription, ServiceInstance,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 持久層介面。每個呼叫各自為一個交易單位；找不到的紀錄回傳 `NotFound`。
#[async_trait]
pub trait ServiceInstanceStore: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Account>;
    async fn get_capability(&self, id: CapabilityId) -> Result<Capability>;

    /// 依 (帳戶, 外掛類型, 名稱) 查詢未刪除的實例
    async fn get_service_instance(
        &self,
        account: AccountId,
        plugin_type: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>>;

    async fn get_instance(&self, id: InstanceId) -> Result<ServiceInstance>;
    async fn list_instances(&self, account: AccountId) -> Result<Vec<ServiceInstance>>;

    /// 以 DRAFT 狀態新增實例
    async fn add_service_instance(
        &self,
        account: AccountId,
        description: &ServiceDescription,
        params: Params,
    ) -> Result<ServiceInstance>;

    /// 僅在儲存中的狀態仍為 `expected` 時寫入，否則回傳 StaleInstance
    async fn update_instance(
        &self,
        instance: &ServiceInstance,
        expected: InstanceStatus,
    ) -> Result<()>;
    async fn link_instances(&self, child: InstanceId, parent: InstanceId) -> Result<()>;

    async fn get_service_definition(&self, name_or_id: &str) -> Result<Definition>;

    /// 回傳 true 表示本次才掛上，false 表示早已掛上
    async fn attach_definition_to_account(
        &self,
        account: AccountId,
        definition: &Definition,
    ) -> Result<bool>;

    async fn set_capability_status(
        &self,
        account: AccountId,
        capability: CapabilityId,
        status: CapabilityStatus,
    ) -> Result<()>;

    async fn get_capability_status(
        &self,
        account: AccountId,
        capability: CapabilityId,
    ) -> Result<Option<CapabilityStatus>>;
}

/// 外掛的建立方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// 頂層容器服務：完整建立流程同步嵌入執行
    Core,
    /// 一般服務：交給背景工作，再等待 ACTIVE
    Simple,
}

/// 每種資源外掛都必須實作的生命週期契約
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    fn plugin_type(&self) -> &str;

    fn kind(&self) -> PluginKind {
        PluginKind::Simple
    }

    async fn pre_create(&self, _instance: &ServiceInstance, params: Params) -> Result<Params> {
        Ok(params)
    }

    async fn create_resource(&self, instance: &ServiceInstance, params: &Params) -> Result<String>;

    async fn post_create(&self, _instance: &ServiceInstance, _params: &Params) -> Result<()> {
        Ok(())
    }

    async fn update_resource(&self, instance: &ServiceInstance, params: &Params) -> Result<()>;

    async fn patch_resource(&self, instance: &ServiceInstance, params: &Params) -> Result<()>;

    /// 副作用操作；若資源狀態因此改變 (例如 STOPPED) 則回傳新狀態
    async fn action_resource(
        &self,
        instance: &ServiceInstance,
        params: &Params,
    ) -> Result<Option<InstanceStatus>>;

    async fn delete_resource(&self, instance: &ServiceInstance, params: &Params) -> Result<()>;

    async fn expunge_instance(&self, _instance: &ServiceInstance) -> Result<()> {
        Ok(())
    }
}
