use crate::domain::graph::ServiceGraph;
use crate::domain::model::{
    Account, AccountId, Capability, CapabilityId, CapabilityStatus, Definition, DefinitionId,
    InstanceId, InstanceStatus, Params, ServiceDescription, ServiceInstance,
};
use crate::domain::ports::ServiceInstanceStore;
use crate::utils::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct StoreState {
    accounts: HashMap<AccountId, Account>,
    capabilities: HashMap<CapabilityId, Capability>,
    definitions: HashMap<DefinitionId, Definition>,
    graph: ServiceGraph,
}

/// 行程內的 ServiceInstanceStore，供 CLI 與測試使用
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) -> AccountId {
        let id = account.id;
        self.state.write().await.accounts.insert(id, account);
        id
    }

    pub async fn insert_capability(&self, capability: Capability) -> CapabilityId {
        let id = capability.id;
        self.state.write().await.capabilities.insert(id, capability);
        id
    }

    pub async fn insert_definition(&self, definition: Definition) -> DefinitionId {
        let id = definition.id;
        self.state.write().await.definitions.insert(id, definition);
        id
    }

    /// 模擬管理操作刪除帳戶
    pub async fn remove_account(&self, id: AccountId) -> Option<Account> {
        self.state.write().await.accounts.remove(&id)
    }

    pub async fn children_of(&self, id: InstanceId) -> Vec<ServiceInstance> {
        let state = self.state.read().await;
        state.graph.children_of(&id).into_iter().cloned().collect()
    }
}

#[async_trait]
impl ServiceInstanceStore for InMemoryStore {
    async fn get_account(&self, id: AccountId) -> Result<Account> {
        let state = self.state.read().await;
        state
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Account", id))
    }

    async fn get_capability(&self, id: CapabilityId) -> Result<Capability> {
        let state = self.state.read().await;
        state
            .capabilities
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Capability", id))
    }

    async fn get_service_instance(
        &self,
        account: AccountId,
        plugin_type: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>> {
        let state = self.state.read().await;
        Ok(state.graph.find_live(&account, plugin_type, name).cloned())
    }

    async fn get_instance(&self, id: InstanceId) -> Result<ServiceInstance> {
        let state = self.state.read().await;
        state
            .graph
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("ServiceInstance", id))
    }

    async fn list_instances(&self, account: AccountId) -> Result<Vec<ServiceInstance>> {
        let state = self.state.read().await;
        Ok(state.graph.for_account(&account).cloned().collect())
    }

    async fn add_service_instance(
        &self,
        account: AccountId,
        description: &ServiceDescription,
        params: Params,
    ) -> Result<ServiceInstance> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(&account) {
            return Err(OrchestratorError::not_found("Account", account));
        }
        if state
            .graph
            .find_live(&account, &description.plugin_type, &description.name)
            .is_some()
        {
            return Err(OrchestratorError::validation(format!(
                "service instance '{}' already exists for account {}",
                description.key(),
                account
            )));
        }

        let instance = ServiceInstance::draft(account, description, params);
        state.graph.insert(instance.clone());
        Ok(instance)
    }

    async fn update_instance(
        &self,
        instance: &ServiceInstance,
        expected: InstanceStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .graph
            .get_mut(&instance.id)
            .ok_or_else(|| OrchestratorError::not_found("ServiceInstance", instance.id))?;

        if slot.status != expected {
            return Err(OrchestratorError::StaleInstance {
                instance: instance.id.to_string(),
                expected: expected.to_string(),
                actual: slot.status.to_string(),
            });
        }
        if !slot.status.can_transition_to(instance.status) {
            return Err(OrchestratorError::InvalidTransition {
                instance: instance.id.to_string(),
                from: slot.status.to_string(),
                to: instance.status.to_string(),
            });
        }

        // 父子連結只能經由 link_instances 修改
        let parent_links = std::mem::take(&mut slot.parent_links);
        *slot = instance.clone();
        slot.parent_links = parent_links;
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn link_instances(&self, child: InstanceId, parent: InstanceId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.graph.link(&child, &parent) {
            Ok(())
        } else {
            Err(OrchestratorError::not_found(
                "ServiceInstance",
                format!("{} -> {}", child, parent),
            ))
        }
    }

    async fn get_service_definition(&self, name_or_id: &str) -> Result<Definition> {
        let state = self.state.read().await;
        let by_id = uuid::Uuid::parse_str(name_or_id)
            .ok()
            .and_then(|id| state.definitions.get(&id));
        by_id
            .or_else(|| state.definitions.values().find(|d| d.name == name_or_id))
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Definition", name_or_id))
    }

    async fn attach_definition_to_account(
        &self,
        account: AccountId,
        definition: &Definition,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&account)
            .ok_or_else(|| OrchestratorError::not_found("Account", account))?;
        if account.definitions.contains(&definition.id) {
            return Ok(false);
        }
        account.definitions.push(definition.id);
        Ok(true)
    }

    async fn set_capability_status(
        &self,
        account: AccountId,
        capability: CapabilityId,
        status: CapabilityStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.capabilities.contains_key(&capability) {
            return Err(OrchestratorError::not_found("Capability", capability));
        }
        let account = state
            .accounts
            .get_mut(&account)
            .ok_or_else(|| OrchestratorError::not_found("Account", account))?;
        account.capability_status.insert(capability, status);
        Ok(())
    }

    async fn get_capability_status(
        &self,
        account: AccountId,
        capability: CapabilityId,
    ) -> Result<Option<CapabilityStatus>> {
        let state = self.state.read().await;
        let account = state
            .accounts
            .get(&account)
            .ok_or_else(|| OrchestratorError::not_found("Account", account))?;
        Ok(account.capability_status.get(&capability).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (InMemoryStore, AccountId) {
        let store = InMemoryStore::new();
        let account = store.insert_account(Account::new("acme")).await;
        (store, account)
    }

    #[tokio::test]
    async fn test_add_and_lookup_instance() {
        let (store, account) = seeded().await;
        let desc = ServiceDescription::new("web", "compute");
        let created = store
            .add_service_instance(account, &desc, Params::new())
            .await
            .unwrap();
        assert_eq!(created.status, InstanceStatus::Draft);

        let found = store
            .get_service_instance(account, "compute", "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert!(store
            .get_service_instance(account, "storage", "web")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_live_instance_is_rejected() {
        let (store, account) = seeded().await;
        let desc = ServiceDescription::new("web", "compute");
        let first = store
            .add_service_instance(account, &desc, Params::new())
            .await
            .unwrap();
        assert!(store
            .add_service_instance(account, &desc, Params::new())
            .await
            .is_err());

        // 軟刪除後可以重建
        let mut deleted = first.clone();
        deleted.status = InstanceStatus::Deleted;
        store
            .update_instance(&deleted, InstanceStatus::Draft)
            .await
            .unwrap();
        assert!(store
            .add_service_instance(account, &desc, Params::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_update_preserves_parent_links() {
        let (store, account) = seeded().await;
        let parent = store
            .add_service_instance(account, &ServiceDescription::new("net", "network"), Params::new())
            .await
            .unwrap();
        let child = store
            .add_service_instance(account, &ServiceDescription::new("vm", "compute"), Params::new())
            .await
            .unwrap();
        store.link_instances(child.id, parent.id).await.unwrap();

        // child 是連結前的快照，parent_links 仍為空
        let mut stale = child.clone();
        stale.status = InstanceStatus::Building;
        store
            .update_instance(&stale, InstanceStatus::Draft)
            .await
            .unwrap();

        let reloaded = store.get_instance(child.id).await.unwrap();
        assert_eq!(reloaded.status, InstanceStatus::Building);
        assert_eq!(reloaded.parent_links, vec![parent.id]);
        assert_eq!(store.children_of(parent.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_stale_expected_status() {
        let (store, account) = seeded().await;
        let loaded = store
            .add_service_instance(account, &ServiceDescription::new("db", "database"), Params::new())
            .await
            .unwrap();

        // 另一個寫入者先把實例標為 ERROR
        let mut failed = loaded.clone();
        failed.status = InstanceStatus::Error;
        failed.error_message = Some("timed out".to_string());
        store
            .update_instance(&failed, InstanceStatus::Draft)
            .await
            .unwrap();

        // 以舊快照為基礎的寫入必須失敗，且不得覆蓋 ERROR
        let mut late = loaded.clone();
        late.status = InstanceStatus::Building;
        let err = store
            .update_instance(&late, InstanceStatus::Draft)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StaleInstance { .. }));
        assert_eq!(err.category(), crate::utils::error::ErrorCategory::Storage);

        let current = store.get_instance(loaded.id).await.unwrap();
        assert_eq!(current.status, InstanceStatus::Error);
        assert_eq!(current.error_message.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_deleted_instance_cannot_be_revived() {
        let (store, account) = seeded().await;
        let mut instance = store
            .add_service_instance(account, &ServiceDescription::new("db", "database"), Params::new())
            .await
            .unwrap();
        instance.status = InstanceStatus::Deleted;
        store
            .update_instance(&instance, InstanceStatus::Draft)
            .await
            .unwrap();

        // 即使 expected 正確，DELETED 也不能再轉出
        instance.status = InstanceStatus::Active;
        instance.resource_id = Some("db-1".to_string());
        let err = store
            .update_instance(&instance, InstanceStatus::Deleted)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        let current = store.get_instance(instance.id).await.unwrap();
        assert_eq!(current.status, InstanceStatus::Deleted);
        assert!(current.resource_id.is_none());
    }

    #[tokio::test]
    async fn test_definition_lookup_by_name_or_id() {
        let (store, account) = seeded().await;
        let def = Definition::new("postgres-small", Params::new());
        let id = store.insert_definition(def.clone()).await;

        assert_eq!(store.get_service_definition("postgres-small").await.unwrap().id, id);
        assert_eq!(store.get_service_definition(&id.to_string()).await.unwrap().id, id);
        assert!(store.get_service_definition("missing").await.unwrap_err().is_not_found());

        assert!(store.attach_definition_to_account(account, &def).await.unwrap());
        assert!(!store.attach_definition_to_account(account, &def).await.unwrap());
    }

    #[tokio::test]
    async fn test_capability_status_requires_both_records() {
        let (store, account) = seeded().await;
        let capability = store.insert_capability(Capability::new("web", vec![])).await;

        assert!(store
            .get_capability_status(account, capability)
            .await
            .unwrap()
            .is_none());
        store
            .set_capability_status(account, capability, CapabilityStatus::Building)
            .await
            .unwrap();
        assert_eq!(
            store.get_capability_status(account, capability).await.unwrap(),
            Some(CapabilityStatus::Building)
        );

        store.remove_account(account).await;
        let err = store
            .set_capability_status(account, capability, CapabilityStatus::Active)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
