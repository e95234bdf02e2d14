use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// 不透明的鍵值參數 (描述、模板與外掛呼叫共用)
pub type Params = serde_json::Map<String, serde_json::Value>;

pub type AccountId = Uuid;
pub type CapabilityId = Uuid;
pub type DefinitionId = Uuid;
pub type InstanceId = Uuid;

/// 對另一個服務描述的依賴 (名稱 + 外掛類型)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub plugin_type: String,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin_type, self.name)
    }
}

/// 宣告式服務描述，屬於 Capability 的一部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub plugin_type: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub requires: Option<Requirement>,
}

impl ServiceDescription {
    pub fn new(name: &str, plugin_type: &str) -> Self {
        Self {
            name: name.to_string(),
            plugin_type: plugin_type.to_string(),
            template: None,
            params: Params::new(),
            requires: None,
        }
    }

    pub fn requiring(mut self, name: &str, plugin_type: &str) -> Self {
        self.requires = Some(Requirement {
            name: name.to_string(),
            plugin_type: plugin_type.to_string(),
        });
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// 是否與 (名稱, 類型) 相符
    pub fn matches(&self, name: &str, plugin_type: &str) -> bool {
        self.name == name && self.plugin_type == plugin_type
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.plugin_type, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityStatus {
    Building,
    Active,
    ErrorCreation,
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::ErrorCreation => "ERROR_CREATION",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub name: String,
    pub services: Vec<ServiceDescription>,
    pub definitions: Vec<String>,
}

impl Capability {
    pub fn new(name: &str, services: Vec<ServiceDescription>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            services,
            definitions: Vec::new(),
        }
    }

    pub fn with_definitions(mut self, definitions: Vec<String>) -> Self {
        self.definitions = definitions;
        self
    }
}

/// 帳戶層級的服務定義；同時作為服務描述的 template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl Definition {
    pub fn new(name: &str, params: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub definitions: Vec<DefinitionId>,
    pub capability_status: HashMap<CapabilityId, CapabilityStatus>,
}

impl Account {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            definitions: Vec::new(),
            capability_status: HashMap::new(),
        }
    }

    /// 除了 `except` 以外，是否有其他 Capability 正在建置
    pub fn is_building_other(&self, except: CapabilityId) -> bool {
        self.capability_status
            .iter()
            .any(|(id, status)| *id != except && *status == CapabilityStatus::Building)
    }
}

/// 服務實例的生命週期狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Draft,
    Pending,
    Building,
    Created,
    Active,
    Updating,
    Stopping,
    Stopped,
    #[serde(rename = "SHUTTINGDOWN")]
    ShuttingDown,
    Terminated,
    Deleted,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Terminated)
    }

    /// 狀態機：回傳 self -> next 是否合法。自我轉換一律視為 no-op。
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if self == next {
            return true;
        }

        match self {
            Draft => matches!(next, Pending | Building | Error | Deleted),
            Pending => matches!(next, Building | Error | Deleted),
            Building => matches!(next, Created | Active | Error | Deleted),
            Created => matches!(next, Active | Error | Deleted),
            Active => matches!(next, Updating | Stopping | ShuttingDown | Error | Deleted),
            Updating => matches!(next, Active | Error | Deleted),
            Stopping => matches!(next, Stopped | Error | Deleted),
            Stopped => matches!(next, Active | ShuttingDown | Error | Deleted),
            ShuttingDown => matches!(next, Terminated | Error | Deleted),
            Terminated => next == Deleted,
            Error => next == Deleted,
            Deleted => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "DRAFT",
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Created => "CREATED",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::ShuttingDown => "SHUTTINGDOWN",
            Self::Terminated => "TERMINATED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// 已佈建 (或佈建中) 服務的持久紀錄
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub name: String,
    pub plugin_type: String,
    pub account_id: AccountId,
    pub status: InstanceStatus,
    pub resource_id: Option<String>,
    pub error_message: Option<String>,
    pub params: Params,
    pub parent_links: Vec<InstanceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn draft(account_id: AccountId, description: &ServiceDescription, params: Params) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: description.name.clone(),
            plugin_type: description.plugin_type.clone(),
            account_id,
            status: InstanceStatus::Draft,
            resource_id: None,
            error_message: None,
            params,
            parent_links: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.status == InstanceStatus::Deleted
    }
}
