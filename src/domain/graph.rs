use crate::domain::model::{AccountId, InstanceId, ServiceInstance};
use std::collections::HashMap;

/// 服務實例的 arena：實例依插入順序存放，父子關係以整數索引的鄰接表表示
#[derive(Debug, Default, Clone)]
pub struct ServiceGraph {
    nodes: Vec<ServiceInstance>,
    index: HashMap<InstanceId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: ServiceInstance) -> usize {
        let slot = self.nodes.len();
        self.index.insert(instance.id, slot);
        self.nodes.push(instance);
        self.parents.push(Vec::new());
        self.children.push(Vec::new());
        slot
    }

    pub fn get(&self, id: &InstanceId) -> Option<&ServiceInstance> {
        self.index.get(id).map(|&slot| &self.nodes[slot])
    }

    pub fn get_mut(&mut self, id: &InstanceId) -> Option<&mut ServiceInstance> {
        match self.index.get(id) {
            Some(&slot) => Some(&mut self.nodes[slot]),
            None => None,
        }
    }

    /// 建立 child -> parent 連結，重複連結會被忽略
    pub fn link(&mut self, child: &InstanceId, parent: &InstanceId) -> bool {
        let (Some(&c), Some(&p)) = (self.index.get(child), self.index.get(parent)) else {
            return false;
        };
        if self.parents[c].contains(&p) {
            return true;
        }
        self.parents[c].push(p);
        self.children[p].push(c);
        self.nodes[c].parent_links.push(*parent);
        true
    }

    pub fn children_of(&self, id: &InstanceId) -> Vec<&ServiceInstance> {
        self.index
            .get(id)
            .map(|&slot| self.children[slot].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    pub fn parents_of(&self, id: &InstanceId) -> Vec<&ServiceInstance> {
        self.index
            .get(id)
            .map(|&slot| self.parents[slot].iter().map(|&p| &self.nodes[p]).collect())
            .unwrap_or_default()
    }

    /// 依 (帳戶, 類型, 名稱) 找最新一筆未軟刪除的實例
    pub fn find_live(
        &self,
        account_id: &AccountId,
        plugin_type: &str,
        name: &str,
    ) -> Option<&ServiceInstance> {
        self.nodes.iter().rev().find(|instance| {
            instance.account_id == *account_id
                && instance.plugin_type == plugin_type
                && instance.name == name
                && !instance.is_deleted()
        })
    }

    pub fn for_account<'a>(
        &'a self,
        account_id: &'a AccountId,
    ) -> impl Iterator<Item = &'a ServiceInstance> + 'a {
        self.nodes.iter().filter(move |i| i.account_id == *account_id)
    }
}
