use crate::domain::model::ServiceDescription;
use crate::utils::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};

/// `requires` 指向不存在的描述時的處理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementPolicy {
    /// 視為沒有依賴，節點成為根節點 (level 0)
    #[default]
    Lenient,
    /// 回報 ValidationError
    Strict,
}

/// 單次解析期間的暫時節點
#[derive(Debug)]
struct DependencyNode {
    required: Option<usize>,
    dependents: Vec<usize>,
}

/// 將扁平的服務描述清單轉為依序建立的層級
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraphResolver {
    policy: RequirementPolicy,
}

impl DependencyGraphResolver {
    pub fn new(policy: RequirementPolicy) -> Self {
        Self { policy }
    }

    pub fn resolve(
        &self,
        descriptions: &[ServiceDescription],
    ) -> Result<Vec<Vec<ServiceDescription>>> {
        let nodes = self.build_nodes(descriptions)?;

        let mut emitted = vec![false; nodes.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        let mut current: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].required.is_none())
            .collect();

        while !current.is_empty() {
            for &i in &current {
                emitted[i] = true;
            }
            // dependents 依輸入順序合併，保持穩定排序
            let mut next: Vec<usize> = current
                .iter()
                .flat_map(|&i| nodes[i].dependents.iter().copied())
                .collect();
            next.sort_unstable();
            next.dedup();
            levels.push(std::mem::replace(&mut current, next));
        }

        let stranded: Vec<String> = descriptions
            .iter()
            .zip(&emitted)
            .filter(|(_, &done)| !done)
            .map(|(d, _)| d.key())
            .collect();
        if !stranded.is_empty() {
            return Err(OrchestratorError::CyclicDependency { services: stranded });
        }

        Ok(levels
            .into_iter()
            .map(|level| level.into_iter().map(|i| descriptions[i].clone()).collect())
            .collect())
    }

    fn build_nodes(&self, descriptions: &[ServiceDescription]) -> Result<Vec<DependencyNode>> {
        let mut nodes: Vec<DependencyNode> = descriptions
            .iter()
            .map(|_| DependencyNode {
                required: None,
                dependents: Vec::new(),
            })
            .collect();

        for (i, description) in descriptions.iter().enumerate() {
            let Some(requirement) = &description.requires else {
                continue;
            };

            match descriptions
                .iter()
                .position(|d| d.matches(&requirement.name, &requirement.plugin_type))
            {
                Some(target) => {
                    nodes[i].required = Some(target);
                    nodes[target].dependents.push(i);
                }
                None if self.policy == RequirementPolicy::Strict => {
                    return Err(OrchestratorError::validation(format!(
                        "service '{}' requires '{}' which is not part of the capability",
                        description.key(),
                        requirement
                    )));
                }
                None => {
                    tracing::warn!(
                        "⚠️ Service '{}' requires unknown '{}', treating it as a root",
                        description.key(),
                        requirement
                    );
                }
            }
        }

        Ok(nodes)
    }
}
