//! 步骤依赖图
//!
//! 建图即校验：重复 id、未知依赖、环，任何一条都让整份计划作废。
//! 已完成的步骤在建图时直接视为 done，恢复执行时不会重跑。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::error::BridgeError;
use crate::task::types::{StepStatus, TaskStep};

/// 依赖图快照，归执行引擎单线程持有
#[derive(Debug)]
pub struct StepGraph {
    /// dep id → 依赖它的步骤
    adjacency: HashMap<String, Vec<String>>,
    /// 未完成步骤的剩余依赖数
    in_degree: HashMap<String, usize>,
    done: HashSet<String>,
    /// 步骤在计划里的原始位置，ready 输出按它排序
    order: HashMap<String, usize>,
}

impl StepGraph {
    pub fn build(steps: &[TaskStep]) -> Result<StepGraph, BridgeError> {
        let mut order = HashMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if order.insert(step.id.clone(), idx).is_some() {
                return Err(BridgeError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut full_degree: HashMap<String, usize> =
            steps.iter().map(|s| (s.id.clone(), 0)).collect();
        for step in steps {
            for dep in &step.depends_on {
                if !order.contains_key(dep) {
                    return Err(BridgeError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
                if dep == &step.id {
                    return Err(BridgeError::Validation(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *full_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        // Kahn 拓扑排序探环，完成状态不参与
        let mut degree = full_degree.clone();
        let mut queue: VecDeque<String> = steps
            .iter()
            .filter(|s| degree.get(&s.id).copied().unwrap_or(0) == 0)
            .map(|s| s.id.clone())
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(dependents) = adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(deg) = degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
        }
        if visited != steps.len() {
            return Err(BridgeError::Validation(
                "dependency cycle detected in plan".to_string(),
            ));
        }

        let done: HashSet<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        let mut in_degree = HashMap::new();
        for step in steps {
            if done.contains(&step.id) {
                continue;
            }
            let remaining = step
                .depends_on
                .iter()
                .filter(|dep| !done.contains(*dep))
                .count();
            in_degree.insert(step.id.clone(), remaining);
        }

        Ok(StepGraph {
            adjacency,
            in_degree,
            done,
            order,
        })
    }

    /// 当前无阻塞、可立即派发的步骤，按计划顺序给出
    pub fn ready(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.clone())
            .collect();
        self.sort_by_plan_order(&mut ids);
        ids
    }

    /// 标记完成并返回因此解锁的步骤
    pub fn mark_completed(&mut self, id: &str) -> Vec<String> {
        if !self.done.insert(id.to_string()) {
            return Vec::new();
        }
        self.in_degree.remove(id);

        let mut newly = Vec::new();
        if let Some(dependents) = self.adjacency.get(id) {
            for dependent in dependents {
                if let Some(deg) = self.in_degree.get_mut(dependent) {
                    if *deg > 0 {
                        *deg -= 1;
                    }
                    if *deg == 0 {
                        newly.push(dependent.clone());
                    }
                }
            }
        }
        self.sort_by_plan_order(&mut newly);
        newly
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done.contains(id)
    }

    /// 未完成的步骤数
    pub fn pending_count(&self) -> usize {
        self.in_degree.len()
    }

    fn sort_by_plan_order(&self, ids: &mut Vec<String>) {
        ids.sort_by_key(|id| self.order.get(id).copied().unwrap_or(usize::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::ActionKind;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> TaskStep {
        TaskStep::new(id, ActionKind::Custom, json!({})).after(deps)
    }

    #[test]
    fn test_linear_chain_unlocks_in_order() {
        let steps = vec![step("step-1", &[]), step("step-2", &["step-1"]), step("step-3", &["step-2"])];
        let mut graph = StepGraph::build(&steps).unwrap();

        assert_eq!(graph.ready(), vec!["step-1"]);
        assert_eq!(graph.mark_completed("step-1"), vec!["step-2"]);
        assert_eq!(graph.mark_completed("step-2"), vec!["step-3"]);
        assert_eq!(graph.mark_completed("step-3"), Vec::<String>::new());
        assert_eq!(graph.pending_count(), 0);
    }

    #[test]
    fn test_diamond_exposes_parallel_branches() {
        let steps = vec![
            step("step-1", &[]),
            step("step-2", &["step-1"]),
            step("step-3", &["step-1"]),
            step("step-4", &["step-2", "step-3"]),
        ];
        let mut graph = StepGraph::build(&steps).unwrap();

        assert_eq!(graph.mark_completed("step-1"), vec!["step-2", "step-3"]);
        assert!(graph.mark_completed("step-2").is_empty());
        assert_eq!(graph.mark_completed("step-3"), vec!["step-4"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let steps = vec![step("step-1", &[]), step("step-1", &[])];
        let err = StepGraph::build(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let steps = vec![step("step-1", &["phantom"])];
        let err = StepGraph::build(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![step("step-1", &["step-2"]), step("step-2", &["step-1"])];
        assert!(StepGraph::build(&steps).is_err());

        let steps = vec![step("step-1", &["step-1"])];
        assert!(StepGraph::build(&steps).is_err());
    }

    #[test]
    fn test_completed_steps_skipped_on_resume() {
        let mut steps = vec![step("step-1", &[]), step("step-2", &["step-1"]), step("step-3", &["step-2"])];
        steps[0].status = StepStatus::Completed;
        let graph = StepGraph::build(&steps).unwrap();

        assert!(graph.is_done("step-1"));
        assert_eq!(graph.ready(), vec!["step-2"]);
        assert_eq!(graph.pending_count(), 2);
    }
}
