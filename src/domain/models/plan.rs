//! Execution plan: topological levelization of a workflow.
//!
//! A plan is derived, never persisted. Each level is a maximal set of
//! mutually independent stages; levels execute strictly in order.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::workflow::{StageId, Workflow};
use crate::domain::{OrchestratorError, OrchestratorResult};

/// Ordered levels of mutually independent stages (Kahn levelization).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<StageId>>,
}

impl ExecutionPlan {
    /// Build the plan for a workflow.
    ///
    /// Fails with `UnknownStageRef` when an edge endpoint is not a
    /// declared stage, and with `CyclicDependency` (citing the stages
    /// left over) when the edge graph has a cycle.
    pub fn compile(workflow: &Workflow) -> OrchestratorResult<Self> {
        let declared: BTreeSet<&str> = workflow.stages.iter().map(|t| t.stage_id.as_str()).collect();

        for edge in &workflow.edges {
            if !declared.contains(edge.from.as_str()) {
                return Err(OrchestratorError::UnknownStageRef { stage: edge.from.clone() });
            }
            if !declared.contains(edge.to.as_str()) {
                return Err(OrchestratorError::UnknownStageRef { stage: edge.to.clone() });
            }
        }

        // In-degrees and adjacency over declared stages. Parallel edges
        // between the same pair count once.
        let mut dependents: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        let mut in_degree: BTreeMap<&str, usize> = declared.iter().map(|&s| (s, 0)).collect();

        for edge in &workflow.edges {
            if dependents
                .entry(edge.from.as_str())
                .or_default()
                .insert(edge.to.as_str())
            {
                *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
            }
        }

        // Stage declaration order breaks ties within a level.
        let declaration_order: HashMap<&str, usize> = workflow
            .stages
            .iter()
            .enumerate()
            .map(|(i, t)| (t.stage_id.as_str(), i))
            .collect();

        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&s, _)| s)
            .collect();
        frontier.sort_by_key(|s| declaration_order.get(s).copied().unwrap_or(usize::MAX));

        let mut levels: Vec<Vec<StageId>> = Vec::new();
        let mut emitted = 0usize;

        while !frontier.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            let mut queue: VecDeque<&str> = frontier.iter().copied().collect();

            while let Some(stage) = queue.pop_front() {
                emitted += 1;
                if let Some(deps) = dependents.get(stage) {
                    for &dep in deps {
                        let degree = in_degree
                            .get_mut(dep)
                            .expect("edge endpoints validated above");
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dep);
                        }
                    }
                }
            }

            levels.push(frontier.iter().map(|&s| s.to_string()).collect());
            next.sort_by_key(|s| declaration_order.get(s).copied().unwrap_or(usize::MAX));
            frontier = next;
        }

        if emitted != declared.len() {
            // Whatever was never emitted sits on a cycle.
            let mut stages: Vec<String> = in_degree
                .iter()
                .filter(|&(_, &d)| d > 0)
                .map(|(&s, _)| s.to_string())
                .collect();
            stages.sort();
            return Err(OrchestratorError::CyclicDependency { stages });
        }

        Ok(Self { levels })
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn stage_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Level index of a stage, if present.
    pub fn level_of(&self, stage_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|s| s == stage_id))
    }
}
