//! Explicit dependency graph over the step instances of one workflow instance

use crate::{
    ids::StepInstanceId,
    instance::{StepInstance, StepStatus},
    Result, WorkflowError,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Directed acyclic graph of step predecessors.
///
/// Edges point from a dependency to its dependent. The graph is built from
/// the `depends_on` lists fixed at instantiation, so transitions never have
/// to re-derive ordering intent from order indices.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<StepInstanceId, ()>,
    step_to_node: HashMap<StepInstanceId, NodeIndex>,
}

impl StepGraph {
    /// Build and validate the graph
    pub fn new(steps: &[StepInstance]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_to_node = HashMap::new();

        for step in steps {
            if step_to_node.contains_key(&step.id) {
                return Err(WorkflowError::InvalidTemplate(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
            let node = graph.add_node(step.id);
            step_to_node.insert(step.id, node);
        }

        for step in steps {
            let to_node = step_to_node[&step.id];
            for dep in &step.depends_on {
                let from_node = step_to_node.get(dep).ok_or_else(|| {
                    WorkflowError::InvalidTemplate(format!(
                        "Step {} depends on unknown step {}",
                        step.id, dep
                    ))
                })?;
                graph.update_edge(*from_node, to_node, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(WorkflowError::InvalidTemplate(
                "Cycle detected in step dependencies".to_string(),
            ));
        }

        Ok(Self {
            graph,
            step_to_node,
        })
    }

    /// Steps in dependency order (dependencies before dependents)
    pub fn topological_order(&self) -> Vec<StepInstanceId> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .unwrap_or_default()
    }

    /// Direct predecessors of `step` that are not yet completed or skipped
    pub fn pending_dependencies(
        &self,
        step: StepInstanceId,
        statuses: &HashMap<StepInstanceId, StepStatus>,
    ) -> Vec<StepInstanceId> {
        self.neighbors(step, Direction::Incoming)
            .into_iter()
            .filter(|dep| !statuses.get(dep).is_some_and(|s| s.is_done()))
            .collect()
    }

    /// Not-started steps whose predecessors are all done
    pub fn ready_steps(&self, statuses: &HashMap<StepInstanceId, StepStatus>) -> Vec<StepInstanceId> {
        self.topological_order()
            .into_iter()
            .filter(|id| statuses.get(id) == Some(&StepStatus::NotStarted))
            .filter(|id| self.pending_dependencies(*id, statuses).is_empty())
            .collect()
    }

    /// Steps that directly wait on `step`
    pub fn dependents(&self, step: StepInstanceId) -> Vec<StepInstanceId> {
        self.neighbors(step, Direction::Outgoing)
    }

    fn neighbors(&self, step: StepInstanceId, direction: Direction) -> Vec<StepInstanceId> {
        match self.step_to_node.get(&step) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, direction)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.step_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_to_node.is_empty()
    }
}

/// Status lookup for a slice of steps
pub fn status_map(steps: &[StepInstance]) -> HashMap<StepInstanceId, StepStatus> {
    steps.iter().map(|s| (s.id, s.status)).collect()
}
