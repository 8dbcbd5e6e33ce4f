use std::collections::{BTreeMap, BTreeSet, VecDeque};

use casebook_core::error::GraphError;
use casebook_core::types::Playbook;

/// A directed graph of task IDs.
///
/// Nodes and targets are kept in sorted sets so every traversal is
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// node -> outgoing targets
    outputs: BTreeMap<String, BTreeSet<String>>,
    /// node -> number of incoming edges
    inputs: BTreeMap<String, usize>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) -> Result<(), GraphError> {
        let id = id.into();
        if self.outputs.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.outputs.insert(id.clone(), BTreeSet::new());
        // keep edges that reached this node before it was registered
        self.inputs.entry(id).or_insert(0);
        Ok(())
    }

    pub fn add_nodes<I, S>(&mut self, ids: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.add_node(id)?;
        }
        Ok(())
    }

    /// Add `from -> to`. Only `from` must be registered; a target seen for the
    /// first time is created here. Re-adding an edge is a no-op.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let targets = self
            .outputs
            .get_mut(from)
            .ok_or_else(|| GraphError::UnknownNode(from.to_string()))?;

        if targets.insert(to.to_string()) {
            *self.inputs.entry(to.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Kahn's algorithm over sorted seeds and sorted targets.
    pub fn toposort(&self) -> Result<Vec<String>, GraphError> {
        let mut inputs = self.inputs.clone();
        let mut sorted = Vec::with_capacity(self.inputs.len());

        let mut queue: VecDeque<&str> = self
            .inputs
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.as_str())
            .collect();

        while let Some(node) = queue.pop_front() {
            sorted.push(node.to_string());
            let Some(targets) = self.outputs.get(node) else {
                continue;
            };
            for target in targets {
                if let Some(count) = inputs.get_mut(target.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(target.as_str());
                    }
                }
            }
        }

        if sorted.len() < self.inputs.len() {
            return Err(GraphError::Cycle { sorted });
        }
        Ok(sorted)
    }

    /// Sorted list of nodes with an edge into `id`.
    pub fn parents(&self, id: &str) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|(_, targets)| targets.contains(id))
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// The only node without parents.
    pub fn root(&self) -> Result<String, GraphError> {
        let roots: Vec<&String> = self
            .inputs
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id)
            .collect();
        match roots.as_slice() {
            [root] => Ok((*root).clone()),
            _ => Err(GraphError::NoUniqueRoot { count: roots.len() }),
        }
    }
}

/// Build the graph of a playbook: every task is a node, every `next` key an edge.
///
/// A `next` key naming no task of the playbook is rejected.
pub fn playbook_graph(playbook: &Playbook) -> Result<Graph, GraphError> {
    let mut graph = Graph::new();
    graph.add_nodes(playbook.tasks.keys().cloned())?;
    for (id, task) in &playbook.tasks {
        for target in task.next.keys() {
            if !playbook.tasks.contains_key(target) {
                return Err(GraphError::UnknownNode(target.clone()));
            }
            graph.add_edge(id, target)?;
        }
    }
    Ok(graph)
}
