//! Static description of a flow: `(step, index)` nodes and their
//! predecessor edges.

use crate::GraphError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

pub const BUILTIN_TOOL: &str = "builtin";

/// Identity of a node: a step name plus the index of one of its parallel
/// variants
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub step: String,
    pub index: String,
}

impl NodeId {
    pub fn new(step: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            index: index.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.step, self.index)
    }
}

/// Synthetic nodes that merge or select among predecessor outputs instead of
/// running a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    Join,
    Minimum,
    Maximum,
    Mux,
    Nop,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Join => "join",
            Builtin::Minimum => "minimum",
            Builtin::Maximum => "maximum",
            Builtin::Mux => "mux",
            Builtin::Nop => "nop",
        }
    }

    pub fn from_task(task: &str) -> Option<Builtin> {
        match task {
            "join" => Some(Builtin::Join),
            "minimum" => Some(Builtin::Minimum),
            "maximum" => Some(Builtin::Maximum),
            "mux" => Some(Builtin::Mux),
            "nop" => Some(Builtin::Nop),
            _ => None,
        }
    }

    /// Selection builtins only need one successful predecessor.
    pub fn is_selection(&self) -> bool {
        matches!(self, Builtin::Minimum | Builtin::Maximum | Builtin::Mux)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    #[serde(flatten)]
    pub id: NodeId,
    pub tool: String,
    pub task: String,
    /// Adapter path, fixed when the node is added
    pub taskmodule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<Builtin>,
    /// Declared output filenames, in order
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Predecessors, in order
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    /// Metric for minimum/maximum, selector name for mux
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
}

impl FlowNode {
    pub fn add_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.outputs.push(name.into());
        self
    }

    pub fn set_select(&mut self, select: impl Into<String>) -> &mut Self {
        self.select = Some(select.into());
        self
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlowGraphDef {
    name: String,
    nodes: Vec<FlowNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FlowGraphDef", into = "FlowGraphDef")]
pub struct FlowGraph {
    pub name: String,
    nodes: BTreeMap<NodeId, FlowNode>,
}

impl TryFrom<FlowGraphDef> for FlowGraph {
    type Error = GraphError;

    fn try_from(def: FlowGraphDef) -> Result<Self, Self::Error> {
        let mut graph = FlowGraph::new(def.name);
        for mut node in def.nodes {
            if graph.nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    step: node.id.step,
                    index: node.id.index,
                });
            }
            if node.builtin.is_none() && node.tool == BUILTIN_TOOL {
                node.builtin = Builtin::from_task(&node.task);
            }
            graph.nodes.insert(node.id.clone(), node);
        }
        Ok(graph)
    }
}

impl From<FlowGraph> for FlowGraphDef {
    fn from(graph: FlowGraph) -> Self {
        FlowGraphDef {
            name: graph.name,
            nodes: graph.nodes.into_values().collect(),
        }
    }
}

impl FlowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn add_node(
        &mut self,
        step: &str,
        index: &str,
        tool: &str,
        task: &str,
        taskmodule: &str,
    ) -> Result<&mut FlowNode, GraphError> {
        let id = NodeId::new(step, index);
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode {
                step: step.to_string(),
                index: index.to_string(),
            });
        }
        let node = FlowNode {
            id: id.clone(),
            tool: tool.to_string(),
            task: task.to_string(),
            taskmodule: taskmodule.to_string(),
            builtin: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
            select: None,
        };
        Ok(self.nodes.entry(id).or_insert(node))
    }

    /// Add a node whose adapter path is `tool/task`.
    pub fn node(
        &mut self,
        step: &str,
        index: &str,
        tool: &str,
        task: &str,
    ) -> Result<&mut FlowNode, GraphError> {
        let taskmodule = format!("{}/{}", tool, task);
        self.add_node(step, index, tool, task, &taskmodule)
    }

    pub fn add_builtin(
        &mut self,
        step: &str,
        index: &str,
        builtin: Builtin,
    ) -> Result<&mut FlowNode, GraphError> {
        let node = self.node(step, index, BUILTIN_TOOL, builtin.name())?;
        node.builtin = Some(builtin);
        Ok(node)
    }

    /// Make `(pred_step, pred_index)` a predecessor of `(step, index)`.
    pub fn add_edge(
        &mut self,
        step: &str,
        index: &str,
        pred_step: &str,
        pred_index: &str,
    ) -> Result<(), GraphError> {
        let pred = NodeId::new(pred_step, pred_index);
        if !self.nodes.contains_key(&pred) {
            return Err(GraphError::UnknownNode {
                step: pred.step,
                index: pred.index,
            });
        }
        let node = self
            .nodes
            .get_mut(&NodeId::new(step, index))
            .ok_or_else(|| GraphError::UnknownNode {
                step: step.to_string(),
                index: index.to_string(),
            })?;
        if !node.inputs.contains(&pred) {
            node.inputs.push(pred);
        }
        Ok(())
    }

    /// Remove one index of `step`, or every index when `index` is `None`.
    /// Edges that referenced removed nodes are dropped; remaining indices
    /// keep their names.
    pub fn remove_node(&mut self, step: &str, index: Option<&str>) -> Result<Vec<NodeId>, GraphError> {
        let removed: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| id.step == step && index.map_or(true, |i| id.index == i))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Err(GraphError::UnknownNode {
                step: step.to_string(),
                index: index.unwrap_or("*").to_string(),
            });
        }
        for id in &removed {
            self.nodes.remove(id);
        }
        for node in self.nodes.values_mut() {
            node.inputs.retain(|pred| !removed.contains(pred));
        }
        tracing::debug!("Removed {} node(s) of step '{}'", removed.len(), step);
        Ok(removed)
    }

    pub fn get(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Distinct step names in order.
    pub fn steps(&self) -> Vec<String> {
        let mut steps: Vec<String> = Vec::new();
        for id in self.nodes.keys() {
            if steps.last() != Some(&id.step) {
                steps.push(id.step.clone());
            }
        }
        steps
    }

    pub fn indices(&self, step: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| id.step == step)
            .map(|id| id.index.clone())
            .collect()
    }

    pub fn predecessors(&self, id: &NodeId) -> &[NodeId] {
        self.nodes.get(id).map(|n| n.inputs.as_slice()).unwrap_or(&[])
    }

    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.inputs.contains(id))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.inputs.is_empty())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Nodes nothing depends on; these decide overall run success.
    pub fn terminal_nodes(&self) -> Vec<NodeId> {
        let referenced: HashSet<&NodeId> = self.nodes.values().flat_map(|n| n.inputs.iter()).collect();
        self.nodes
            .keys()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect()
    }

    /// Project onto a petgraph graph with edges pointing predecessor to
    /// successor. Edges to missing nodes are left out.
    pub fn to_digraph(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for id in self.nodes.keys() {
            let idx = graph.add_node(id.clone());
            node_to_index.insert(id.clone(), idx);
        }

        for node in self.nodes.values() {
            let to_idx = node_to_index[&node.id];
            for pred in &node.inputs {
                if let Some(from_idx) = node_to_index.get(pred) {
                    graph.add_edge(*from_idx, to_idx, ());
                }
            }
        }

        (graph, node_to_index)
    }

    /// Check the structural invariants: at least one node, no dangling
    /// edges, at least one entry node, no cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGraph(self.name.clone()));
        }

        for node in self.nodes.values() {
            for pred in &node.inputs {
                if !self.nodes.contains_key(pred) {
                    return Err(GraphError::DanglingEdge {
                        from: pred.to_string(),
                        to: node.id.to_string(),
                    });
                }
            }
        }

        if self.entry_nodes().is_empty() {
            return Err(GraphError::NoEntryPoint(self.name.clone()));
        }

        let (graph, _) = self.to_digraph();
        if let Some(cycle) = find_cycle(&graph) {
            return Err(GraphError::Cycle {
                path: cycle.iter().map(|id| id.to_string()).collect(),
            });
        }

        Ok(())
    }

    /// Maximal-parallelism schedule: each layer holds every node whose
    /// predecessors all sit in earlier layers. The iterator is lazy and
    /// can be restarted by cloning it or calling this again.
    pub fn topological_layers(&self) -> TopologicalLayers {
        let (graph, _) = self.to_digraph();
        TopologicalLayers {
            graph,
            placed: HashSet::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit recursion stack. Returns the nodes
/// of the first cycle found, closing node repeated at the end.
fn find_cycle(graph: &DiGraph<NodeId, ()>) -> Option<Vec<NodeId>> {
    let mut state = vec![Visit::Unvisited; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn visit(
        graph: &DiGraph<NodeId, ()>,
        idx: NodeIndex,
        state: &mut [Visit],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeId>> {
        state[idx.index()] = Visit::OnStack;
        stack.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            match state[next.index()] {
                Visit::OnStack => {
                    let start = stack.iter().position(|i| *i == next).unwrap_or(0);
                    let mut path: Vec<NodeId> =
                        stack[start..].iter().map(|i| graph[*i].clone()).collect();
                    path.push(graph[next].clone());
                    return Some(path);
                }
                Visit::Unvisited => {
                    if let Some(path) = visit(graph, next, state, stack) {
                        return Some(path);
                    }
                }
                Visit::Done => {}
            }
        }
        stack.pop();
        state[idx.index()] = Visit::Done;
        None
    }

    for idx in graph.node_indices() {
        if state[idx.index()] == Visit::Unvisited {
            if let Some(path) = visit(graph, idx, &mut state, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

/// Lazy layer-by-layer walk of a flowgraph
#[derive(Debug, Clone)]
pub struct TopologicalLayers {
    graph: DiGraph<NodeId, ()>,
    placed: HashSet<NodeIndex>,
}

impl Iterator for TopologicalLayers {
    type Item = BTreeSet<NodeId>;

    fn next(&mut self) -> Option<Self::Item> {
        let ready: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| !self.placed.contains(idx))
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .all(|dep| self.placed.contains(&dep))
            })
            .collect();

        if ready.is_empty() {
            return None;
        }

        let layer = ready.iter().map(|idx| self.graph[*idx].clone()).collect();
        self.placed.extend(ready);
        Some(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> FlowGraph {
        let mut g = FlowGraph::new("chain");
        g.node("import", "0", "surelog", "import").unwrap();
        g.node("syn", "0", "yosys", "syn_asic").unwrap();
        g.add_edge("syn", "0", "import", "0").unwrap();
        g
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let mut g = chain();
        let err = g.node("import", "0", "surelog", "import").unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateNode {
                step: "import".into(),
                index: "0".into()
            }
        );
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let mut g = chain();
        assert!(matches!(
            g.add_edge("syn", "0", "ghost", "0"),
            Err(GraphError::UnknownNode { .. })
        ));
        assert!(matches!(
            g.add_edge("ghost", "0", "import", "0"),
            Err(GraphError::UnknownNode { .. })
        ));
    }

    #[test]
    fn builtin_nodes_carry_builtin_tool() {
        let mut g = FlowGraph::new("test");
        g.add_builtin("A", "0", Builtin::Join).unwrap();
        let node = g.get(&NodeId::new("A", "0")).unwrap();
        assert_eq!(node.tool, "builtin");
        assert_eq!(node.task, "join");
        assert_eq!(node.taskmodule, "builtin/join");
    }

    #[test]
    fn cycle_path_is_reported() {
        let mut g = chain();
        g.node("place", "0", "openroad", "place").unwrap();
        g.add_edge("place", "0", "syn", "0").unwrap();
        g.add_edge("syn", "0", "place", "0").unwrap();
        match g.validate() {
            Err(GraphError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"syn/0".to_string()));
                assert!(path.contains(&"place/0".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn entry_and_terminal_nodes() {
        let g = chain();
        assert_eq!(g.entry_nodes(), vec![NodeId::new("import", "0")]);
        assert_eq!(g.terminal_nodes(), vec![NodeId::new("syn", "0")]);
        assert_eq!(g.successors(&NodeId::new("import", "0")), vec![NodeId::new("syn", "0")]);
    }

    #[test]
    fn layers_are_restartable() {
        let g = chain();
        let layers = g.topological_layers();
        let first: Vec<_> = layers.clone().collect();
        let second: Vec<_> = layers.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }
}
