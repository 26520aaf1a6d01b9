use crate::builtin::MuxSelector;
use chipcore::{AdapterInfo, FlowGraph, NodeError, ToolAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of tool adapters keyed by `(tool, task)`, plus the named
/// selectors `mux` nodes may refer to
pub struct AdapterRegistry {
    adapters: BTreeMap<(String, String), Arc<dyn ToolAdapter>>,
    selectors: BTreeMap<String, Arc<dyn MuxSelector>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
            selectors: BTreeMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one for the same pair
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        let key = (adapter.tool().to_string(), adapter.task().to_string());
        tracing::info!("Registering adapter: {}/{}", key.0, key.1);
        self.adapters.insert(key, adapter);
    }

    pub fn register_selector(&mut self, name: impl Into<String>, selector: Arc<dyn MuxSelector>) {
        let name = name.into();
        tracing::info!("Registering mux selector: {}", name);
        self.selectors.insert(name, selector);
    }

    pub fn get(&self, tool: &str, task: &str) -> Result<Arc<dyn ToolAdapter>, NodeError> {
        self.adapters
            .get(&(tool.to_string(), task.to_string()))
            .cloned()
            .ok_or_else(|| NodeError::UnknownAdapter {
                tool: tool.to_string(),
                task: task.to_string(),
            })
    }

    pub fn selector(&self, name: &str) -> Option<Arc<dyn MuxSelector>> {
        self.selectors.get(name).cloned()
    }

    /// Resolve every node of `graph` up front so unknown adapters or
    /// selectors fail before anything runs.
    pub fn check_graph(&self, graph: &FlowGraph) -> Result<(), NodeError> {
        for node in graph.nodes() {
            match node.builtin {
                None => {
                    self.get(&node.tool, &node.task)?;
                }
                Some(builtin) if builtin.is_selection() => {
                    let select = node.select.as_deref().ok_or_else(|| {
                        NodeError::Configuration(format!(
                            "{} node {} needs a 'select' attribute",
                            builtin.name(),
                            node.id
                        ))
                    })?;
                    if builtin == chipcore::Builtin::Mux && self.selector(select).is_none() {
                        return Err(NodeError::Configuration(format!(
                            "Unknown mux selector '{}' for {}",
                            select, node.id
                        )));
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// All registered `(tool, task)` pairs in order
    pub fn list_adapters(&self) -> Vec<(String, String)> {
        self.adapters.keys().cloned().collect()
    }

    pub fn get_info(&self, tool: &str, task: &str) -> Option<AdapterInfo> {
        self.adapters
            .get(&(tool.to_string(), task.to_string()))
            .map(|a| a.describe())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
