//! Selection logic for `join`, `nop`, `minimum`, `maximum` and `mux` nodes.

use crate::registry::AdapterRegistry;
use crate::runner::PredecessorResult;
use chipcore::{Builtin, FlowNode, MetricRecord, MetricRecorder, NodeError, NodeId, NodeStatus};

/// A successful predecessor offered to a selector
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: NodeId,
    pub metrics: Vec<MetricRecord>,
}

impl Candidate {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.metric == name).map(|m| m.value)
    }
}

/// Picks the predecessor a `mux` node forwards
pub trait MuxSelector: Send + Sync {
    fn select(&self, candidates: &[Candidate]) -> Vec<NodeId>;
}

impl<F> MuxSelector for F
where
    F: Fn(&[Candidate]) -> Vec<NodeId> + Send + Sync,
{
    fn select(&self, candidates: &[Candidate]) -> Vec<NodeId> {
        self(candidates)
    }
}

/// Decide which predecessors a builtin node takes its outputs from.
pub fn select_inputs<'a>(
    builtin: Builtin,
    node: &FlowNode,
    predecessors: &'a [PredecessorResult],
    metrics: &MetricRecorder,
    registry: &AdapterRegistry,
) -> Result<Vec<&'a PredecessorResult>, NodeError> {
    let succeeded: Vec<&PredecessorResult> = predecessors
        .iter()
        .filter(|p| p.status == NodeStatus::Success)
        .collect();

    match builtin {
        Builtin::Join | Builtin::Nop => Ok(succeeded),
        Builtin::Minimum | Builtin::Maximum => {
            let metric = select_attribute(node)?;
            let mut best: Option<(&PredecessorResult, f64)> = None;
            for pred in succeeded {
                let value = match metrics.get(&pred.id.step, &pred.id.index, metric) {
                    Ok(v) if !v.is_nan() => v,
                    _ => {
                        tracing::warn!("{}: {} has no '{}' metric, ignoring", node.id, pred.id, metric);
                        continue;
                    }
                };
                let better = match best {
                    None => true,
                    Some((_, current)) if builtin == Builtin::Minimum => value < current,
                    Some((_, current)) => value > current,
                };
                if better {
                    best = Some((pred, value));
                }
            }
            let (chosen, value) = best.ok_or(NodeError::NoCandidate(predecessors.len()))?;
            tracing::info!(
                "{}: {} selected {} ({} = {})",
                node.id,
                builtin.name(),
                chosen.id,
                metric,
                value
            );
            Ok(vec![chosen])
        }
        Builtin::Mux => {
            let name = select_attribute(node)?;
            let selector = registry
                .selector(name)
                .ok_or_else(|| NodeError::Configuration(format!("Unknown mux selector '{}'", name)))?;
            if succeeded.is_empty() {
                return Err(NodeError::NoCandidate(predecessors.len()));
            }
            let candidates: Vec<Candidate> = succeeded
                .iter()
                .map(|p| Candidate {
                    id: p.id.clone(),
                    metrics: metrics.node_records(&p.id.step, &p.id.index),
                })
                .collect();
            let chosen = selector.select(&candidates);
            let matches: Vec<&PredecessorResult> = succeeded
                .into_iter()
                .filter(|p| chosen.contains(&p.id))
                .collect();
            if matches.len() != 1 || chosen.len() != 1 {
                return Err(NodeError::AmbiguousSelection {
                    selector: name.to_string(),
                    matches: chosen.len().max(matches.len()),
                });
            }
            tracing::info!("{}: mux '{}' selected {}", node.id, name, matches[0].id);
            Ok(matches)
        }
    }
}

fn select_attribute(node: &FlowNode) -> Result<&str, NodeError> {
    node.select.as_deref().ok_or_else(|| {
        NodeError::Configuration(format!("{} needs a 'select' attribute", node.id))
    })
}
