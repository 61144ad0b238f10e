//! Topological ordering and edge indexing.
//!
//! Kahn's algorithm with a deterministic tie-break (ascending [`NodeId`])
//! so execution ordering is reproducible run to run. Also derives:
//! - `in_edges_by_target`, ordered by **input slot** (declaration order
//!   breaks ties) -- this is what binds a join's left and right sides, no
//!   matter the order its edges were declared in;
//! - `out_edges_by_source`, in declaration order;
//! - the set of branching nodes (more than one outbound edge), which the
//!   executor wraps in multicasts.
//!
//! Cycles are reported as [`PipelineError::GraphCyclic`] naming a
//! representative cycle through the offending nodes.

use crate::error::{PipelineError, Result};
use crate::graph::Edge;
use crate::node_id::NodeId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Derived ordering and adjacency indexes for one graph.
#[derive(Debug)]
pub(crate) struct TopologyIndex {
    pub(crate) order: Vec<NodeId>,
    pub(crate) in_edges_by_target: HashMap<NodeId, Vec<Edge>>,
    pub(crate) out_edges_by_source: HashMap<NodeId, Vec<Edge>>,
}

impl TopologyIndex {
    /// Nodes with fan-out (more than one outbound edge).
    #[allow(dead_code)]
    pub(crate) fn branching_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.out_edges_by_source
            .iter()
            .filter(|(_, edges)| edges.len() > 1)
            .map(|(id, _)| *id)
    }
}

/// Sort `nodes` topologically over `edges`.
///
/// `name_of` renders ids for the cycle diagnostic.
pub(crate) fn sort(
    nodes: &[NodeId],
    edges: &[Edge],
    name_of: impl Fn(NodeId) -> String,
) -> Result<TopologyIndex> {
    let mut in_degree: HashMap<NodeId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
    let mut in_edges_by_target: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    let mut out_edges_by_source: HashMap<NodeId, Vec<Edge>> = HashMap::new();

    for edge in edges {
        *in_degree.entry(edge.target).or_insert(0) += 1;
        in_edges_by_target.entry(edge.target).or_default().push(*edge);
        out_edges_by_source.entry(edge.source).or_default().push(*edge);
    }

    // Input binding follows slot order, not declaration order; a stable
    // sort keeps declaration order among equal slots.
    for ins in in_edges_by_target.values_mut() {
        ins.sort_by_key(|e| e.slot);
    }

    // Min-heap on NodeId: among all ready nodes, the smallest id runs first.
    let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        if let Some(outs) = out_edges_by_source.get(&id) {
            for edge in outs {
                let d = in_degree.get_mut(&edge.target).expect("edge target known");
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(edge.target));
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let remaining: HashSet<NodeId> = nodes
            .iter()
            .copied()
            .filter(|id| !order.contains(id))
            .collect();
        return Err(PipelineError::GraphCyclic {
            cycle: render_cycle(&remaining, &out_edges_by_source, name_of),
        });
    }

    Ok(TopologyIndex {
        order,
        in_edges_by_target,
        out_edges_by_source,
    })
}

/// Walk edges among the unsorted remainder until a node repeats, rendering
/// `a -> b -> a`.
fn render_cycle(
    remaining: &HashSet<NodeId>,
    out_edges: &HashMap<NodeId, Vec<Edge>>,
    name_of: impl Fn(NodeId) -> String,
) -> String {
    let Some(start) = remaining.iter().min().copied() else {
        return "<unknown>".into();
    };
    let mut path = vec![start];
    let mut seen: HashSet<NodeId> = HashSet::from([start]);
    let mut cur = start;
    loop {
        let next = out_edges
            .get(&cur)
            .into_iter()
            .flatten()
            .map(|e| e.target)
            .find(|t| remaining.contains(t));
        let Some(next) = next else { break };
        if !seen.insert(next) {
            // Trim the path to the cycle itself and close it.
            let from = path.iter().position(|id| *id == next).unwrap_or(0);
            let mut names: Vec<String> = path[from..].iter().map(|id| name_of(*id)).collect();
            names.push(name_of(next));
            return names.join(" -> ");
        }
        path.push(next);
        cur = next;
    }
    path.iter().map(|id| name_of(*id)).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(a: u64, b: u64) -> Edge {
        Edge {
            source: NodeId::new(a),
            target: NodeId::new(b),
            slot: 0,
        }
    }

    fn ids(v: &[u64]) -> Vec<NodeId> {
        v.iter().map(|i| NodeId::new(*i)).collect()
    }

    #[test]
    fn diamond_orders_deterministically() {
        let nodes = ids(&[0, 1, 2, 3]);
        let edges = vec![e(0, 1), e(0, 2), e(1, 3), e(2, 3)];
        let topo = sort(&nodes, &edges, |id| id.to_string()).unwrap();
        assert_eq!(topo.order, ids(&[0, 1, 2, 3]));
        assert_eq!(topo.branching_nodes().collect::<Vec<_>>(), ids(&[0]));
    }

    #[test]
    fn ready_ties_break_by_ascending_id() {
        let nodes = ids(&[2, 0, 1]);
        let topo = sort(&nodes, &[], |id| id.to_string()).unwrap();
        assert_eq!(topo.order, ids(&[0, 1, 2]));
    }

    #[test]
    fn cycle_is_named() {
        let nodes = ids(&[0, 1, 2]);
        let edges = vec![e(0, 1), e(1, 2), e(2, 1)];
        let err = sort(&nodes, &edges, |id| format!("n{}", id.raw())).unwrap_err();
        assert_eq!(err.code(), "GRAPH_CYCLIC");
        let msg = err.to_string();
        assert!(msg.contains("n1") && msg.contains("n2"), "{msg}");
    }

    #[test]
    fn input_edges_bind_by_slot_order() {
        let nodes = ids(&[0, 1, 2]);
        // Declared right side first; slot order must win.
        let edges = vec![
            Edge { source: NodeId::new(1), target: NodeId::new(2), slot: 1 },
            Edge { source: NodeId::new(0), target: NodeId::new(2), slot: 0 },
        ];
        let topo = sort(&nodes, &edges, |id| id.to_string()).unwrap();
        let ins = &topo.in_edges_by_target[&NodeId::new(2)];
        assert_eq!(ins[0].slot, 0);
        assert_eq!(ins[0].source, NodeId::new(0));
        assert_eq!(ins[1].slot, 1);
        assert_eq!(ins[1].source, NodeId::new(1));
    }
}
