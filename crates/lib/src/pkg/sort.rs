//! Dependency-ordering of loaded packages.
//!
//! Packages form a DAG through their dependency lists; the sorter returns a
//! topological order where every dependency precedes its dependents. Ties
//! within a level preserve the original declaration order. Cycles (including
//! self-dependencies) are a validation error naming an offending package.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::PkgError;

/// Topologically sort `(name, dependencies)` pairs.
///
/// Dependencies naming packages outside the set are ignored; the loader
/// guarantees closure before sorting.
pub fn sort_names(declared: &[(String, Vec<String>)]) -> Result<Vec<String>, PkgError> {
  let mut graph: DiGraph<usize, ()> = DiGraph::new();
  let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

  for (pos, (name, _)) in declared.iter().enumerate() {
    let idx = graph.add_node(pos);
    nodes.insert(name.as_str(), idx);
  }

  for (name, deps) in declared {
    let dependent = nodes[name.as_str()];
    for dep in deps {
      if let Some(&dep_idx) = nodes.get(dep.as_str()) {
        // Edge from dependency to dependent.
        graph.add_edge(dep_idx, dependent, ());
      }
    }
  }

  // Kahn's algorithm, always draining the ready node with the smallest
  // declaration position so ties keep declaration order.
  let mut in_degree: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
    .collect();

  let mut remaining: Vec<NodeIndex> = graph.node_indices().collect();
  let mut ordered = Vec::with_capacity(declared.len());

  while !remaining.is_empty() {
    let ready = remaining
      .iter()
      .copied()
      .filter(|idx| in_degree[idx] == 0)
      .min_by_key(|idx| graph[*idx]);

    let Some(next) = ready else {
      // Every remaining node has an unresolved dependency: a cycle. Report
      // the earliest-declared package still stuck in it.
      let stuck = remaining.iter().copied().min_by_key(|idx| graph[*idx]).expect("non-empty");
      return Err(PkgError::CyclicDependency(declared[graph[stuck]].0.clone()));
    };

    ordered.push(declared[graph[next]].0.clone());
    remaining.retain(|idx| *idx != next);

    for neighbor in graph.neighbors_directed(next, Direction::Outgoing) {
      if let Some(deg) = in_degree.get_mut(&neighbor) {
        *deg = deg.saturating_sub(1);
      }
    }
  }

  Ok(ordered)
}
