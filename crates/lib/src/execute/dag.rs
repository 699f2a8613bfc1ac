//! Dependency DAG over the resources of one run.
//!
//! Nodes are added in declaration order, so a node's index is its
//! declaration position. Edges point from a dependency to its dependent.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ConvergeError;
use crate::resource::{Resource, ResourceId};

/// A DAG representing `depends_on` edges between resources.
///
/// Provides:
/// - a stable topological order (ties broken by declaration order)
/// - parallel execution waves (Kahn levels)
/// - dependency queries used to skip dependents of failed resources
#[derive(Debug)]
pub struct ResourceDag {
  graph: DiGraph<ResourceId, ()>,
  nodes: HashMap<ResourceId, NodeIndex>,
}

impl ResourceDag {
  /// Build the DAG of `resources`.
  ///
  /// # Errors
  ///
  /// - [`ConvergeError::UnknownDependency`] for an edge to an undeclared resource
  /// - [`ConvergeError::CyclicDependency`] listing the resources on a cycle
  pub fn from_resources(resources: &[Resource]) -> Result<Self, ConvergeError> {
    let mut graph = DiGraph::with_capacity(resources.len(), resources.len());
    let mut nodes = HashMap::with_capacity(resources.len());

    for resource in resources {
      let idx = graph.add_node(resource.id.clone());
      nodes.insert(resource.id.clone(), idx);
    }

    for resource in resources {
      let dependent = nodes[&resource.id];
      for dep in &resource.depends_on {
        let Some(&dependency) = nodes.get(dep) else {
          return Err(ConvergeError::UnknownDependency {
            resource: resource.id.clone(),
            dependency: dep.clone(),
          });
        };
        graph.update_edge(dependency, dependent, ());
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  /// Fail with the members of the first cycle, in declaration order.
  fn verify_acyclic(&self) -> Result<(), ConvergeError> {
    let cycle = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .min_by_key(|scc| scc.iter().map(|idx| idx.index()).min());

    match cycle {
      Some(mut members) => {
        members.sort();
        Err(ConvergeError::CyclicDependency(
          members.into_iter().map(|idx| self.graph[idx].clone()).collect(),
        ))
      }
      None => Ok(()),
    }
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
    self.nodes.get(id).map(|idx| idx.index())
  }

  pub fn id(&self, index: usize) -> &ResourceId {
    &self.graph[NodeIndex::new(index)]
  }

  /// Declaration indices of the direct dependencies of `index`.
  pub fn dependencies(&self, index: usize) -> Vec<usize> {
    let mut deps: Vec<usize> = self
      .graph
      .neighbors_directed(NodeIndex::new(index), Direction::Incoming)
      .map(|idx| idx.index())
      .collect();
    deps.sort_unstable();
    deps
  }

  /// Topological order where, among ready resources, the earliest declared
  /// always goes first.
  pub fn order(&self) -> Vec<usize> {
    let mut in_degree: Vec<usize> = self
      .graph
      .node_indices()
      .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
      .collect();
    let mut ready: BTreeSet<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(next) = ready.pop_first() {
      order.push(next);
      for dependent in self.graph.neighbors_directed(NodeIndex::new(next), Direction::Outgoing) {
        let d = dependent.index();
        in_degree[d] -= 1;
        if in_degree[d] == 0 {
          ready.insert(d);
        }
      }
    }
    order
  }

  /// Resources organized into parallel execution waves.
  ///
  /// Each wave contains resources whose dependencies all sit in earlier
  /// waves. Within a wave, resources keep declaration order.
  pub fn waves(&self) -> Vec<Vec<usize>> {
    let mut in_degree: Vec<usize> = self
      .graph
      .node_indices()
      .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
      .collect();
    let mut current: Vec<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut waves = Vec::new();

    while !current.is_empty() {
      let mut next = Vec::new();
      for &idx in &current {
        for dependent in self.graph.neighbors_directed(NodeIndex::new(idx), Direction::Outgoing) {
          let d = dependent.index();
          in_degree[d] -= 1;
          if in_degree[d] == 0 {
            next.push(d);
          }
        }
      }
      next.sort_unstable();
      waves.push(std::mem::replace(&mut current, next));
    }
    waves
  }
}
