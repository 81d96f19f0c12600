//!
//! # render
//!
//! Read-only views of the graph behind a root, for debugging: the set of
//! reachable nodes and edges, and a Graphviz rendering of it.
//!

use std::fmt;

use rustc_hash::FxHashSet;

use crate::tape::Var;

/// Everything reachable from a root.
#[derive(Debug, Clone)]
pub struct Trace<'t> {
  /// Reachable nodes, root first, each once
  pub nodes: Vec<Var<'t>>,
  /// `(operand, consumer)` pairs, each once even when an operand is repeated
  pub edges: Vec<(Var<'t>, Var<'t>)>,
}

impl<'t> Trace<'t> {
  pub fn dot(&self) -> Dot<'_, 't> {
    Dot { trace: self }
  }
}

/// Collect the nodes and edges reachable from `root`.
pub fn trace<'t>(root: Var<'t>) -> Trace<'t> {
  let mut nodes = Vec::new();
  let mut edges = Vec::new();
  let mut seen_nodes = FxHashSet::default();
  let mut seen_edges = FxHashSet::default();
  let mut stack = vec![root];

  while let Some(node) = stack.pop() {
    if !seen_nodes.insert(node) {
      continue;
    }
    nodes.push(node);
    let operands = node.operands();
    for &operand in &operands {
      if seen_edges.insert((operand, node)) {
        edges.push((operand, node));
      }
    }
    stack.extend(operands.into_iter().rev());
  }

  Trace { nodes, edges }
}

/// Graphviz DOT text of the graph behind `root`.
pub fn to_dot(root: Var<'_>) -> String {
  trace(root).dot().to_string()
}

/// DOT rendering of a [`Trace`]: one record per value, one small node per
/// operation feeding the value it produced.
pub struct Dot<'a, 't> {
  trace: &'a Trace<'t>,
}

impl fmt::Display for Dot<'_, '_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "digraph {{")?;
    writeln!(f, "  graph [rankdir=LR];")?;
    for node in &self.trace.nodes {
      let id = node.index;
      writeln!(
        f,
        "  n{id} [shape=record, label=\"{{ data {:.4} | grad {:.4} }}\"];",
        node.value(),
        node.grad()
      )?;
      if !node.is_leaf() {
        writeln!(f, "  n{id}_op [label=\"{}\"];", node.op())?;
        writeln!(f, "  n{id}_op -> n{id};")?;
      }
    }
    for (operand, consumer) in &self.trace.edges {
      writeln!(f, "  n{} -> n{}_op;", operand.index, consumer.index)?;
    }
    write!(f, "}}")
  }
}
