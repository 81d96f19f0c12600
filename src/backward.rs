//!
//! # backward
//!
//! Reverse-mode sweep over the tape: order the subgraph reachable from a root,
//! seed the root with 1, then walk the order backwards so every node has all of
//! its gradient before it pushes contributions onto its operands.
//!

use log::{debug, trace};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::tape::{Node, NodeIndex, Tape, Var};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
  /// Expanded, operands still being explored
  Open,
  /// Emitted into the order
  Done,
}

/// Topologically sort the subgraph of `root`, moving backwards along operands;
/// every node appears after all of its operands.
///
/// A node met again while still open lies on its own operand path, which the
/// tape cannot produce; it is reported as `Error::Cycle`.
pub(crate) fn topological_order(nodes: &[Node], root: NodeIndex) -> Result<Vec<NodeIndex>> {
  let mut stack = Vec::with_capacity(64);
  let mut order = Vec::with_capacity(64);
  let mut marks = FxHashMap::with_capacity_and_hasher(64, Default::default());

  stack.push((root, false));

  // linear dfs, no recursion limit on deep chains...
  while let Some((index, operands_processed)) = stack.pop() {
    if operands_processed {
      marks.insert(index, Mark::Done);
      order.push(index);
      continue;
    }
    match marks.get(&index) {
      Some(Mark::Done) => continue,
      Some(Mark::Open) => return Err(Error::Cycle { node: index }),
      None => {}
    }
    marks.insert(index, Mark::Open);
    // marker to emit the node after its operands
    stack.push((index, true));
    // first operand explored first, order matters...
    for &operand in nodes[index].operands.iter().rev() {
      if marks.get(&operand) != Some(&Mark::Done) {
        stack.push((operand, false));
      }
    }
  }

  Ok(order)
}

/// Run the sweep from `root` on `tape`.
fn sweep(tape: &Tape, root: NodeIndex) -> Result<()> {
  let mut nodes = tape.nodes.borrow_mut();
  let order = topological_order(&nodes, root)?;

  // interior gradients only mean something within one sweep; leaves keep
  // accumulating until the caller resets them
  for &index in &order {
    let node = &mut nodes[index];
    if !node.is_leaf() {
      node.grad = 0.0;
    }
  }
  nodes[root].grad = 1.0;

  for &index in order.iter().rev() {
    // read phase
    let node = &nodes[index];
    if node.is_leaf() {
      continue;
    }
    let inputs: SmallVec<[f64; 2]> = node.operands.iter().map(|&i| nodes[i].value).collect();
    // compute phase
    let grads = node.op.pullback(&inputs, node.value, node.grad);
    let operands = node.operands.clone();
    // write phase, accumulate, never overwrite...
    for (operand, grad) in operands.into_iter().zip(grads) {
      nodes[operand].grad += grad;
    }
  }

  debug!("backward: swept {} nodes from node {}", order.len(), root);
  Ok(())
}

impl<'t> Var<'t> {
  /// Compute `d self / d n` for every node `n` reachable from `self`.
  ///
  /// Gradients of leaves are accumulated onto whatever they held before, so
  /// parameters must be zeroed between training steps.
  pub fn backward(&self) -> Result<()> {
    self.check_live();
    trace!("backward from node {}", self.index);
    sweep(self.tape, self.index)
  }

  /// The order in which the sweep visits nodes: `self` first, leaves last;
  /// every node precedes all of its operands.
  pub fn sweep_order(&self) -> Result<Vec<Var<'t>>> {
    self.check_live();
    let order = {
      let nodes = self.tape.nodes.borrow();
      topological_order(&nodes, self.index)?
    };
    Ok(
      order
        .into_iter()
        .rev()
        .map(|index| self.tape.handle(index))
        .collect(),
    )
  }
}
