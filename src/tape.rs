//!
//! # tape
//!
//! The arena every node lives in. A `Tape` is a 'tiered' Wengert list: one flat
//! vector of nodes, partitioned into frames, with each frame belonging to a
//! guarded scope. Leaving a scope truncates the vector back to where the frame
//! began, so a whole forward/backward/update cycle is released in one go.
//!
//! ## Invariants
//!
//! 1. Operand indices are always strictly smaller than the index of the node
//!    that uses them (nodes are appended after their operands)
//! 2. Only the innermost frame ever grows; a locked guard cannot create leaves
//! 3. Serial stamps are never reused, so a handle whose frame was released can
//!    never alias a newer node
//!

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use log::trace;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::ops::Op;

pub(crate) type NodeIndex = usize;

/// Operands of a node, inline for every operation we support...
pub(crate) type Operands = SmallVec<[NodeIndex; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
  pub(crate) value: f64,
  pub(crate) grad: f64,
  pub(crate) op: Op,
  pub(crate) operands: Operands,
  serial: u64,
}

impl Node {
  #[inline]
  pub(crate) fn is_leaf(&self) -> bool {
    self.operands.is_empty()
  }
}

/// Arena holding the computation graph.
///
/// The tape is `!Sync`; everything built on it stays on one thread.
#[derive(Debug, Default)]
pub struct Tape {
  pub(crate) nodes: RefCell<Vec<Node>>,
  serial: Cell<u64>,
}

impl Tape {
  pub fn new() -> Self {
    Self::default()
  }

  /// Open the outermost scope of this tape.
  ///
  /// Every node created inside `f` is released when `f` returns; the closure is
  /// higher-ranked over the scope lifetime so no `Var` can escape it.
  pub fn scope<G, R>(&mut self, f: G) -> R
  where
    G: for<'inner> FnOnce(Guard<'inner, Unlocked>) -> R,
  {
    let tape: &Tape = self;
    tape.with_scope(0, f)
  }

  /// Number of live nodes across all frames.
  pub fn len(&self) -> usize {
    self.nodes.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn with_scope<G, R>(&self, level: u8, f: G) -> R
  where
    G: for<'inner> FnOnce(Guard<'inner, Unlocked>) -> R,
  {
    let _frame = FrameGuard::new(self, level);
    f(Guard {
      level,
      tape: self,
      phantom: PhantomData,
    })
  }

  /// Append a node; its operands must already be on the tape.
  #[inline]
  pub(crate) fn push(&self, value: f64, op: Op, operands: Operands) -> Var<'_> {
    let serial = self.serial.get();
    self.serial.set(serial + 1);
    let mut nodes = self.nodes.borrow_mut();
    let index = nodes.len();
    debug_assert!(operands.iter().all(|&operand| operand < index));
    nodes.push(Node {
      value,
      grad: 0.0,
      op,
      operands,
      serial,
    });
    Var {
      index,
      serial,
      tape: self,
    }
  }

  /// Re-materialise the handle of a live node.
  #[inline]
  pub(crate) fn handle(&self, index: NodeIndex) -> Var<'_> {
    let serial = self.nodes.borrow()[index].serial;
    Var {
      index,
      serial,
      tape: self,
    }
  }
}

/// Releases a frame when its scope exits, unwinding included.
struct FrameGuard<'tape> {
  tape: &'tape Tape,
  mark: usize,
  level: u8,
}

impl<'tape> FrameGuard<'tape> {
  fn new(tape: &'tape Tape, level: u8) -> Self {
    let mark = tape.nodes.borrow().len();
    trace!("opening frame level={level} mark={mark}");
    Self { tape, mark, level }
  }
}

impl Drop for FrameGuard<'_> {
  fn drop(&mut self) {
    let mut nodes = self.tape.nodes.borrow_mut();
    trace!(
      "releasing frame level={} nodes={}",
      self.level,
      nodes.len() - self.mark
    );
    nodes.truncate(self.mark);
  }
}

/// Phantom type for a locked guard; a locked guard cannot create leaves, it
/// can only spawn subscopes
pub struct Locked;

/// Phantom type for an unlocked guard, something we CAN create leaves on...
pub struct Unlocked;

/// An unlocked `Guard` creates leaves in its scope; once locked it can only
/// open nested scopes, whose nodes are released on exit while the leaves of
/// this scope (the parameters, usually) survive.
pub struct Guard<'scope, S = Unlocked> {
  level: u8,
  tape: &'scope Tape,
  phantom: PhantomData<S>,
}

impl<'scope, S> Guard<'scope, S> {
  /// Nesting depth of this scope, 0 for the outermost one.
  pub fn level(&self) -> u8 {
    self.level
  }
}

impl<'scope> Guard<'scope, Unlocked> {
  /// Construct a new leaf of a specific value, gradient 0, no operands.
  #[inline]
  pub fn var(&self, value: f64) -> Var<'scope> {
    self.tape.push(value, Op::Leaf, Operands::new())
  }

  /// Lock a guard...
  ///
  /// Consume an unlocked guard and produce a locked guard with same lifetimes
  #[inline]
  pub fn lock(self) -> Guard<'scope, Locked> {
    Guard {
      level: self.level,
      tape: self.tape,
      phantom: PhantomData,
    }
  }
}

impl<'scope> Guard<'scope, Locked> {
  /// Open a nested scope; one forward/backward/update cycle typically lives
  /// in here.
  pub fn scope<G, R>(&mut self, f: G) -> R
  where
    G: for<'inner> FnOnce(Guard<'inner, Unlocked>) -> R,
  {
    assert!(self.level < u8::MAX, "scope nesting too deep");
    self.tape.with_scope(self.level + 1, f)
  }
}

/// Handle to one scalar node on a tape.
///
/// Handles are `Copy`; identity is the arena slot, never the value, so two
/// handles compare equal only when they name the same node.
#[derive(Clone, Copy)]
pub struct Var<'t> {
  pub(crate) index: NodeIndex,
  serial: u64,
  pub(crate) tape: &'t Tape,
}

impl<'t> Var<'t> {
  /// Run `f` over the node behind this handle.
  ///
  /// Panics if the node was released together with its frame.
  #[inline]
  #[track_caller]
  pub(crate) fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> R {
    let nodes = self.tape.nodes.borrow();
    match nodes.get(self.index) {
      Some(node) if node.serial == self.serial => f(node),
      _ => panic!(
        "stale Var: node {} was released with its scope",
        self.index
      ),
    }
  }

  #[inline]
  #[track_caller]
  fn with_node_mut<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
    let mut nodes = self.tape.nodes.borrow_mut();
    match nodes.get_mut(self.index) {
      Some(node) if node.serial == self.serial => f(node),
      _ => panic!(
        "stale Var: node {} was released with its scope",
        self.index
      ),
    }
  }

  #[inline]
  pub fn value(&self) -> f64 {
    self.with_node(|node| node.value)
  }

  #[inline]
  pub fn grad(&self) -> f64 {
    self.with_node(|node| node.grad)
  }

  /// The operation that produced this node, `Op::Leaf` for leaves.
  pub fn op(&self) -> Op {
    self.with_node(|node| node.op)
  }

  /// The nodes this one was derived from, in operand order.
  pub fn operands(&self) -> SmallVec<[Var<'t>; 2]> {
    let operands = self.with_node(|node| node.operands.clone());
    operands
      .into_iter()
      .map(|index| self.tape.handle(index))
      .collect()
  }

  pub fn is_leaf(&self) -> bool {
    self.with_node(Node::is_leaf)
  }

  /// Overwrite the value of a leaf, the parameter update of a training step.
  ///
  /// Interior nodes are refused: their value is a function of their operands.
  pub fn set_value(&self, value: f64) -> Result<()> {
    self.with_node_mut(|node| {
      if !node.is_leaf() {
        return Err(Error::NotALeaf);
      }
      node.value = value;
      Ok(())
    })
  }

  pub fn set_grad(&self, grad: f64) {
    self.with_node_mut(|node| node.grad = grad);
  }

  pub fn zero_grad(&self) {
    self.set_grad(0.0);
  }

  /// Panics if the node behind this handle was released with its frame.
  #[inline]
  #[track_caller]
  pub(crate) fn check_live(&self) {
    self.with_node(|_| ())
  }

  /// Promote a literal to a constant leaf on the same tape as `self`.
  #[inline]
  pub(crate) fn lift(&self, value: f64) -> Var<'t> {
    self.tape.push(value, Op::Leaf, Operands::new())
  }

  #[inline]
  pub(crate) fn same_tape(&self, other: &Var<'_>) -> bool {
    std::ptr::eq(self.tape, other.tape)
  }
}

impl PartialEq for Var<'_> {
  fn eq(&self, other: &Self) -> bool {
    self.same_tape(other) && self.index == other.index && self.serial == other.serial
  }
}

impl Eq for Var<'_> {}

impl Hash for Var<'_> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (self.tape as *const Tape).hash(state);
    self.index.hash(state);
    self.serial.hash(state);
  }
}

impl fmt::Debug for Var<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.with_node(|node| {
      f.debug_struct("Var")
        .field("value", &node.value)
        .field("grad", &node.grad)
        .field("op", &node.op)
        .field("index", &self.index)
        .finish()
    })
  }
}

impl fmt::Display for Var<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (value, grad) = self.with_node(|node| (node.value, node.grad));
    write!(f, "Var(value={value}, grad={grad})")
  }
}
