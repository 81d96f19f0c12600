//!
//! # ops
//!
//! The scalar operation set. Each operation is one `Op` variant carrying the
//! constant it needs (exponent, slope); the forward value is computed when the
//! node is created and the local derivative is dispatched on the tag during the
//! reverse sweep, so nodes never store closures.
//!
//! Negation, subtraction and division have no rule of their own: they are
//! composed from `mul`, `add` and `powf`.
//!

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use smallvec::{smallvec, SmallVec};

use crate::error::{Error, Result};
use crate::tape::Var;

/// Slope of `leaky_relu` on the negative side.
pub const LEAKY_RELU_SLOPE: f64 = 0.01;

/// Default `alpha` of `elu`.
pub const DEFAULT_ELU_ALPHA: f64 = 0.02;

/// Operation tag stored on every node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
  /// Input, parameter or promoted literal
  Leaf,
  Add,
  Mul,
  /// Power with a constant, non-differentiable exponent
  Powf(f64),
  Exp,
  Tanh,
  Sigmoid,
  Relu,
  LeakyRelu,
  Elu(f64),
}

impl Op {
  /// Forward value given operand values.
  #[inline]
  pub(crate) fn forward(&self, inputs: &[f64]) -> f64 {
    match *self {
      Op::Leaf => unreachable!("leaves have no forward rule"),
      Op::Add => inputs[0] + inputs[1],
      Op::Mul => inputs[0] * inputs[1],
      Op::Powf(k) => inputs[0].powf(k),
      Op::Exp => inputs[0].exp(),
      Op::Tanh => inputs[0].tanh(),
      Op::Sigmoid => 1.0 / (1.0 + (-inputs[0]).exp()),
      Op::Relu => {
        let a = inputs[0];
        if a > 0.0 {
          a
        } else {
          0.0
        }
      }
      Op::LeakyRelu => {
        let a = inputs[0];
        if a > 0.0 {
          a
        } else {
          LEAKY_RELU_SLOPE * a
        }
      }
      Op::Elu(alpha) => {
        let a = inputs[0];
        if a > 0.0 {
          a
        } else {
          alpha * (a.exp() - 1.0)
        }
      }
    }
  }

  /// Contributions to each operand's gradient, in operand order.
  ///
  /// `output` is the node's own forward value and `upstream` its accumulated
  /// gradient. At the kink of relu/leaky_relu/elu (`a == 0`, either sign) the
  /// non-positive branch is taken.
  #[inline]
  pub(crate) fn pullback(&self, inputs: &[f64], output: f64, upstream: f64) -> SmallVec<[f64; 2]> {
    match *self {
      Op::Leaf => SmallVec::new(),
      Op::Add => smallvec![upstream, upstream],
      Op::Mul => smallvec![inputs[1] * upstream, inputs[0] * upstream],
      Op::Powf(k) => smallvec![k * inputs[0].powf(k - 1.0) * upstream],
      Op::Exp => smallvec![output * upstream],
      Op::Tanh => smallvec![(1.0 - output * output) * upstream],
      Op::Sigmoid => smallvec![output * (1.0 - output) * upstream],
      Op::Relu => {
        if inputs[0] > 0.0 {
          smallvec![upstream]
        } else {
          smallvec![0.0]
        }
      }
      Op::LeakyRelu => {
        if inputs[0] > 0.0 {
          smallvec![upstream]
        } else {
          smallvec![LEAKY_RELU_SLOPE * upstream]
        }
      }
      Op::Elu(alpha) => {
        let a = inputs[0];
        if a > 0.0 {
          smallvec![upstream]
        } else {
          smallvec![alpha * a.exp() * upstream]
        }
      }
    }
  }
}

/// Symbol used when rendering the graph.
impl fmt::Display for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Op::Leaf => Ok(()),
      Op::Add => f.write_str("+"),
      Op::Mul => f.write_str("*"),
      Op::Powf(k) => write!(f, "**{k}"),
      Op::Exp => f.write_str("exp"),
      Op::Tanh => f.write_str("tanh"),
      Op::Sigmoid => f.write_str("sigmoid"),
      Op::Relu => f.write_str("relu"),
      Op::LeakyRelu => f.write_str("leaky_relu"),
      Op::Elu(_) => f.write_str("elu"),
    }
  }
}

/// Unwrap the result of a checked op for the infallible/operator forms.
#[inline]
#[track_caller]
fn or_panic(result: Result<Var<'_>>) -> Var<'_> {
  match result {
    Ok(var) => var,
    Err(err) => panic!("{err}"),
  }
}

impl<'t> Var<'t> {
  #[inline]
  fn unary(self, op: Op) -> Var<'t> {
    let value = op.forward(&[self.value()]);
    self.tape.push(value, op, smallvec![self.index])
  }

  #[inline]
  fn ensure_same_tape(self, other: Var<'t>) -> Result<()> {
    if !self.same_tape(&other) {
      return Err(Error::ForeignVar);
    }
    Ok(())
  }

  #[inline]
  fn binary(self, other: Var<'t>, op: Op) -> Result<Var<'t>> {
    self.ensure_same_tape(other)?;
    let value = op.forward(&[self.value(), other.value()]);
    Ok(self.tape.push(value, op, smallvec![self.index, other.index]))
  }

  pub fn checked_add(self, other: Var<'t>) -> Result<Var<'t>> {
    self.binary(other, Op::Add)
  }

  pub fn checked_mul(self, other: Var<'t>) -> Result<Var<'t>> {
    self.binary(other, Op::Mul)
  }

  pub fn checked_sub(self, other: Var<'t>) -> Result<Var<'t>> {
    self.ensure_same_tape(other)?;
    self.checked_add(other.neg())
  }

  pub fn checked_div(self, other: Var<'t>) -> Result<Var<'t>> {
    self.ensure_same_tape(other)?;
    self.checked_mul(other.powf(-1.0))
  }

  /// `self ** exp`; the exponent must be a finite constant.
  pub fn checked_powf(self, exp: f64) -> Result<Var<'t>> {
    if !exp.is_finite() {
      return Err(Error::InvalidArgument {
        op: "powf",
        value: exp,
      });
    }
    Ok(self.unary(Op::Powf(exp)))
  }

  pub fn checked_elu(self, alpha: f64) -> Result<Var<'t>> {
    if !alpha.is_finite() {
      return Err(Error::InvalidArgument {
        op: "elu",
        value: alpha,
      });
    }
    Ok(self.unary(Op::Elu(alpha)))
  }

  #[track_caller]
  pub fn add(self, other: Var<'t>) -> Var<'t> {
    or_panic(self.checked_add(other))
  }

  pub fn add_f64(self, other: f64) -> Var<'t> {
    self.add(self.lift(other))
  }

  #[track_caller]
  pub fn sub(self, other: Var<'t>) -> Var<'t> {
    or_panic(self.checked_sub(other))
  }

  pub fn sub_f64(self, other: f64) -> Var<'t> {
    self.sub(self.lift(other))
  }

  #[track_caller]
  pub fn mul(self, other: Var<'t>) -> Var<'t> {
    or_panic(self.checked_mul(other))
  }

  pub fn mul_f64(self, other: f64) -> Var<'t> {
    self.mul(self.lift(other))
  }

  #[track_caller]
  pub fn div(self, other: Var<'t>) -> Var<'t> {
    or_panic(self.checked_div(other))
  }

  /// Division by a literal multiplies by its (constant) reciprocal.
  pub fn div_f64(self, other: f64) -> Var<'t> {
    self.mul_f64(other.powi(-1))
  }

  pub fn neg(self) -> Var<'t> {
    self.mul_f64(-1.0)
  }

  #[track_caller]
  pub fn powf(self, exp: f64) -> Var<'t> {
    or_panic(self.checked_powf(exp))
  }

  pub fn exp(self) -> Var<'t> {
    self.unary(Op::Exp)
  }

  pub fn tanh(self) -> Var<'t> {
    self.unary(Op::Tanh)
  }

  pub fn sigmoid(self) -> Var<'t> {
    self.unary(Op::Sigmoid)
  }

  pub fn relu(self) -> Var<'t> {
    self.unary(Op::Relu)
  }

  pub fn leaky_relu(self) -> Var<'t> {
    self.unary(Op::LeakyRelu)
  }

  /// `elu` with [`DEFAULT_ELU_ALPHA`].
  pub fn elu(self) -> Var<'t> {
    self.unary(Op::Elu(DEFAULT_ELU_ALPHA))
  }

  #[track_caller]
  pub fn elu_with(self, alpha: f64) -> Var<'t> {
    or_panic(self.checked_elu(alpha))
  }
}

// Operator sugar: `Var <op> Var`, `Var <op> f64` and `f64 <op> Var`, where the
// literal side is promoted to a constant leaf first...
macro_rules! binary_operator {
  ($trait:ident, $method:ident, $var_op:ident, $lit_op:ident) => {
    impl<'t> $trait for Var<'t> {
      type Output = Var<'t>;

      #[inline(always)]
      #[track_caller]
      fn $method(self, other: Self) -> Self::Output {
        Var::$var_op(self, other)
      }
    }

    impl<'t> $trait<f64> for Var<'t> {
      type Output = Var<'t>;

      #[inline(always)]
      fn $method(self, other: f64) -> Self::Output {
        Var::$lit_op(self, other)
      }
    }

    impl<'t> $trait<Var<'t>> for f64 {
      type Output = Var<'t>;

      #[inline(always)]
      fn $method(self, other: Var<'t>) -> Self::Output {
        Var::$var_op(other.lift(self), other)
      }
    }
  };
}

binary_operator!(Add, add, add, add_f64);
binary_operator!(Sub, sub, sub, sub_f64);
binary_operator!(Mul, mul, mul, mul_f64);
binary_operator!(Div, div, div, div_f64);

impl<'t> Neg for Var<'t> {
  type Output = Var<'t>;

  #[inline(always)]
  fn neg(self) -> Self::Output {
    Var::neg(self)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::tape::Tape;

  /// Centered finite difference of `f` at `x`.
  fn numeric_grad(f: impl Fn(f64) -> f64, x: f64) -> f64 {
    let eps = 1e-4;
    (f(x + eps) - f(x - eps)) / (2.0 * eps)
  }

  /// Build `f` on a fresh tape at `x`, sweep, and compare the leaf gradient
  /// with the finite-difference estimate of the same expression.
  fn check_unary(x: f64, f: impl for<'t> Fn(Var<'t>) -> Var<'t>) {
    let mut tape = Tape::new();
    let eval = |x: f64| {
      let mut tape = Tape::new();
      tape.scope(|guard| f(guard.var(x)).value())
    };
    tape.scope(|guard| {
      let a = guard.var(x);
      let out = f(a);
      out.backward().unwrap();
      assert_abs_diff_eq!(a.grad(), numeric_grad(eval, x), epsilon = 1e-4);
    });
  }

  mod forward {
    use super::*;

    #[test]
    fn add() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(3.0);
        let b = guard.var(4.0);
        assert_eq!((a + b).value(), 7.0);
        assert_eq!((a + 5.0).value(), 8.0);
        assert_eq!((5.0 + a).value(), 8.0);
      });
    }

    #[test]
    fn sub() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(7.0);
        let b = guard.var(4.0);
        assert_eq!((a - b).value(), 3.0);
        assert_eq!((a - 3.0).value(), 4.0);
        assert_eq!((10.0 - a).value(), 3.0);
        assert_eq!((-a).value(), -7.0);
      });
    }

    #[test]
    fn mul_div() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(6.0);
        let b = guard.var(3.0);
        assert_eq!((a * b).value(), 18.0);
        assert_eq!((a / b).value(), 2.0);
        assert_eq!((a / 2.0).value(), 3.0);
        assert_eq!((3.0 / b).value(), 1.0);
        assert_eq!((2.0 * b).value(), 6.0);
      });
    }

    #[test]
    fn powf() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(2.0);
        assert_eq!(a.powf(3.0).value(), 8.0);
        assert_eq!(a.powf(-1.0).value(), 0.5);
      });
    }

    #[test]
    fn activations() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(-2.0);
        assert_eq!(a.relu().value(), 0.0);
        assert_eq!(a.leaky_relu().value(), -0.02);
        assert_abs_diff_eq!(a.elu().value(), 0.02 * ((-2.0f64).exp() - 1.0));
        assert_abs_diff_eq!(a.elu_with(1.0).value(), (-2.0f64).exp() - 1.0);
        assert_abs_diff_eq!(a.tanh().value(), (-2.0f64).tanh());
        assert_abs_diff_eq!(a.sigmoid().value(), 1.0 / (1.0 + 2.0f64.exp()));
        assert_abs_diff_eq!(a.exp().value(), (-2.0f64).exp());
        let b = guard.var(1.5);
        assert_eq!(b.relu().value(), 1.5);
        assert_eq!(b.leaky_relu().value(), 1.5);
        assert_eq!(b.elu().value(), 1.5);
      });
    }

    #[test]
    fn literal_promoted_to_leaf() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(2.0);
        let b = a + 1.0;
        let operands = b.operands();
        assert_eq!(operands[0], a);
        assert!(operands[1].is_leaf());
        assert_eq!(operands[1].value(), 1.0);
      });
    }

    #[test]
    fn numeric_domain_errors_propagate() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(-8.0);
        let root = a.powf(0.5);
        assert!(root.value().is_nan());
        let big = guard.var(1000.0).exp();
        assert!(big.value().is_infinite());
        let y = root * 2.0;
        y.backward().unwrap();
        assert!(a.grad().is_nan());
      });
    }
  }

  mod misuse {
    use super::*;

    #[test]
    fn non_finite_exponent() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(2.0);
        let before = a.tape.len();
        assert!(matches!(
          a.checked_powf(f64::NAN),
          Err(Error::InvalidArgument { op: "powf", .. })
        ));
        assert!(matches!(
          a.checked_powf(f64::INFINITY),
          Err(Error::InvalidArgument { op: "powf", .. })
        ));
        assert!(matches!(
          a.checked_elu(f64::NAN),
          Err(Error::InvalidArgument { op: "elu", .. })
        ));
        // nothing was allocated for the refused operations
        assert_eq!(a.tape.len(), before);
      });
    }

    #[test]
    fn foreign_tape() {
      let mut first = Tape::new();
      let mut second = Tape::new();
      first.scope(|g1| {
        second.scope(|g2| {
          let a = g1.var(1.0);
          let b = g2.var(2.0);
          assert_eq!(a.checked_add(b).err(), Some(Error::ForeignVar));
          assert_eq!(a.checked_mul(b).err(), Some(Error::ForeignVar));
          assert_eq!(a.checked_sub(b).err(), Some(Error::ForeignVar));
          assert_eq!(a.checked_div(b).err(), Some(Error::ForeignVar));
          assert_eq!(a.tape.len(), 1);
          assert_eq!(b.tape.len(), 1);
        });
      });
    }

    #[test]
    #[should_panic(expected = "different tapes")]
    fn foreign_tape_operator_panics() {
      let mut first = Tape::new();
      let mut second = Tape::new();
      first.scope(|g1| {
        second.scope(|g2| {
          let _ = g1.var(1.0) * g2.var(2.0);
        });
      });
    }
  }

  mod pullback {
    use super::*;

    #[test]
    fn add() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(3.0);
        let b = guard.var(4.0);
        let c = a + b;
        c.backward().unwrap();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
      });
    }

    #[test]
    fn mul() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(3.0);
        let b = guard.var(4.0);
        let c = a * b;
        c.backward().unwrap();
        // df/da = b, df/db = a
        assert_eq!(a.grad(), 4.0);
        assert_eq!(b.grad(), 3.0);
      });
    }

    #[test]
    fn sub() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(7.0);
        let b = guard.var(4.0);
        let c = a - b;
        c.backward().unwrap();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), -1.0);
      });
    }

    #[test]
    fn div() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(6.0);
        let b = guard.var(3.0);
        let c = a / b;
        c.backward().unwrap();
        // df/da = 1/b, df/db = -a/b^2
        assert_abs_diff_eq!(a.grad(), 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(b.grad(), -6.0 / 9.0, epsilon = 1e-12);
      });
    }

    #[test]
    fn powf() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(2.0);
        let c = a.powf(3.0);
        c.backward().unwrap();
        // df/da = 3 * a^2
        assert_eq!(a.grad(), 12.0);
      });
    }

    #[test]
    fn shared_operand_accumulates() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let x = guard.var(3.0);
        let y = x.mul(x);
        y.backward().unwrap();
        assert_eq!(x.grad(), 6.0);
      });
    }

    #[test]
    fn kink_at_zero() {
      let mut tape = Tape::new();
      tape.scope(|guard| {
        for zero in [0.0, -0.0] {
          let a = guard.var(zero);
          a.relu().backward().unwrap();
          assert_eq!(a.grad(), 0.0);

          let b = guard.var(zero);
          b.leaky_relu().backward().unwrap();
          assert_eq!(b.grad(), LEAKY_RELU_SLOPE);

          let c = guard.var(zero);
          c.elu().backward().unwrap();
          assert_eq!(c.grad(), DEFAULT_ELU_ALPHA);
        }
      });
    }
  }

  mod finite_difference {
    use super::*;

    #[test]
    fn elementary() {
      for x in [-1.7, -0.3, 0.4, 2.2] {
        check_unary(x, |a| a + a);
        check_unary(x, |a| a * 3.0);
        check_unary(x, |a| a * a * a);
        check_unary(x, |a| a.powf(2.0));
        check_unary(x, |a| a.exp());
        check_unary(x, |a| a.tanh());
        check_unary(x, |a| a.sigmoid());
        check_unary(x, |a| a.relu());
        check_unary(x, |a| a.leaky_relu());
        check_unary(x, |a| a.elu());
        check_unary(x, |a| a.elu_with(1.3));
        check_unary(x, |a| -a);
        check_unary(x, |a| 2.0 - a);
        check_unary(x, |a| 1.0 / (a * a + 1.0));
      }
    }

    #[test]
    fn fractional_power() {
      for x in [0.3, 1.0, 4.5] {
        check_unary(x, |a| a.powf(0.5));
        check_unary(x, |a| a.powf(-1.5));
      }
    }

    #[test]
    fn compositions() {
      for x in [-1.1, 0.25, 1.9] {
        check_unary(x, |a| (a * 2.0 + 1.0).tanh() * a.sigmoid());
        check_unary(x, |a| (a.exp() - a.powf(2.0)).leaky_relu());
        check_unary(x, |a| (a * a).relu() + a.elu().exp());
        check_unary(x, |a| {
          let shared = a.tanh();
          shared * shared + shared / (a.exp() + 1.0)
        });
      }
    }

    #[test]
    fn two_leaves() {
      let f = |a: f64, b: f64| (a * b + b.exp()).tanh() - a / b;
      let (x, y) = (0.7, -1.3);
      let mut tape = Tape::new();
      tape.scope(|guard| {
        let a = guard.var(x);
        let b = guard.var(y);
        let out = (a * b + b.exp()).tanh() - a / b;
        assert_abs_diff_eq!(out.value(), f(x, y), epsilon = 1e-12);
        out.backward().unwrap();
        assert_abs_diff_eq!(a.grad(), numeric_grad(|v| f(v, y), x), epsilon = 1e-4);
        assert_abs_diff_eq!(b.grad(), numeric_grad(|v| f(x, v), y), epsilon = 1e-4);
      });
    }
  }
}
