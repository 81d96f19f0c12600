//!
//! # scalar-tape
//!
//! ## Core API
//!
//! Reverse-mode automatic differentiation over plain `f64` scalars. Writing an
//! expression with [`Var`] handles records it on a [`Tape`]; calling
//! [`Var::backward`] on the result fills in the gradient of every node the
//! result depends on.
//!
//! The main entry point is [`Tape::scope`]. Leaves are created through the
//! scope's [`Guard`]; locking it lets long-lived parameters stay put while each
//! forward/backward/update cycle runs in a nested scope that is released as a
//! whole when it exits.
//!
//! ```rust
//! use scalar_tape::Tape;
//!
//! let mut tape = Tape::new();
//! tape.scope(|guard| {
//!   let a = guard.var(2.0);
//!   let b = guard.var(-3.0);
//!   let c = guard.var(10.0);
//!   let l = (a * b + c) * -2.0;
//!   l.backward().unwrap();
//!   assert_eq!(l.value(), -8.0);
//!   assert_eq!((a.grad(), b.grad(), c.grad()), (6.0, -4.0, -2.0));
//! });
//! ```
//!
//! ## Networks
//!
//! [`nn`] builds neurons, layers and multilayer perceptrons out of tape
//! nodes, [`train`] fits them with plain gradient descent and [`render`] dumps
//! a graph as Graphviz DOT.
//!

mod backward;
mod error;
mod ops;
mod tape;

pub mod nn;
pub mod render;
pub mod train;

pub use error::{Error, Result};
pub use nn::{Activation, Layer, Mlp, MlpConfig, Module, Neuron, Output};
pub use ops::{Op, DEFAULT_ELU_ALPHA, LEAKY_RELU_SLOPE};
pub use tape::{Guard, Locked, Tape, Unlocked, Var};
pub use train::{fit, FitConfig};
