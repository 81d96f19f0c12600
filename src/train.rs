//!
//! # train
//!
//! Plain gradient descent over an `Mlp` with a single output: squared-error
//! loss, one full-batch step per epoch, each epoch in its own tape frame.
//!

use log::{debug, info};

use crate::error::{Error, Result};
use crate::nn::{Mlp, Module, Output};
use crate::tape::{Guard, Locked, Var};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
  pub epochs: usize,
  pub learning_rate: f64,
}

impl Default for FitConfig {
  fn default() -> Self {
    Self {
      epochs: 100,
      learning_rate: 0.025,
    }
  }
}

impl FitConfig {
  pub fn validate(&self) -> Result<()> {
    if self.epochs == 0 {
      return Err(Error::InvalidConfig("epochs must be > 0".to_owned()));
    }
    if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
      return Err(Error::InvalidConfig(
        "learning_rate must be finite and > 0".to_owned(),
      ));
    }
    Ok(())
  }
}

/// `sum((prediction - target)^2)` as a node on the predictions' tape.
pub fn sum_squared_error<'t>(predictions: &[Var<'t>], targets: &[f64]) -> Result<Var<'t>> {
  if predictions.len() != targets.len() {
    return Err(Error::WidthMismatch {
      expected: predictions.len(),
      actual: targets.len(),
    });
  }
  let mut terms = predictions
    .iter()
    .zip(targets)
    .map(|(&prediction, &target)| (prediction - target).powf(2.0));
  let first = terms
    .next()
    .ok_or_else(|| Error::InvalidConfig("loss over an empty batch".to_owned()))?;
  Ok(terms.fold(first, |acc, term| acc + term))
}

/// Move every parameter against its gradient: `p -= learning_rate * grad`.
pub fn sgd_step(parameters: &[Var<'_>], learning_rate: f64) -> Result<()> {
  for p in parameters {
    p.set_value(p.value() - learning_rate * p.grad())?;
  }
  Ok(())
}

/// Train `mlp` on `(xs, ys)` and return the loss of every epoch, measured
/// before that epoch's update.
///
/// `guard` must be the locked guard of the scope the parameters live in; every
/// epoch opens a nested scope on it, so the tape holds only the parameters
/// between epochs.
pub fn fit<'t>(
  mlp: &Mlp<'t>,
  guard: &mut Guard<'t, Locked>,
  xs: &[Vec<f64>],
  ys: &[f64],
  config: &FitConfig,
) -> Result<Vec<f64>> {
  config.validate()?;
  if xs.is_empty() {
    return Err(Error::InvalidConfig(
      "training set must not be empty".to_owned(),
    ));
  }
  if xs.len() != ys.len() {
    return Err(Error::WidthMismatch {
      expected: xs.len(),
      actual: ys.len(),
    });
  }
  if let Some(x) = xs.iter().find(|x| x.len() != mlp.nin()) {
    return Err(Error::WidthMismatch {
      expected: mlp.nin(),
      actual: x.len(),
    });
  }
  if let Some(last) = mlp.layers().last() {
    if last.nout() != 1 {
      return Err(Error::WidthMismatch {
        expected: 1,
        actual: last.nout(),
      });
    }
  }

  let parameters = mlp.parameters();
  info!(
    "fitting {} parameters on {} samples for {} epochs (lr={})",
    parameters.len(),
    xs.len(),
    config.epochs,
    config.learning_rate
  );

  let mut history = Vec::with_capacity(config.epochs);
  for epoch in 0..config.epochs {
    let loss = guard.scope(|_step| -> Result<f64> {
      let predictions = xs
        .iter()
        .map(|x| match mlp.forward(x)? {
          Output::Scalar(prediction) => Ok(prediction),
          Output::Vector(outputs) => Err(Error::WidthMismatch {
            expected: 1,
            actual: outputs.len(),
          }),
        })
        .collect::<Result<Vec<_>>>()?;
      let loss = sum_squared_error(&predictions, ys)?;

      mlp.zero_grad();
      loss.backward()?;
      sgd_step(&parameters, config.learning_rate)?;

      Ok(loss.value())
    })?;
    debug!("epoch {epoch}: loss={loss}");
    history.push(loss);
  }

  if let Some(last) = history.last() {
    info!("final loss {last}");
  }
  Ok(history)
}
