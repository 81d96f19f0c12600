//!
//! # nn
//!
//! Fixed feed-forward topologies built purely out of tape nodes: a `Neuron`
//! holds weight and bias leaves, a `Layer` maps one input vector through every
//! neuron, an `Mlp` chains layers of matching widths.
//!
//! Parameters are leaves of the scope the network was built in; lock that
//! guard and run each training step in a nested scope so only the step's
//! intermediate nodes are released.
//!

use std::fmt;

use log::debug;
use rand::Rng;

use crate::error::{Error, Result};
use crate::tape::{Guard, Unlocked, Var};

/// Nonlinearity applied to a neuron's pre-activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
  Identity,
  Relu,
  LeakyRelu,
  Elu(f64),
  Tanh,
  Sigmoid,
}

impl Activation {
  #[inline]
  pub fn apply<'t>(self, x: Var<'t>) -> Result<Var<'t>> {
    Ok(match self {
      Activation::Identity => x,
      Activation::Relu => x.relu(),
      Activation::LeakyRelu => x.leaky_relu(),
      Activation::Elu(alpha) => x.checked_elu(alpha)?,
      Activation::Tanh => x.tanh(),
      Activation::Sigmoid => x.sigmoid(),
    })
  }

  fn validate(&self) -> Result<()> {
    match *self {
      Activation::Elu(alpha) if !alpha.is_finite() => Err(Error::InvalidArgument {
        op: "elu",
        value: alpha,
      }),
      _ => Ok(()),
    }
  }
}

/// Shape-independent settings of an [`Mlp`].
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
  /// Activation of every hidden layer
  pub activation: Activation,
  /// Leave the last layer linear
  pub linear_output: bool,
  /// Closed range weights and biases are drawn from
  pub init_range: (f64, f64),
}

impl Default for MlpConfig {
  fn default() -> Self {
    Self {
      activation: Activation::Relu,
      linear_output: true,
      init_range: (-1.0, 1.0),
    }
  }
}

impl MlpConfig {
  pub fn validate(&self) -> Result<()> {
    self.activation.validate()?;
    check_init_range(self.init_range)
  }
}

fn check_init_range((low, high): (f64, f64)) -> Result<()> {
  if !(low.is_finite() && high.is_finite() && low < high) {
    return Err(Error::InvalidConfig(format!(
      "init_range must be a finite, non-empty range, got ({low}, {high})"
    )));
  }
  Ok(())
}

/// Anything holding trainable leaves.
pub trait Module<'t> {
  /// Every trainable leaf, in a stable order.
  fn parameters(&self) -> Vec<Var<'t>>;

  fn zero_grad(&self) {
    for p in self.parameters() {
      p.zero_grad();
    }
  }
}

/// What a layer produces; single-unit layers yield a bare scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Output<'t> {
  Scalar(Var<'t>),
  Vector(Vec<Var<'t>>),
}

impl<'t> Output<'t> {
  pub fn scalar(self) -> Option<Var<'t>> {
    match self {
      Output::Scalar(var) => Some(var),
      Output::Vector(_) => None,
    }
  }

  pub fn into_vec(self) -> Vec<Var<'t>> {
    match self {
      Output::Scalar(var) => vec![var],
      Output::Vector(vars) => vars,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      Output::Scalar(_) => 1,
      Output::Vector(vars) => vars.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[inline]
fn check_width(expected: usize, actual: usize) -> Result<()> {
  if expected != actual {
    return Err(Error::WidthMismatch { expected, actual });
  }
  Ok(())
}

/// One unit: `activation(bias + sum(w_i * x_i))`.
pub struct Neuron<'t> {
  weights: Vec<Var<'t>>,
  bias: Var<'t>,
  activation: Activation,
}

impl<'t> Neuron<'t> {
  /// Weights then bias, each drawn uniformly from `init_range`.
  pub fn new<R: Rng + ?Sized>(
    guard: &Guard<'t, Unlocked>,
    nin: usize,
    activation: Activation,
    init_range: (f64, f64),
    rng: &mut R,
  ) -> Result<Self> {
    activation.validate()?;
    check_init_range(init_range)?;
    let (low, high) = init_range;
    let weights = (0..nin)
      .map(|_| guard.var(rng.gen_range(low..=high)))
      .collect();
    let bias = guard.var(rng.gen_range(low..=high));
    Ok(Self {
      weights,
      bias,
      activation,
    })
  }

  /// A neuron with fixed parameter values.
  pub fn from_values(
    guard: &Guard<'t, Unlocked>,
    weights: &[f64],
    bias: f64,
    activation: Activation,
  ) -> Self {
    Self {
      weights: weights.iter().map(|&w| guard.var(w)).collect(),
      bias: guard.var(bias),
      activation,
    }
  }

  pub fn nin(&self) -> usize {
    self.weights.len()
  }

  pub fn weights(&self) -> &[Var<'t>] {
    &self.weights
  }

  pub fn bias(&self) -> Var<'t> {
    self.bias
  }

  pub fn activation(&self) -> Activation {
    self.activation
  }

  pub fn forward(&self, inputs: &[Var<'t>]) -> Result<Var<'t>> {
    check_width(self.nin(), inputs.len())?;
    let pre = self
      .weights
      .iter()
      .zip(inputs)
      .fold(self.bias, |acc, (&w, &x)| acc + w * x);
    self.activation.apply(pre)
  }
}

impl<'t> Module<'t> for Neuron<'t> {
  fn parameters(&self) -> Vec<Var<'t>> {
    let mut params = self.weights.clone();
    params.push(self.bias);
    params
  }
}

impl fmt::Display for Neuron<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Neuron({:?}, nin={})", self.activation, self.nin())
  }
}

/// Fully connected layer; every neuron sees the same inputs.
pub struct Layer<'t> {
  neurons: Vec<Neuron<'t>>,
}

impl<'t> Layer<'t> {
  pub fn new<R: Rng + ?Sized>(
    guard: &Guard<'t, Unlocked>,
    nin: usize,
    nout: usize,
    activation: Activation,
    init_range: (f64, f64),
    rng: &mut R,
  ) -> Result<Self> {
    if nout == 0 {
      return Err(Error::InvalidConfig(
        "layer must have at least one neuron".to_owned(),
      ));
    }
    let neurons = (0..nout)
      .map(|_| Neuron::new(guard, nin, activation, init_range, rng))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { neurons })
  }

  /// Assemble a layer from existing neurons, which must share one input width.
  pub fn from_neurons(neurons: Vec<Neuron<'t>>) -> Result<Self> {
    let first = neurons
      .first()
      .ok_or_else(|| Error::InvalidConfig("layer must have at least one neuron".to_owned()))?;
    let nin = first.nin();
    for neuron in &neurons {
      check_width(nin, neuron.nin())?;
    }
    Ok(Self { neurons })
  }

  pub fn nin(&self) -> usize {
    self.neurons.first().map_or(0, Neuron::nin)
  }

  pub fn nout(&self) -> usize {
    self.neurons.len()
  }

  pub fn neurons(&self) -> &[Neuron<'t>] {
    &self.neurons
  }

  pub fn forward(&self, inputs: &[Var<'t>]) -> Result<Output<'t>> {
    check_width(self.nin(), inputs.len())?;
    let mut outputs = self
      .neurons
      .iter()
      .map(|neuron| neuron.forward(inputs))
      .collect::<Result<Vec<_>>>()?;
    if outputs.len() == 1 {
      if let Some(output) = outputs.pop() {
        return Ok(Output::Scalar(output));
      }
    }
    Ok(Output::Vector(outputs))
  }
}

impl<'t> Module<'t> for Layer<'t> {
  fn parameters(&self) -> Vec<Var<'t>> {
    self
      .neurons
      .iter()
      .flat_map(|neuron| neuron.parameters())
      .collect()
  }
}

impl fmt::Display for Layer<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Layer({} -> {}", self.nin(), self.nout())?;
    if let Some(neuron) = self.neurons.first() {
      write!(f, ", {:?}", neuron.activation())?;
    }
    f.write_str(")")
  }
}

/// Multilayer perceptron.
///
/// ```rust
/// use rand::{rngs::StdRng, SeedableRng};
/// use scalar_tape::{Mlp, MlpConfig, Module, Tape};
///
/// let mut tape = Tape::new();
/// tape.scope(|guard| {
///   let mut rng = StdRng::seed_from_u64(0);
///   let mlp = Mlp::new(&guard, 3, &[4, 4, 1], &MlpConfig::default(), &mut rng).unwrap();
///   assert_eq!(mlp.parameters().len(), 41);
///   let y = mlp.forward(&[2.0, 3.0, -1.0]).unwrap().scalar().unwrap();
///   assert!(y.value().is_finite());
/// });
/// ```
pub struct Mlp<'t> {
  layers: Vec<Layer<'t>>,
}

impl<'t> Mlp<'t> {
  /// Layers of widths `nouts`, fed by `nin` inputs, parameters drawn from `rng`.
  pub fn new<R: Rng + ?Sized>(
    guard: &Guard<'t, Unlocked>,
    nin: usize,
    nouts: &[usize],
    config: &MlpConfig,
    rng: &mut R,
  ) -> Result<Self> {
    config.validate()?;
    if nin == 0 {
      return Err(Error::InvalidConfig("nin must be > 0".to_owned()));
    }
    if nouts.is_empty() {
      return Err(Error::InvalidConfig(
        "mlp must have at least one layer".to_owned(),
      ));
    }
    if nouts.contains(&0) {
      return Err(Error::InvalidConfig(
        "all layer sizes must be > 0".to_owned(),
      ));
    }

    let mut layers = Vec::with_capacity(nouts.len());
    let mut width = nin;
    for (i, &nout) in nouts.iter().enumerate() {
      let last = i + 1 == nouts.len();
      let activation = if last && config.linear_output {
        Activation::Identity
      } else {
        config.activation
      };
      layers.push(Layer::new(
        guard,
        width,
        nout,
        activation,
        config.init_range,
        rng,
      )?);
      width = nout;
    }

    let mlp = Self { layers };
    debug!(
      "built mlp nin={} sizes={:?} parameters={}",
      nin,
      nouts,
      mlp.parameters().len()
    );
    Ok(mlp)
  }

  /// Chain existing layers; each layer's input width must match the previous
  /// layer's unit count.
  pub fn from_layers(layers: Vec<Layer<'t>>) -> Result<Self> {
    if layers.is_empty() {
      return Err(Error::InvalidConfig(
        "mlp must have at least one layer".to_owned(),
      ));
    }
    for pair in layers.windows(2) {
      check_width(pair[0].nout(), pair[1].nin())?;
    }
    Ok(Self { layers })
  }

  pub fn nin(&self) -> usize {
    self.layers.first().map_or(0, Layer::nin)
  }

  pub fn layers(&self) -> &[Layer<'t>] {
    &self.layers
  }

  /// Evaluate on plain numbers; each input is promoted to a constant leaf.
  pub fn forward(&self, inputs: &[f64]) -> Result<Output<'t>> {
    check_width(self.nin(), inputs.len())?;
    let anchor = self.anchor()?;
    let inputs: Vec<Var<'t>> = inputs.iter().map(|&x| anchor.lift(x)).collect();
    self.forward_vars(&inputs)
  }

  /// Evaluate on nodes already on the tape.
  pub fn forward_vars(&self, inputs: &[Var<'t>]) -> Result<Output<'t>> {
    let (last, hidden) = self
      .layers
      .split_last()
      .ok_or_else(|| Error::InvalidConfig("mlp has no layers".to_owned()))?;
    let mut activations = inputs.to_vec();
    for layer in hidden {
      activations = layer.forward(&activations)?.into_vec();
    }
    last.forward(&activations)
  }

  /// Any parameter, used to reach the tape when promoting literals.
  fn anchor(&self) -> Result<Var<'t>> {
    self
      .layers
      .first()
      .and_then(|layer| layer.neurons.first())
      .map(Neuron::bias)
      .ok_or_else(|| Error::InvalidConfig("mlp has no layers".to_owned()))
  }
}

impl<'t> Module<'t> for Mlp<'t> {
  fn parameters(&self) -> Vec<Var<'t>> {
    self
      .layers
      .iter()
      .flat_map(|layer| layer.parameters())
      .collect()
  }
}

impl fmt::Display for Mlp<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("MLP of [")?;
    for (i, layer) in self.layers.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{layer}")?;
    }
    f.write_str("]")
  }
}
