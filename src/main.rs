use rand::rngs::StdRng;
use rand::SeedableRng;

use scalar_tape::{fit, FitConfig, Mlp, MlpConfig, Module, Result, Tape};

const SEED: u64 = 42;

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let xs = vec![
    vec![2.0, 3.0, -1.0],
    vec![3.0, -1.0, 0.5],
    vec![0.5, 1.0, 1.0],
    vec![1.0, 1.0, -1.0],
  ];
  // desired targets
  let ys = vec![1.0, -1.0, -1.0, 1.0];

  let mut tape = Tape::new();
  tape.scope(|guard| -> Result<()> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mlp = Mlp::new(&guard, 3, &[4, 4, 1], &MlpConfig::default(), &mut rng)?;
    println!("{mlp}");
    println!("{} parameters", mlp.parameters().len());

    let mut guard = guard.lock();
    let history = fit(&mlp, &mut guard, &xs, &ys, &FitConfig::default())?;
    for (epoch, loss) in history.iter().enumerate() {
      println!("{epoch} {loss}");
    }

    for (x, y) in xs.iter().zip(&ys) {
      let prediction = guard.scope(|_| -> Result<f64> {
        Ok(mlp.forward(x)?.scalar().map_or(f64::NAN, |y| y.value()))
      })?;
      println!("{x:?} -> {prediction:.4} (target {y})");
    }
    Ok(())
  })
}
