//! Muestreo Monte Carlo de un punto por semilla.
//!
//! Cada llamada crea su propio generador sembrado con la semilla, así que no
//! hay estado mutable compartido entre ejecuciones concurrentes.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::keys::TaskId;

/// Valor de `hit` cuando el punto cae dentro del círculo unitario.
/// Escalado para que la media de muchos `hit` converja a π.
pub const HIT: u8 = 4;
pub const MISS: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub x: f64,
    pub y: f64,
    pub hit: u8,
    pub seed: TaskId,
}

impl SampleResult {
    /// Valor que se persiste por semilla.
    pub fn value(&self) -> f64 {
        f64::from(self.hit)
    }
}

/// Trabajo de muestreo por semilla. Debe ser puro: misma semilla, mismo resultado.
pub trait Sampler: Send + Sync + 'static {
    fn sample(&self, seed: TaskId) -> SampleResult;
}

/// Sampler real: punto uniforme en `[0,1) x [0,1)` sembrado con ChaCha8.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonteCarloSampler;

impl Sampler for MonteCarloSampler {
    fn sample(&self, seed: TaskId) -> SampleResult {
        sample(seed)
    }
}

pub fn sample(seed: TaskId) -> SampleResult {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.value());
    let x: f64 = rng.random();
    let y: f64 = rng.random();

    SampleResult {
        x,
        y,
        hit: hit_for(x, y),
        seed,
    }
}

/// 4 si `x² + y² <= 1`, si no 0.
pub fn hit_for(x: f64, y: f64) -> u8 {
    if x * x + y * y <= 1.0 {
        HIT
    } else {
        MISS
    }
}
