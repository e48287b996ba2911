use crate::error::{PipelineError, Result};

/// Media aritmética. Falla con `EmptyInput` en vez de dividir por cero.
pub fn reduce(values: &[f64]) -> Result<f64> {
    if values.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let sum: f64 = values.iter().sum();
    Ok(sum / values.len() as f64)
}
