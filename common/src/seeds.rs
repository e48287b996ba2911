use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::keys::TaskId;

/// Desplazamiento fijo que se suma a cada índice `[0, n)`.
pub const SEED_OFFSET: u64 = 10;

/// Tope de semillas por corrida.
pub const MAX_SAMPLES: i64 = 1_000_000;

/// Genera `n` task ids distintos, deterministas: `SEED_OFFSET..SEED_OFFSET+n`.
pub fn generate(n: i64) -> Result<Vec<TaskId>> {
    if n <= 0 {
        return Err(PipelineError::InvalidArgument(format!(
            "la cantidad de semillas debe ser positiva (recibido {n})"
        )));
    }
    if n > MAX_SAMPLES {
        return Err(PipelineError::InvalidArgument(format!(
            "la cantidad de semillas no puede superar {MAX_SAMPLES} (recibido {n})"
        )));
    }

    let seeds: Vec<TaskId> = (0..n as u64).map(|i| TaskId::new(SEED_OFFSET + i)).collect();
    debug!("generadas {} semillas ({}..{})", n, SEED_OFFSET, SEED_OFFSET + n as u64);
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generate_devuelve_n_valores_distintos() {
        for n in [1_i64, 4, 257] {
            let seeds = generate(n).unwrap();
            assert_eq!(seeds.len(), n as usize);
            let unique: HashSet<_> = seeds.iter().collect();
            assert_eq!(unique.len(), n as usize);
        }
    }

    #[test]
    fn generate_es_determinista_y_desplazado() {
        assert_eq!(generate(4).unwrap(), generate(4).unwrap());
        let rendered: Vec<String> = generate(4).unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(rendered, vec!["10", "11", "12", "13"]);
    }

    #[test]
    fn generate_rechaza_cero_negativos_y_exceso() {
        for n in [0, -1, MAX_SAMPLES + 1] {
            assert!(matches!(
                generate(n),
                Err(PipelineError::InvalidArgument(_))
            ));
        }
    }
}
