use serde::{Deserialize, Serialize};

use crate::keys::{RunId, StorageKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: RunId,
    pub bucket: String,
    /// Prefijo donde quedaron los objetos de esta corrida
    pub run_prefix: String,
    /// Claves de todos los objetos bajo el prefijo
    pub keys: Vec<StorageKey>,
    /// Valor leído de `<run_prefix>/result.out`, si ya existe
    pub estimate: Option<f64>,
}
