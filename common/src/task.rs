use serde::{Deserialize, Serialize};

use crate::keys::{RunId, StorageKey, TaskId};

/// Id de una asignación concreta (cambia entre corridas, no entre reintentos).
pub type AssignmentId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleTask {
    pub id: AssignmentId,
    pub run_id: RunId,
    pub seed: TaskId,
    pub attempt: u32,

    /// Bucket y clave donde el worker debe dejar el resultado.
    /// Un reintento reutiliza exactamente la misma clave.
    pub bucket: String,
    pub key: StorageKey,
}
