use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{RunContext, RunId, StorageKey};
use crate::pipeline::RunState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub name: String,

    /// Cantidad de semillas (= tareas de muestreo en paralelo)
    pub n_samples: i64,

    /// Prefijo base dentro del bucket; si falta se usa el configurado en el master
    #[serde(default)]
    pub base_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Accepted,
    Running,
    /// Barrera alcanzada, el master está recolectando y reduciendo
    Reducing,
    Failed,
    Succeeded,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,

    /// Última etapa alcanzada; si falló, la etapa que falló
    pub stage: Option<RunState>,

    pub context: RunContext,
    pub n_samples: i64,

    /// -------- Métricas de la corrida --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub retries: u32,

    /// Resultado final (media de los hits) y dónde quedó persistido
    pub estimate: Option<f64>,
    pub final_key: Option<StorageKey>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_sin_prefijo_usa_default() {
        let req: RunRequest = serde_json::from_str(r#"{"name":"pi","n_samples":4}"#).unwrap();
        assert_eq!(req.n_samples, 4);
        assert!(req.base_prefix.is_none());
    }

    #[test]
    fn run_status_viaja_en_mayusculas() {
        assert_eq!(serde_json::to_string(&RunStatus::Reducing).unwrap(), "\"REDUCING\"");
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
