//! Errores compartidos por todos los componentes del pipeline.

use thiserror::Error;

use crate::keys::RunId;
use crate::pipeline::RunState;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Argumento inválido (ej: cantidad de semillas <= 0, regex mal formada).
    #[error("argumento inválido: {0}")]
    InvalidArgument(String),

    /// Falla transitoria de transporte contra el object store.
    /// Reintentar es responsabilidad de quien llama.
    #[error("storage no disponible: {message}")]
    StorageUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// La clave no es válida o choca con un prefijo tipo directorio.
    #[error("clave inválida {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("objeto no encontrado: {0}")]
    ObjectNotFound(String),

    /// Cualquier fallo al recolectar/parsear un resultado. Fatal para toda la reducción.
    #[error("fallo de agregación en {key}: {reason}")]
    AggregationFailure { key: String, reason: String },

    #[error("reducción sobre una colección vacía")]
    EmptyInput,

    #[error("error interno: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn storage(message: impl Into<String>) -> Self {
        PipelineError::StorageUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        PipelineError::StorageUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn aggregation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::AggregationFailure {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Sólo los errores de transporte justifican reintentar con la misma clave.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::StorageUnavailable { .. })
    }
}

/// Errores del codec de valores (un número decimal por objeto).
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("valor vacío")]
    Empty,

    #[error("no es un número decimal: {0:?}")]
    NotANumber(String),

    #[error("valor no finito: {0}")]
    NonFinite(f64),

    #[error("el valor no es UTF-8")]
    NotUtf8,
}

/// Resultado fallido de una corrida completa: indica en qué etapa murió.
#[derive(Debug, Error)]
#[error("run {run_id} falló en la etapa {stage}: {source}")]
pub struct RunFailure {
    pub run_id: RunId,
    pub stage: RunState,
    #[source]
    pub source: PipelineError,
}

impl RunFailure {
    pub fn new(run_id: RunId, stage: RunState, source: PipelineError) -> Self {
        Self {
            run_id,
            stage,
            source,
        }
    }
}
