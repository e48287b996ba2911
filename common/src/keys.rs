//! Identificadores de corrida y claves de almacenamiento.
//!
//! Todas las claves de una corrida se derivan de un [`RunContext`] a través de
//! [`key_for`] y [`final_key`]; nadie arma rutas concatenando strings a mano.
//!
//! Layout en el object store:
//!
//! ```text
//! <base_prefix>/<run_id>/seeds/<task_id>/result.out   (un float por archivo)
//! <base_prefix>/<run_id>/result.out                   (resultado final)
//! ```

use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

use crate::error::{PipelineError, Result};

/// Nombre del objeto que escribe cada muestra y el resultado final.
pub const RESULT_FILE: &str = "result.out";

/// Segmento bajo el cual cuelgan los resultados por semilla.
pub const SEEDS_SEGMENT: &str = "seeds";

/// Unidad de trabajo paralela y fragmento de clave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identificador único por corrida; se usa como token de namespacing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        validate_segment(raw).map_err(|reason| PipelineError::invalid_key(raw, reason))?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clave de un objeto: ruta relativa al bucket, segmentos separados por '/'.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_path(&raw).map_err(|reason| PipelineError::invalid_key(&raw, reason))?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ruta relativa a `prefix`, respetando límites de segmento.
    /// `None` si la clave no cuelga de ese prefijo.
    pub fn relative_to(&self, prefix: &str) -> Option<&str> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Some(&self.0);
        }
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Prefijos "tipo directorio" de la clave, del más corto al más largo.
    /// Para `a/b/c` devuelve `a` y `a/b`.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> + '_ {
        self.0
            .match_indices('/')
            .map(move |(idx, _)| &self.0[..idx])
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Permite buscar en mapas indexados por StorageKey usando &str.
impl Borrow<str> for StorageKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Contexto explícito de una corrida que viaja por todos los componentes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub base_prefix: String,
    pub bucket: String,
}

impl RunContext {
    /// Crea un contexto con un run id nuevo.
    pub fn new(bucket: &str, base_prefix: &str) -> Result<Self> {
        Self::with_run_id(bucket, base_prefix, RunId::generate())
    }

    pub fn with_run_id(bucket: &str, base_prefix: &str, run_id: RunId) -> Result<Self> {
        validate_segment(bucket).map_err(|reason| {
            PipelineError::InvalidArgument(format!("bucket {bucket:?} inválido: {reason}"))
        })?;

        let base_prefix = base_prefix.trim_matches('/');
        if !base_prefix.is_empty() {
            validate_path(base_prefix).map_err(|reason| {
                PipelineError::InvalidArgument(format!("prefijo {base_prefix:?} inválido: {reason}"))
            })?;
        }

        Ok(Self {
            run_id,
            base_prefix: base_prefix.to_string(),
            bucket: bucket.to_string(),
        })
    }

    /// `<base_prefix>/<run_id>`
    pub fn run_prefix(&self) -> String {
        if self.base_prefix.is_empty() {
            self.run_id.to_string()
        } else {
            format!("{}/{}", self.base_prefix, self.run_id)
        }
    }

    /// `<base_prefix>/<run_id>/seeds`
    pub fn seeds_prefix(&self) -> String {
        format!("{}/{}", self.run_prefix(), SEEDS_SEGMENT)
    }
}

/// Única función que deriva la clave de una tarea dentro de una corrida.
pub fn key_for(ctx: &RunContext, task_id: TaskId, suffix: &str) -> Result<StorageKey> {
    StorageKey::new(format!("{}/{}/{}", ctx.seeds_prefix(), task_id, suffix))
}

/// Clave del resultado final de la corrida.
pub fn final_key(ctx: &RunContext) -> Result<StorageKey> {
    StorageKey::new(format!("{}/{}", ctx.run_prefix(), RESULT_FILE))
}

fn validate_segment(segment: &str) -> std::result::Result<(), String> {
    if segment.is_empty() {
        return Err("segmento vacío".to_string());
    }
    if segment == "." || segment == ".." {
        return Err(format!("segmento reservado {segment:?}"));
    }
    if segment.contains('/') {
        return Err("un segmento no puede contener '/'".to_string());
    }
    if segment.chars().any(|c| c.is_control()) {
        return Err("caracteres de control no permitidos".to_string());
    }
    Ok(())
}

fn validate_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("clave vacía".to_string());
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err("no puede empezar ni terminar con '/'".to_string());
    }
    path.split('/').try_for_each(validate_segment)
}
