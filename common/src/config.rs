//! Configuración por variables de entorno (con defaults razonables para Docker).

use std::{env, fmt, path::PathBuf, str::FromStr, sync::Arc};

use crate::error::{PipelineError, Result};
use crate::local_store::LocalStore;
use crate::mc_store::McStore;
use crate::store::{MemoryStore, ObjectStore};

pub const DEFAULT_STORE_ROOT: &str = "/data/store";
pub const DEFAULT_BUCKET: &str = "pipelines";
pub const DEFAULT_BASE_PREFIX: &str = "runs";

/// Lee una variable y la parsea; si falta o no parsea, usa el default.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Local,
    Mc,
}

impl FromStr for StoreBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "local" => Ok(StoreBackend::Local),
            "mc" | "minio" => Ok(StoreBackend::Mc),
            other => Err(PipelineError::InvalidArgument(format!(
                "backend de store desconocido: {other} (memory|local|mc)"
            ))),
        }
    }
}

/// Endpoint y credenciales de MinIO. Se tratan como strings opacos.
#[derive(Clone, PartialEq, Eq)]
pub struct MinioCredentials {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for MinioCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinioCredentials")
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub root: PathBuf,
    pub bucket: String,
    pub base_prefix: String,
    pub mc_bin: String,
    pub mc_alias: String,
    pub minio: Option<MinioCredentials>,
}

impl StoreSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match lookup("STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Local,
        };

        let minio = match (
            lookup("MINIO_ENDPOINT"),
            lookup("MINIO_ACCESS_KEY"),
            lookup("MINIO_SECRET_KEY"),
        ) {
            (Some(endpoint), Some(access_key), Some(secret_key)) => Some(MinioCredentials {
                endpoint,
                access_key,
                secret_key,
            }),
            _ => None,
        };

        if backend == StoreBackend::Mc && minio.is_none() {
            return Err(PipelineError::InvalidArgument(
                "STORE_BACKEND=mc requiere MINIO_ENDPOINT, MINIO_ACCESS_KEY y MINIO_SECRET_KEY".into(),
            ));
        }

        Ok(Self {
            backend,
            root: lookup("STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT)),
            bucket: lookup("STORE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            base_prefix: lookup("BASE_PREFIX").unwrap_or_else(|| DEFAULT_BASE_PREFIX.to_string()),
            mc_bin: lookup("MC_BIN").unwrap_or_else(|| "mc".to_string()),
            mc_alias: lookup("MC_ALIAS").unwrap_or_else(|| "pipelines".to_string()),
            minio,
        })
    }

    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Local => Ok(Arc::new(LocalStore::new(self.root.clone()))),
            StoreBackend::Mc => {
                let credentials = self.minio.clone().ok_or_else(|| {
                    PipelineError::InvalidArgument("faltan credenciales de MinIO".into())
                })?;
                Ok(Arc::new(McStore::new(
                    self.mc_bin.clone(),
                    self.mc_alias.clone(),
                    credentials,
                )?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<StoreSettings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StoreSettings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apuntan_al_volumen_compartido() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.backend, StoreBackend::Local);
        assert_eq!(s.root, PathBuf::from(DEFAULT_STORE_ROOT));
        assert_eq!(s.bucket, DEFAULT_BUCKET);
        assert_eq!(s.base_prefix, DEFAULT_BASE_PREFIX);
        assert!(s.minio.is_none());
    }

    #[test]
    fn backend_mc_exige_credenciales() {
        assert!(settings(&[("STORE_BACKEND", "mc")]).is_err());

        let s = settings(&[
            ("STORE_BACKEND", "minio"),
            ("MINIO_ENDPOINT", "http://minio:9000"),
            ("MINIO_ACCESS_KEY", "AKIA"),
            ("MINIO_SECRET_KEY", "supersecreto"),
        ])
        .unwrap();
        assert_eq!(s.backend, StoreBackend::Mc);
        assert!(s.build_store().is_ok());
    }

    #[test]
    fn backend_desconocido_es_error() {
        assert!(matches!(
            settings(&[("STORE_BACKEND", "s3")]),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn debug_de_credenciales_no_muestra_secretos() {
        let creds = MinioCredentials {
            endpoint: "http://minio:9000".to_string(),
            access_key: "AKIA".to_string(),
            secret_key: "supersecreto".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("http://minio:9000"));
        assert!(!rendered.contains("AKIA"));
        assert!(!rendered.contains("supersecreto"));
    }
}
