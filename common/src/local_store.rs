//! Object store sobre un filesystem compartido (volumen `/data` entre master y workers).
//!
//! Layout: `<root>/<bucket>/<key>`. Las escrituras pasan por `<root>/.staging`
//! y se publican con `rename`, así un lector nunca ve un archivo a medias.

use async_trait::async_trait;
use bytes::Bytes;
use glob::{glob, Pattern};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::keys::StorageKey;
use crate::store::ObjectStore;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket == STAGING_DIR || bucket.contains('/') || bucket == ".." {
            return Err(PipelineError::InvalidArgument(format!(
                "bucket {bucket:?} inválido para el store local"
            )));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &StorageKey) -> Result<PathBuf> {
        let mut path = self.bucket_dir(bucket)?;
        path.extend(key.as_str().split('/'));
        Ok(path)
    }
}

fn io_unavailable(what: &str, path: &Path, e: io::Error) -> PipelineError {
    PipelineError::storage_with_source(format!("{what} {}", path.display()), e)
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, bucket: &str, key: &StorageKey, data: Bytes) -> Result<()> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let path = self.object_path(bucket, key)?;

        // Ningún ancestro puede ser un archivo ...
        for ancestor in key.ancestors() {
            let mut p = bucket_dir.clone();
            p.extend(ancestor.split('/'));
            if fs::metadata(&p).await.map(|m| m.is_file()).unwrap_or(false) {
                return Err(PipelineError::invalid_key(
                    key.as_str(),
                    format!("el prefijo {ancestor} ya existe como objeto"),
                ));
            }
        }
        // ... ni la clave misma un directorio.
        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(PipelineError::invalid_key(
                key.as_str(),
                "la clave ya es un prefijo de otros objetos",
            ));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_unavailable("no se pudo crear", parent, e))?;
        }

        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_unavailable("no se pudo crear", &staging, e))?;
        let tmp = staging.join(format!("{}.tmp", uuid::Uuid::new_v4()));

        fs::write(&tmp, &data)
            .await
            .map_err(|e| io_unavailable("error al escribir", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_unavailable("error al publicar", &path, e));
        }

        debug!("put {}/{} ({} bytes)", bucket, key, data.len());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &StorageKey) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(PipelineError::ObjectNotFound(format!("{bucket}/{key}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::ObjectNotFound(format!("{bucket}/{key}")))
            }
            Err(e) => return Err(io_unavailable("error al leer", &path, e)),
        }

        fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| io_unavailable("error al leer", &path, e))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StorageKey>> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let prefix = prefix.trim_matches('/').to_string();

        let mut base = bucket_dir.clone();
        if !prefix.is_empty() {
            base.extend(prefix.split('/'));
        }

        tokio::task::spawn_blocking(move || list_files(&bucket_dir, &base))
            .await
            .map_err(|e| PipelineError::Internal(format!("listado abortado: {e}")))?
    }
}

/// Recorre `base` con glob y devuelve las claves relativas a `bucket_dir`.
fn list_files(bucket_dir: &Path, base: &Path) -> Result<Vec<StorageKey>> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = format!("{}/**/*", Pattern::escape(&base.to_string_lossy()));
    let entries = glob(&pattern)
        .map_err(|e| PipelineError::Internal(format!("patrón de listado inválido: {e}")))?;

    let mut keys = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| {
            PipelineError::storage(format!("error al listar {}: {e}", base.display()))
        })?;
        if !path.is_file() {
            continue;
        }

        let Ok(rel) = path.strip_prefix(bucket_dir) else {
            continue;
        };
        let segments: Option<Vec<&str>> = rel.iter().map(|s| s.to_str()).collect();
        let Some(segments) = segments else {
            warn!("ignorando archivo con nombre no UTF-8: {}", path.display());
            continue;
        };

        match StorageKey::new(segments.join("/")) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("ignorando {}: {}", path.display(), e),
        }
    }

    keys.sort();
    Ok(keys)
}
