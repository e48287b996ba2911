//! Interfaz mínima contra el object store y backend en memoria.
//!
//! El filtrado por regex se hace del lado del cliente (ver `collect`), así que
//! a los backends sólo se les pide `put`, `get` y listar por prefijo.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::RwLock,
};

use crate::error::{PipelineError, Result};
use crate::keys::StorageKey;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Escribe el objeto. Reescribir la misma clave con el mismo valor es
    /// observablemente un no-op (last-write-wins).
    async fn put(&self, bucket: &str, key: &StorageKey, data: Bytes) -> Result<()>;

    /// Lee el objeto completo; `ObjectNotFound` si no existe.
    async fn get(&self, bucket: &str, key: &StorageKey) -> Result<Bytes>;

    /// Claves bajo `prefix` (límite de segmento), ordenadas. Vacío si no hay nada.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StorageKey>>;
}

/// Backend en memoria; un `BTreeMap` por bucket.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<StorageKey, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> PipelineError {
    PipelineError::Internal("lock poisoned".into())
}

/// Rechaza claves que pisen el namespace: un ancestro ya es objeto, o la clave
/// ya funciona como "directorio" de otros objetos.
fn check_namespace(objects: &BTreeMap<StorageKey, Bytes>, key: &StorageKey) -> Result<()> {
    if let Some(ancestor) = key.ancestors().find(|a| objects.contains_key(*a)) {
        return Err(PipelineError::invalid_key(
            key.as_str(),
            format!("el prefijo {ancestor} ya existe como objeto"),
        ));
    }

    let dir = format!("{}/", key);
    let under_dir = objects
        .range::<str, _>((Bound::Included(dir.as_str()), Bound::Unbounded))
        .next()
        .is_some_and(|(k, _)| k.as_str().starts_with(&dir));
    if under_dir {
        return Err(PipelineError::invalid_key(
            key.as_str(),
            "la clave ya es un prefijo de otros objetos",
        ));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, bucket: &str, key: &StorageKey, data: Bytes) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(poisoned)?;
        let objects = buckets.entry(bucket.to_string()).or_default();
        check_namespace(objects, key)?;
        objects.insert(key.clone(), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &StorageKey) -> Result<Bytes> {
        let buckets = self.buckets.read().map_err(poisoned)?;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| PipelineError::ObjectNotFound(format!("{bucket}/{key}")))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StorageKey>> {
        let buckets = self.buckets.read().map_err(poisoned)?;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let prefix = prefix.trim_matches('/');
        let keys = objects
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.as_str().starts_with(prefix))
            .filter(|(k, _)| k.relative_to(prefix).is_some())
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }
}
