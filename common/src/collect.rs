//! Scatter/gather contra el object store: escribir resultados por clave,
//! encontrarlos por patrón y recolectarlos como valores tipados.

use futures::{stream, StreamExt, TryStreamExt};
use regex::Regex;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::codec::{decode_value, encode_value};
use crate::error::{PipelineError, Result};
use crate::keys::StorageKey;
use crate::store::ObjectStore;

/// Patrón por defecto para resultados: nombre exacto, anclado al final.
pub const RESULT_PATTERN: &str = r"(^|/)result\.out$";

/// Patrón histórico de los componentes de búsqueda. No está anclado al final,
/// así que también acepta `result.out.backup`; se conserva tal cual.
pub const LEGACY_RESULT_PATTERN: &str = r".*(^|/)result.out";

const DEFAULT_GATHER_CONCURRENCY: usize = 16;

#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn ObjectStore>,
}

impl ResultSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, bucket: &str, key: &StorageKey, value: f64) -> Result<()> {
        self.store.put(bucket, key, encode_value(value)).await
    }

    /// Igual que `put`, pero reintenta fallas transitorias siempre con la misma clave.
    pub async fn put_with_retry(
        &self,
        bucket: &str,
        key: &StorageKey,
        value: f64,
        attempts: u32,
        backoff: Duration,
    ) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.put(bucket, key, value).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "put de {} falló (intento {}/{}): {}; reintentando",
                        key, attempt, attempts, e
                    );
                    tokio::time::sleep(backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Clone)]
pub struct ResultFinder {
    store: Arc<dyn ObjectStore>,
}

impl ResultFinder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Claves bajo `prefix` cuya ruta relativa al prefijo cumple `pattern`
    /// (búsqueda regex, sin anclaje implícito). Sin coincidencias devuelve vacío.
    pub async fn find(
        &self,
        bucket: &str,
        prefix: &str,
        pattern: &str,
    ) -> Result<BTreeSet<StorageKey>> {
        let re = Regex::new(pattern).map_err(|e| {
            PipelineError::InvalidArgument(format!("patrón {pattern:?} inválido: {e}"))
        })?;

        let listed = self.store.list(bucket, prefix).await?;
        let total = listed.len();
        let found: BTreeSet<StorageKey> = listed
            .into_iter()
            .filter(|key| key.relative_to(prefix).is_some_and(|rel| re.is_match(rel)))
            .collect();

        debug!(
            "find {}/{} ~ {:?}: {} de {} objetos",
            bucket,
            prefix,
            pattern,
            found.len(),
            total
        );
        Ok(found)
    }
}

#[derive(Clone)]
pub struct ResultGatherer {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl ResultGatherer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            concurrency: DEFAULT_GATHER_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Un fetch por clave, en orden de clave. Cualquier fetch o parseo fallido
    /// aborta toda la recolección: nunca se devuelven resultados parciales.
    pub async fn gather(&self, bucket: &str, keys: &BTreeSet<StorageKey>) -> Result<Vec<f64>> {
        let fetches = keys.iter().cloned().map(|key| {
            let store = self.store.clone();
            let bucket = bucket.to_owned();
            async move {
                let raw = store
                    .get(&bucket, &key)
                    .await
                    .map_err(|e| PipelineError::aggregation(key.as_str(), e.to_string()))?;
                decode_value(&raw)
                    .map_err(|e| PipelineError::aggregation(key.as_str(), e.to_string()))
            }
        });

        stream::iter(fetches)
            .buffered(self.concurrency)
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;

    fn key(raw: &str) -> StorageKey {
        StorageKey::new(raw).unwrap()
    }

    async fn store_with(objects: &[(&str, &str)]) -> Arc<dyn ObjectStore> {
        let store = MemoryStore::new();
        for (k, v) in objects {
            store
                .put("b", &key(k), Bytes::from(v.to_string()))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    fn names(found: &BTreeSet<StorageKey>) -> Vec<&str> {
        found.iter().map(|k| k.as_str()).collect()
    }

    #[tokio::test]
    async fn find_excluye_falsos_positivos_de_nombre() {
        let store = store_with(&[
            ("p/result.out", "1"),
            ("p/a/b/result.out", "1"),
            ("p/not_a_result.out", "1"),
            ("p/x/not_a_result.out", "1"),
            ("p/x/result.out.backup", "1"),
        ])
        .await;

        let found = ResultFinder::new(store)
            .find("b", "p", RESULT_PATTERN)
            .await
            .unwrap();
        assert_eq!(names(&found), vec!["p/a/b/result.out", "p/result.out"]);
    }

    #[tokio::test]
    async fn patron_historico_sin_ancla_acepta_backups() {
        let store = store_with(&[
            ("p/x/result.out.backup", "1"),
            ("p/not_a_result.out", "1"),
            ("p/result.out", "1"),
        ])
        .await;

        let found = ResultFinder::new(store)
            .find("b", "p", LEGACY_RESULT_PATTERN)
            .await
            .unwrap();
        assert_eq!(names(&found), vec!["p/result.out", "p/x/result.out.backup"]);
    }

    #[tokio::test]
    async fn find_se_evalua_relativo_al_prefijo() {
        // "result.out" como nombre del prefijo no debe contar
        let store = store_with(&[("result.out/otro", "1"), ("result.out2/result.out", "1")]).await;
        let finder = ResultFinder::new(store);

        assert!(finder.find("b", "result.out", RESULT_PATTERN).await.unwrap().is_empty());
        assert!(finder.find("b", "nada", RESULT_PATTERN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_con_regex_invalida_es_invalid_argument() {
        let store = store_with(&[]).await;
        assert!(matches!(
            ResultFinder::new(store).find("b", "", "(").await,
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn gather_parsea_en_orden_de_clave() {
        let store = store_with(&[("s/12", "0"), ("s/10", "4"), ("s/11", "4.0\n")]).await;
        let keys: BTreeSet<_> = ["s/10", "s/11", "s/12"].iter().map(|k| key(k)).collect();

        let values = ResultGatherer::new(store).gather("b", &keys).await.unwrap();
        assert_eq!(values, vec![4.0, 4.0, 0.0]);
    }

    #[tokio::test]
    async fn gather_falla_entero_si_un_valor_no_parsea() {
        let store = store_with(&[("s/10", "4"), ("s/11", "cuatro")]).await;
        let keys: BTreeSet<_> = ["s/10", "s/11"].iter().map(|k| key(k)).collect();

        let err = ResultGatherer::new(store).gather("b", &keys).await.unwrap_err();
        match err {
            PipelineError::AggregationFailure { key, .. } => assert_eq!(key, "s/11"),
            other => panic!("esperaba AggregationFailure, fue {other:?}"),
        }
    }

    #[tokio::test]
    async fn gather_falla_entero_si_falta_un_objeto() {
        let store = store_with(&[("s/10", "4")]).await;
        let keys: BTreeSet<_> = ["s/10", "s/99"].iter().map(|k| key(k)).collect();

        assert!(matches!(
            ResultGatherer::new(store).with_concurrency(1).gather("b", &keys).await,
            Err(PipelineError::AggregationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn sink_escribe_el_valor_codificado() {
        let store = store_with(&[]).await;
        let sink = ResultSink::new(store.clone());
        let k = key("r/result.out");

        sink.put("b", &k, 2.0).await.unwrap();
        sink.put("b", &k, 2.0).await.unwrap();

        assert_eq!(&store.get("b", &k).await.unwrap()[..], b"2");
        assert_eq!(store.list("b", "").await.unwrap().len(), 1);
    }
}
