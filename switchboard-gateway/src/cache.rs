//! # Configuration Cache
//!
//! In-memory snapshot of the routing entities (models, providers,
//! bindings) so the request hot path never touches the database.
//!
//! The snapshot is rebuilt wholesale. A TTL is checked on every read: the
//! first read (or a read after [`ConfigCache::invalidate`]) blocks until
//! the cache is populated; once populated, an expired read returns the
//! stale snapshot immediately and schedules a background refresh. Two
//! guarantees hold at all times:
//!
//! - **Single-flight**: at most one refresh runs at a time; a reader that
//!   finds a refresh in progress returns immediately.
//! - **Double-check**: the refresh re-reads the TTL after acquiring the
//!   gate and aborts without querying if another refresh already made the
//!   snapshot fresh.
//!
//! A failed or timed-out refresh leaves the snapshot untouched; stale
//! reads are always preferred to errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::gateway_error::GatewayError;
use crate::storage::entities::{Binding, Model, Provider};
use crate::storage::{Store, StorageError};

#[derive(Default)]
struct Snapshot {
    models: HashMap<String, Model>,
    providers: HashMap<i64, Provider>,
    bindings: HashMap<String, Vec<Binding>>,
    refreshed_at: Option<Instant>,
}

impl Snapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.refreshed_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

struct CacheInner {
    store: Store,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    refresh_gate: Arc<Mutex<()>>,
}

impl CacheInner {
    async fn load(store: &Store) -> Result<Snapshot, StorageError> {
        let models = store.load_models().await?;
        let providers = store.load_providers().await?;
        let bindings = store.load_bindings().await?;

        let mut by_model: HashMap<String, Vec<Binding>> = HashMap::new();
        for binding in bindings {
            by_model
                .entry(binding.model_name.clone())
                .or_default()
                .push(binding);
        }

        Ok(Snapshot {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
            providers: providers.into_iter().map(|p| (p.id, p)).collect(),
            bindings: by_model,
            refreshed_at: Some(Instant::now()),
        })
    }
}

/// Shared, hot configuration snapshot. Cheap to clone.
#[derive(Clone)]
pub struct ConfigCache {
    inner: Arc<CacheInner>,
}

impl ConfigCache {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                ttl,
                snapshot: RwLock::new(Snapshot::default()),
                refresh_gate: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Resolve a logical model name to its model record and bindings.
    pub async fn lookup(&self, model_name: &str) -> Result<(Model, Vec<Binding>), GatewayError> {
        self.ensure_fresh().await?;
        let snapshot = self.inner.snapshot.read().await;
        let model = snapshot
            .models
            .get(model_name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotConfigured {
                model: model_name.to_string(),
            })?;
        let bindings = snapshot
            .bindings
            .get(model_name)
            .cloned()
            .unwrap_or_default();
        if bindings.is_empty() {
            return Err(GatewayError::NoBindings {
                model: model_name.to_string(),
            });
        }
        Ok((model, bindings))
    }

    /// Resolve a provider id.
    pub async fn provider(&self, id: i64) -> Result<Provider, GatewayError> {
        self.ensure_fresh().await?;
        let snapshot = self.inner.snapshot.read().await;
        snapshot
            .providers
            .get(&id)
            .cloned()
            .ok_or(GatewayError::ProviderNotConfigured { id })
    }

    /// All configured models, for the model-list endpoint.
    pub async fn models(&self) -> Result<Vec<Model>, GatewayError> {
        self.ensure_fresh().await?;
        let snapshot = self.inner.snapshot.read().await;
        let mut models: Vec<Model> = snapshot.models.values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Drop freshness so the next read reloads before serving. Exposed to
    /// the admin layer; routine admin writes may instead just wait out the
    /// TTL.
    pub async fn invalidate(&self) {
        self.inner.snapshot.write().await.refreshed_at = None;
    }

    async fn ensure_fresh(&self) -> Result<(), GatewayError> {
        let refreshed_at = self.inner.snapshot.read().await.refreshed_at;
        match refreshed_at {
            None => self.refresh_now().await?,
            Some(at) if at.elapsed() >= self.inner.ttl => self.schedule_refresh(),
            _ => {}
        }
        Ok(())
    }

    /// Blocking refresh for the empty-cache path.
    async fn refresh_now(&self) -> Result<(), GatewayError> {
        let _guard = self.inner.refresh_gate.lock().await;
        if self.inner.snapshot.read().await.is_fresh(self.inner.ttl) {
            return Ok(());
        }
        let snapshot = CacheInner::load(&self.inner.store).await?;
        *self.inner.snapshot.write().await = snapshot;
        Ok(())
    }

    /// Fire-and-forget refresh for the stale-but-populated path.
    fn schedule_refresh(&self) {
        let Ok(guard) = Arc::clone(&self.inner.refresh_gate).try_lock_owned() else {
            // A refresh is already in flight; serve stale.
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Held for the whole refresh; dropped on every exit path.
            let _guard: OwnedMutexGuard<()> = guard;

            if inner.snapshot.read().await.is_fresh(inner.ttl) {
                return;
            }

            // A hung query must not pin the gate or leak the task.
            match tokio::time::timeout(inner.ttl, CacheInner::load(&inner.store)).await {
                Ok(Ok(snapshot)) => {
                    *inner.snapshot.write().await = snapshot;
                    tracing::debug!("configuration snapshot refreshed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "configuration refresh failed; serving stale snapshot");
                }
                Err(_) => {
                    tracing::warn!("configuration refresh timed out; serving stale snapshot");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::Capability;
    use crate::storage::test_support::temp_store;
    use switchboard_upstream::Dialect;

    async fn seeded_cache(ttl: Duration) -> (ConfigCache, Store, tempfile::TempDir) {
        let (store, dir) = temp_store().await;

        let provider = store
            .insert_provider("acme", Dialect::OpenAi, r#"{"base_url":"http://localhost:1"}"#)
            .await
            .unwrap();
        let model = store.insert_model("m1", 3, 60).await.unwrap();
        store
            .insert_binding(
                model,
                provider,
                "gpt-test",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();
        store.insert_model("orphan", 1, 10).await.unwrap();

        (ConfigCache::new(store.clone(), ttl), store, dir)
    }

    #[tokio::test]
    async fn lookup_returns_model_and_bindings() {
        let (cache, _store, _dir) = seeded_cache(Duration::from_secs(300)).await;
        let (model, bindings) = cache.lookup("m1").await.unwrap();
        assert_eq!(model.name, "m1");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].upstream_model, "gpt-test");
    }

    #[tokio::test]
    async fn lookup_distinguishes_unknown_from_unbound() {
        let (cache, _store, _dir) = seeded_cache(Duration::from_secs(300)).await;
        assert!(matches!(
            cache.lookup("nope").await,
            Err(GatewayError::ModelNotConfigured { .. })
        ));
        assert!(matches!(
            cache.lookup("orphan").await,
            Err(GatewayError::NoBindings { .. })
        ));
    }

    #[tokio::test]
    async fn provider_lookup_fails_for_unknown_ids() {
        let (cache, _store, _dir) = seeded_cache(Duration::from_secs(300)).await;
        assert!(cache.provider(1).await.is_ok());
        assert!(matches!(
            cache.provider(999).await,
            Err(GatewayError::ProviderNotConfigured { id: 999 })
        ));
    }

    #[tokio::test]
    async fn admin_writes_become_visible_after_invalidate() {
        let (cache, store, _dir) = seeded_cache(Duration::from_secs(300)).await;
        cache.lookup("m1").await.unwrap();

        let provider_id = cache.provider(1).await.unwrap().id;
        let model = store.insert_model("m2", 2, 30).await.unwrap();
        store
            .insert_binding(
                model,
                provider_id,
                "gpt-two",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();

        // Within the TTL the stale snapshot is served.
        assert!(cache.lookup("m2").await.is_err());

        cache.invalidate().await;
        let (model, _) = cache.lookup("m2").await.unwrap();
        assert_eq!(model.name, "m2");
    }

    #[tokio::test]
    async fn expired_reads_serve_stale_and_refresh_in_background() {
        let (cache, store, _dir) = seeded_cache(Duration::from_millis(20)).await;
        cache.lookup("m1").await.unwrap();

        let provider_id = cache.provider(1).await.unwrap().id;
        let model = store.insert_model("m3", 2, 30).await.unwrap();
        store
            .insert_binding(
                model,
                provider_id,
                "gpt-three",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        // This read triggers the background refresh; it may still see the
        // stale snapshot, which is the contract.
        let _ = cache.lookup("m3").await;

        // Eventually the refreshed snapshot lands.
        let mut found = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cache.lookup("m3").await.is_ok() {
                found = true;
                break;
            }
        }
        assert!(found, "background refresh never landed");
    }
}
