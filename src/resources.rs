//! Process-wide cache of expensive, stateless models
//!
//! Resources are loaded at most once per process and handed out as shared
//! read-only references. A worker fills the cache during prewarm, before any
//! job is accepted, so sessions never pay the cold-start cost.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::OnceCell;

use crate::{Error, Result};

/// A loaded, immutable model instance
pub type SharedResource = Arc<dyn Any + Send + Sync>;

/// Lazily-initialized, process-wide resource holder
///
/// The first caller for a given name runs the loader while concurrent callers
/// wait on the same slot; every later caller gets the already-loaded instance.
#[derive(Default)]
pub struct SharedResourceCache {
    slots: Mutex<HashMap<String, Arc<OnceCell<SharedResource>>>>,
}

impl SharedResourceCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a resource, running `loader` only if no instance exists yet
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceLoad`] if the loader fails. The slot stays
    /// empty, so the failure is visible to the caller rather than masked by a
    /// degraded instance.
    pub async fn load<F, Fut>(&self, name: &str, loader: F) -> Result<SharedResource>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedResource>>,
    {
        let slot = self.slot(name);

        let resource = slot
            .get_or_try_init(|| async {
                let started = Instant::now();
                tracing::info!(resource = name, "loading shared resource");

                let loaded = loader().await.map_err(|e| match e {
                    Error::ResourceLoad { .. } => e,
                    other => Error::ResourceLoad {
                        name: name.to_string(),
                        reason: other.to_string(),
                    },
                })?;

                tracing::info!(
                    resource = name,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "shared resource loaded"
                );
                Ok::<_, Error>(loaded)
            })
            .await?;

        Ok(Arc::clone(resource))
    }

    /// Typed variant of [`Self::load`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceLoad`] if the loader fails or if a resource
    /// of a different type is already registered under `name`.
    pub async fn load_as<T, F, Fut>(&self, name: &str, loader: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let resource = self
            .load(name, || async move {
                let value = loader().await?;
                Ok(Arc::new(value) as SharedResource)
            })
            .await?;

        resource.downcast::<T>().map_err(|_| Error::ResourceLoad {
            name: name.to_string(),
            reason: format!("resource is not a {}", std::any::type_name::<T>()),
        })
    }

    /// Get an already-loaded resource
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedResource> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(name).and_then(|slot| slot.get().cloned())
    }

    /// Get an already-loaded resource as a concrete type
    #[must_use]
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|r| r.downcast::<T>().ok())
    }

    /// Names of all loaded resources
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of loaded resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.names().len()
    }

    /// Whether nothing has been loaded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, name: &str) -> Arc<OnceCell<SharedResource>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(name.to_string()).or_default())
    }
}

impl std::fmt::Debug for SharedResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResourceCache")
            .field("loaded", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Model {
        weights: Vec<f32>,
    }

    #[tokio::test]
    async fn concurrent_loads_run_loader_once() {
        let cache = Arc::new(SharedResourceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .load_as("vad", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Model {
                            weights: vec![0.5; 4],
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut loaded = Vec::new();
        for handle in handles {
            loaded.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(loaded.iter().all(|m| Arc::ptr_eq(m, &loaded[0])));
        assert_eq!(loaded[0].weights.len(), 4);
    }

    #[tokio::test]
    async fn later_callers_reuse_instance() {
        let cache = SharedResourceCache::new();
        let first = cache
            .load_as("vad", || async { Ok(Model { weights: vec![1.0] }) })
            .await
            .unwrap();
        let reloads = AtomicUsize::new(0);
        let second = cache
            .load_as("vad", || async {
                reloads.fetch_add(1, Ordering::SeqCst);
                Ok(Model { weights: vec![2.0] })
            })
            .await
            .unwrap();

        assert_eq!(reloads.load(Ordering::SeqCst), 0);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get_as::<Model>("vad").is_some());
        assert_eq!(cache.names(), vec!["vad".to_string()]);
    }

    #[tokio::test]
    async fn load_failure_propagates() {
        let cache = SharedResourceCache::new();
        let err = cache
            .load_as("vad", || async {
                Err::<Model, _>(Error::Config("model file missing".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ResourceLoad { ref name, .. } if name == "vad"));
        assert!(cache.get("vad").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let cache = SharedResourceCache::new();
        cache
            .load_as("vad", || async { Ok(Model { weights: vec![] }) })
            .await
            .unwrap();

        let err = cache
            .load_as::<String, _, _>("vad", || async { Ok(String::new()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resource is not a"));
    }
}
