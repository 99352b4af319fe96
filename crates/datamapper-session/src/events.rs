//! Process-wide notification events.
//!
//! Two events are raised: "entity updated" after each successful save or
//! delete, and "cache refreshed" after a bulk or global invalidation.
//! Handlers run in registration order, one at a time, and the firing call
//! returns only after the last handler finished.

use std::any::TypeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use datamapper_core::EntityRef;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityChange {
    Inserted,
    Updated,
    Deleted,
}

/// Payload of the "entity updated" event.
#[derive(Debug, Clone)]
pub struct EntityUpdated {
    /// State after the write (for deletes, the state that was deleted).
    pub entity: EntityRef,
    pub change: EntityChange,
}

/// Payload of the "cache refreshed" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRefreshed {
    /// Types whose cached state was dropped; empty means everything.
    pub entity_types: Vec<TypeId>,
}

type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Ordered, awaitable handler lists for both events.
pub struct NotificationHub {
    entity_updated: RwLock<Vec<Handler<EntityUpdated>>>,
    cache_refreshed: RwLock<Vec<Handler<CacheRefreshed>>>,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("entity_updated", &read(&self.entity_updated).len())
            .field("cache_refreshed", &read(&self.cache_refreshed).len())
            .finish()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            entity_updated: RwLock::new(Vec::new()),
            cache_refreshed: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for "entity updated".
    pub fn on_entity_updated<H, Fut>(&self, handler: H)
    where
        H: Fn(EntityUpdated) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entity_updated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(move |event| Box::pin(handler(event))));
    }

    /// Register a handler for "cache refreshed".
    pub fn on_cache_refreshed<H, Fut>(&self, handler: H)
    where
        H: Fn(CacheRefreshed) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cache_refreshed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(move |event| Box::pin(handler(event))));
    }

    /// Run every "entity updated" handler in order. Returns how many ran.
    pub async fn fire_entity_updated(&self, event: EntityUpdated) -> usize {
        // Handlers registered while firing wait for the next event.
        let handlers = read(&self.entity_updated);
        tracing::trace!(handlers = handlers.len(), change = ?event.change, "firing entity updated");
        for handler in &handlers {
            handler(event.clone()).await;
        }
        handlers.len()
    }

    /// Run every "cache refreshed" handler in order. Returns how many ran.
    pub async fn fire_cache_refreshed(&self, event: CacheRefreshed) -> usize {
        let handlers = read(&self.cache_refreshed);
        tracing::trace!(handlers = handlers.len(), "firing cache refreshed");
        for handler in &handlers {
            handler(event.clone()).await;
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use datamapper_core::{Entity, Value};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Probe(i64);

    impl Entity for Probe {
        fn id(&self) -> Value {
            Value::BigInt(self.0)
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let hub = NotificationHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            hub.on_entity_updated(move |event| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push((tag, event.change));
                }
            });
        }

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let ran = rt.block_on(hub.fire_entity_updated(EntityUpdated {
            entity: Arc::new(Probe(1)),
            change: EntityChange::Inserted,
        }));

        assert_eq!(ran, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("first", EntityChange::Inserted),
                ("second", EntityChange::Inserted),
                ("third", EntityChange::Inserted)
            ]
        );
    }

    #[test]
    fn test_cache_refreshed_without_handlers() {
        let hub = NotificationHub::new();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let ran = rt.block_on(hub.fire_cache_refreshed(CacheRefreshed {
            entity_types: Vec::new(),
        }));
        assert_eq!(ran, 0);
    }
}
